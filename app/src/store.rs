//! Persistent epoch log. Certificates are appended in order under their
//! big-endian epoch number, so an iterator over the tree replays history
//! oldest first.

use crate::config::FederationSpec;
use crate::consensus::EpochCertificate;
use crate::error::Error;
use bridge::sled;

pub struct EpochStore {
    tree: sled::Tree,
    meta: sled::Tree,
    // kept alive for the trees' lifetime
    _db: sled::Db,
}

impl EpochStore {
    pub fn open(path: &str) -> Result<Self, Error> {
        let db = sled::open(path).map_err(|_| Error::DbError)?;
        Self::with_db(db)
    }

    pub fn open_temporary() -> Result<Self, Error> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|_| Error::DbError)?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self, Error> {
        let tree = db.open_tree("epochs").map_err(|_| Error::DbError)?;
        let meta = db.open_tree("meta").map_err(|_| Error::DbError)?;
        Ok(EpochStore { tree, meta, _db: db })
    }

    /// Pin the federation spec on first launch. A store created under one
    /// spec refuses to open under a different one, since replaying its
    /// epochs against other keys would rebuild garbage.
    pub fn check_spec(&self, spec: &FederationSpec) -> Result<(), Error> {
        let encoded = rmp_serde::to_vec(spec)?;
        match self.meta.get(b"spec").map_err(|_| Error::DbError)? {
            Some(stored) if stored.as_ref() == encoded.as_slice() => Ok(()),
            Some(_) => Err(Error::SpecChanged),
            None => {
                self.meta
                    .insert(b"spec", encoded)
                    .map_err(|_| Error::DbError)?;
                Ok(())
            }
        }
    }

    /// Append the certificate for the next epoch. Gaps are rejected; the
    /// log must stay contiguous for replay to reconstruct state.
    pub fn append(&self, certificate: &EpochCertificate) -> Result<(), Error> {
        let epoch = certificate.epoch();
        match self.last_epoch()? {
            None if epoch != 0 => return Err(Error::WrongEpoch),
            Some(last) if epoch != last + 1 => return Err(Error::WrongEpoch),
            _ => {}
        }
        let value = rmp_serde::to_vec(certificate)?;
        self.tree
            .insert(epoch.to_be_bytes(), value)
            .map_err(|_| Error::DbError)?;
        Ok(())
    }

    pub fn get(&self, epoch: u64) -> Result<Option<EpochCertificate>, Error> {
        match self.tree.get(epoch.to_be_bytes()).map_err(|_| Error::DbError)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn last_epoch(&self) -> Result<Option<u64>, Error> {
        match self.tree.last().map_err(|_| Error::DbError)? {
            Some((key, _)) => {
                let key: [u8; 8] = key.as_ref().try_into().map_err(|_| Error::DbError)?;
                Ok(Some(u64::from_be_bytes(key)))
            }
            None => Ok(None),
        }
    }

    /// All stored certificates, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = Result<EpochCertificate, Error>> + '_ {
        self.tree.iter().map(|entry| {
            let (_, value) = entry.map_err(|_| Error::DbError)?;
            Ok(rmp_serde::from_slice(&value)?)
        })
    }
}
