use bdk::bitcoin::key::UntweakedPublicKey;
use bdk::miniscript::ToPublicKey;
pub use bdk::sled::{self, Tree};
pub use bdk::FeeRate;
pub use bitcoin::secp256k1::{PublicKey, SecretKey};

use crate::bitcoin;
use crate::Error;
use bdk::database::Database;
use bdk::wallet::coin_selection::{BranchAndBoundCoinSelection, CoinSelectionAlgorithm, Excess};
use bdk::{KeychainKind, LocalUtxo, WeightedUtxo};
use bitcoin::absolute::LockTime;
use bitcoin::key::KeyPair;
use bitcoin::opcodes::all;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{
    schnorr::Signature as SchnorrSignature, All, Message, Secp256k1, XOnlyPublicKey,
};
use bitcoin::sighash::{Prevouts, ScriptPath, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, Signature as SchnorrSig, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid, Witness};
use bitcoincore_rpc::bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::str::FromStr;

/// The federation's shared on-chain identity: a taproot output whose script
/// path is a t-of-n CHECKSIGADD multisig over the members' keys. Key path
/// spending is disabled with the bip341 nothing-up-my-sleeve point.
#[derive(Clone, Debug)]
pub struct FederationDescriptor {
    pub deposit_address: Address,
    spend_info: TaprootSpendInfo,
    redeem_script: ScriptBuf,
    threshold: usize,
    pubkeys: Vec<PublicKey>,
    pub satisfaction_weight: usize,
}

impl FederationDescriptor {
    fn unspendable_pubkey() -> UntweakedPublicKey {
        // lift_x(0x50929...) from bip341; no key path spend exists for it
        let x_coord = "50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";
        XOnlyPublicKey::from_str(x_coord).expect("static key is valid")
    }

    pub fn new(pubkeys: Vec<PublicKey>, threshold: usize, network: Network) -> Self {
        let secp = Secp256k1::new();
        let internal_pubkey = Self::unspendable_pubkey();

        let redeem_script = pubkeys
            .iter()
            .enumerate()
            .fold(Builder::new(), |builder, (idx, pubkey)| {
                builder
                    .push_x_only_key(&(*pubkey).into())
                    .push_opcode(if idx == 0 {
                        all::OP_CHECKSIG
                    } else {
                        all::OP_CHECKSIGADD
                    })
            })
            .push_int(threshold as i64)
            .push_opcode(all::OP_GREATERTHANOREQUAL)
            .into_script();

        let spend_info = TaprootBuilder::with_huffman_tree(vec![(1, redeem_script.clone())])
            .expect("single leaf always fits")
            .finalize(&secp, internal_pubkey)
            .expect("tree is complete");

        let deposit_address = Address::p2tr(
            &secp,
            spend_info.internal_key(),
            spend_info.merkle_root(),
            network,
        );

        // weight of a fully satisfied input, needed for coin selection:
        // t signatures, n - t empty slots, script and control block
        let satisfaction_weight = {
            let num_omitted_sigs = pubkeys.len() - threshold;

            let control = spend_info
                .control_block(&(redeem_script.clone(), LeafVersion::TapScript))
                .expect("script is in the tree")
                .serialize();
            let script_bytes = redeem_script.to_bytes();

            let non_empty_sigs = (0..threshold).map(|i| {
                SchnorrSig {
                    sig: SchnorrSignature::from_slice(&[i as u8; 64])
                        .expect("64 bytes is a valid signature encoding"),
                    hash_ty: TapSighashType::Default,
                }
                .to_vec()
            });

            let empty_sigs = (0..num_omitted_sigs).map(|_| vec![]);
            let all_witnesses = non_empty_sigs
                .chain(empty_sigs)
                .chain(vec![control, script_bytes])
                .collect::<Vec<_>>();

            let txin = TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: bitcoin::Sequence(0xFFFFFFFF),
                witness: Witness::from_slice(&all_witnesses),
            };
            txin.segwit_weight()
        };

        Self {
            deposit_address,
            spend_info,
            redeem_script,
            pubkeys,
            threshold,
            satisfaction_weight,
        }
    }

    pub fn deposit_script(&self) -> ScriptBuf {
        self.deposit_address.script_pubkey()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn control_block_witness(&self) -> Vec<u8> {
        self.spend_info
            .control_block(&(self.redeem_script.clone(), LeafVersion::TapScript))
            .expect("script is in the tree")
            .serialize()
    }
}

/// Tracks the federation's on-chain funds. Every member runs one of these
/// over the agreed deposit and spend history, so UTXO state is itself a
/// consensus outcome, never a local wallet scan.
pub struct UtxoTracker<T: Database> {
    tree: T,
    descriptor: FederationDescriptor,
    secp: Secp256k1<All>,
}

impl UtxoTracker<Tree> {
    pub fn open(db_path: &str, descriptor: FederationDescriptor) -> Result<Self, Error> {
        let db = sled::open(db_path).map_err(|_| Error::DbError)?;
        let tree = db.open_tree("wallet").map_err(|_| Error::DbError)?;
        Ok(Self {
            tree,
            descriptor,
            secp: Secp256k1::new(),
        })
    }
}

impl<T: Database> UtxoTracker<T> {
    const TRANSACTION_VERSION: i32 = 2;
    const LOCK_TIME: LockTime = LockTime::ZERO;

    pub fn new_with_db(db: T, descriptor: FederationDescriptor) -> Self {
        Self {
            tree: db,
            descriptor,
            secp: Secp256k1::new(),
        }
    }

    /// Record outputs paying the federation. Signing only adds witnesses,
    /// so outpoints of an unsigned transaction are already final.
    fn register_outputs_from(&mut self, transaction: &Transaction) -> Result<(), Error> {
        let deposit_script = self.descriptor.deposit_script();
        let outputs_to_federation = transaction
            .output
            .iter()
            .enumerate()
            .filter(|(_, txout)| txout.script_pubkey == deposit_script);

        for (vout, txout) in outputs_to_federation {
            let utxo = LocalUtxo {
                txout: txout.clone(),
                outpoint: OutPoint {
                    txid: transaction.txid(),
                    vout: vout as u32,
                },
                is_spent: false,
                keychain: KeychainKind::External,
            };
            self.tree.set_utxo(&utxo).map_err(|_| Error::DbError)?;
        }

        Ok(())
    }

    /// Register a confirmed deposit, making its federation outputs
    /// spendable.
    pub fn register_deposit(&mut self, transaction: &Transaction) -> Result<(), Error> {
        self.tree
            .set_raw_tx(transaction)
            .map_err(|_| Error::DbError)?;
        self.register_outputs_from(transaction)
    }

    /// Register an agreed withdrawal. Marks its inputs spent and records
    /// the change output. Accepts the unsigned transaction.
    pub fn register_spend(&mut self, transaction: &Transaction) -> Result<(), Error> {
        self.tree
            .set_raw_tx(transaction)
            .map_err(|_| Error::DbError)?;

        for input in transaction.input.iter() {
            let mut utxo = self
                .tree
                .get_utxo(&input.previous_output)
                .map_err(|_| Error::DbError)?
                .ok_or(Error::UnknownOrSpentInput)?;
            utxo.is_spent = true;
            self.tree.set_utxo(&utxo).map_err(|_| Error::DbError)?;
        }

        self.register_outputs_from(transaction)
    }

    /// Build the withdrawal transaction paying `outputs`. Network fees are
    /// deducted pro rata from the withdrawal outputs; the federation never
    /// pays fees out of other depositors' funds.
    pub fn create_pegout_tx(
        &mut self,
        outputs: Vec<TxOut>,
        fee_rate: FeeRate,
    ) -> Result<Transaction, Error> {
        let num_pegouts = outputs.len() as u64;
        if num_pegouts == 0 {
            return Err(Error::InvalidPegoutOutputCount);
        }

        let utxos = self
            .tree
            .iter_utxos()
            .map_err(|_| Error::DbError)?
            .into_iter()
            .filter(|utxo| !utxo.is_spent)
            .map(|utxo| WeightedUtxo {
                satisfaction_weight: self.descriptor.satisfaction_weight,
                utxo: bdk::Utxo::Local(utxo),
            })
            .collect();

        let mut tx = Transaction {
            version: Self::TRANSACTION_VERSION,
            lock_time: Self::LOCK_TIME,
            input: vec![],
            output: outputs,
        };

        let total_out_value: u64 = tx.output.iter().map(|x| x.value).sum();

        let selected = BranchAndBoundCoinSelection::default()
            .coin_select(
                &self.tree,
                vec![],
                utxos,
                fee_rate,
                total_out_value,
                &self.descriptor.deposit_script(),
            )
            .map_err(|_| Error::InsufficientFunds)?;

        tx.input = selected
            .selected
            .into_iter()
            .map(|x| TxIn {
                previous_output: x.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            })
            .collect();

        if let Excess::Change { amount, fee: _ } = selected.excess {
            tx.output.push(TxOut {
                script_pubkey: self.descriptor.deposit_script(),
                value: amount,
            });
        }

        // deduct fees from the withdrawal outputs, rounding up
        let total_fee = fee_rate.fee_wu(tx.weight());
        let fee_per_output = (total_fee + num_pegouts - 1) / num_pegouts;
        for output in tx.output.iter_mut().take(num_pegouts as usize) {
            output.value = output
                .value
                .checked_sub(fee_per_output)
                .ok_or(Error::FeeExceedsOutput)?;
        }

        Ok(tx)
    }

    /// Validate a proposed withdrawal against what this member expects:
    /// the required outputs in order, optionally followed by change back
    /// to the federation, spending only known unspent inputs. Output
    /// values may only be lower than required, never higher, since fees
    /// are deducted from them.
    pub fn check_pegout_proposal(
        &self,
        required_outputs: Vec<TxOut>,
        proposal: Option<&Transaction>,
    ) -> Result<(), Error> {
        let tx = match proposal {
            None if required_outputs.is_empty() => return Ok(()),
            None => return Err(Error::MissingPegoutProposal),
            Some(proposal) => proposal,
        };

        let actual_outputs = &tx.output;

        if actual_outputs.len() == required_outputs.len() + 1 {
            let change = actual_outputs.last().ok_or(Error::InvalidPegoutOutputCount)?;
            if change.script_pubkey != self.descriptor.deposit_script() {
                return Err(Error::InvalidChangeOutput);
            }
        } else if actual_outputs.len() != required_outputs.len() {
            return Err(Error::InvalidPegoutOutputCount);
        }

        if required_outputs
            .into_iter()
            .zip(actual_outputs.iter())
            .any(|(ref required, actual)| {
                required.script_pubkey != actual.script_pubkey || actual.value > required.value
            })
        {
            return Err(Error::InvalidPegoutOutput);
        }

        for input in tx.input.iter() {
            if !self.has_spendable_utxo(input.previous_output)? {
                return Err(Error::UnspendableInput);
            }
        }

        if tx.lock_time != Self::LOCK_TIME || tx.version != Self::TRANSACTION_VERSION {
            return Err(Error::InvalidTransactionHeader);
        }

        Ok(())
    }

    pub fn get_transaction(&self, txid: &Txid) -> Result<Transaction, Error> {
        self.tree
            .get_raw_tx(txid)
            .map_err(|_| Error::DbError)?
            .ok_or(Error::TxidNotFound)
    }

    pub fn balance(&self) -> Result<u64, Error> {
        Ok(self
            .tree
            .iter_utxos()
            .map_err(|_| Error::DbError)?
            .into_iter()
            .filter(|utxo| !utxo.is_spent)
            .map(|utxo| utxo.txout.value)
            .sum())
    }

    pub fn has_spendable_utxo(&self, outpoint: OutPoint) -> Result<bool, Error> {
        Ok(self
            .tree
            .get_utxo(&outpoint)
            .map_err(|_| Error::DbError)?
            .map(|x| !x.is_spent)
            .unwrap_or(false))
    }

    /// The taproot script-spend sighashes, one per input, that members
    /// sign over.
    pub fn signing_messages(&self, transaction: &Transaction) -> Result<Vec<Message>, Error> {
        let prevouts = transaction
            .input
            .iter()
            .map(|x| {
                self.tree
                    .get_utxo(&x.previous_output)
                    .map_err(|_| Error::DbError)?
                    .ok_or(Error::UnknownOrSpentInput)
                    .map(|x| x.txout)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let prevouts = Prevouts::All(&prevouts);

        let mut sighash_cache = SighashCache::new(transaction);

        transaction
            .input
            .iter()
            .enumerate()
            .map(|(idx, _input)| {
                let sighash = sighash_cache
                    .taproot_script_spend_signature_hash(
                        idx,
                        &prevouts,
                        ScriptPath::with_defaults(&self.descriptor.redeem_script),
                        TapSighashType::Default,
                    )
                    .map_err(|_| Error::UnknownOrSpentInput)?;
                Message::from_slice(&sighash.as_byte_array()[..])
                    .map_err(|_| Error::IncorrectSignature)
            })
            .collect()
    }

    /// Verify one member's signatures over every input of a withdrawal.
    pub fn check_member_signatures(
        &self,
        transaction: &Transaction,
        signatures: &MemberSignatures,
    ) -> Result<(), Error> {
        let signing_messages = self.signing_messages(transaction)?;

        if signing_messages.len() != signatures.1.len() {
            return Err(Error::InvalidNumberOfSignatures);
        }

        let pubkey = &signatures.0.to_x_only_pubkey();

        let is_ok = signing_messages
            .iter()
            .zip(signatures.1.iter())
            .all(|(msg, sig)| self.secp.verify_schnorr(sig, msg, pubkey).is_ok());

        if is_ok {
            Ok(())
        } else {
            Err(Error::IncorrectSignature)
        }
    }

    /// Full witness verification of a finalized withdrawal before
    /// broadcast.
    pub fn check_transaction_signatures(&self, transaction: &Transaction) -> Result<(), Error> {
        let signing_messages = self.signing_messages(transaction)?;
        for (msg, input) in signing_messages.iter().zip(transaction.input.iter()) {
            let witnesses = input.witness.to_vec();

            let sigs = witnesses
                .iter()
                .zip(self.descriptor.pubkeys.iter().rev())
                .filter(|(witness, _)| !witness.is_empty())
                .collect::<Vec<_>>();

            if witnesses.len() != self.descriptor.pubkeys.len() + 2
                || sigs.len() != self.descriptor.threshold
            {
                return Err(Error::InvalidWitnessLength);
            }

            for (witness, pubkey) in sigs {
                let sig =
                    SchnorrSignature::from_slice(witness).map_err(|_| Error::IncorrectSignature)?;
                self.secp
                    .verify_schnorr(&sig, msg, &pubkey.to_x_only_pubkey())
                    .map_err(|_| Error::IncorrectSignature)?;
            }

            let expected_tail = vec![
                self.descriptor.redeem_script.to_bytes(),
                self.descriptor.control_block_witness(),
            ];
            let actual_tail = witnesses
                .into_iter()
                .skip(self.descriptor.pubkeys.len())
                .collect::<Vec<_>>();
            if expected_tail != actual_tail {
                return Err(Error::InvalidWitnessScript);
            }
        }
        Ok(())
    }
}

/// One member's schnorr signatures over every input of a withdrawal,
/// in input order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberSignatures(pub PublicKey, pub Vec<SchnorrSignature>);

/// A member's taproot signing key for the withdrawal multisig.
pub struct MemberSigner {
    pub keypair: KeyPair,
    secp: Secp256k1<All>,
}

impl MemberSigner {
    pub fn new(private_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        Self {
            keypair: KeyPair::from_secret_key(&secp, &private_key),
            secp,
        }
    }

    pub fn sign_pegout<T: Database>(
        &self,
        tracker: &UtxoTracker<T>,
        transaction: &Transaction,
    ) -> Result<MemberSignatures, Error> {
        let signatures = tracker
            .signing_messages(transaction)?
            .into_iter()
            .map(|msg| self.secp.sign_schnorr(&msg, &self.keypair))
            .collect();

        Ok(MemberSignatures(self.keypair.public_key(), signatures))
    }
}

/// A withdrawal gathering member signatures until the threshold is met.
pub struct PartiallySignedPegOut {
    unsigned_transaction: Transaction,
    verified_signatures: HashMap<PublicKey, Vec<SchnorrSignature>>,
}

impl PartiallySignedPegOut {
    pub fn new(unsigned_transaction: Transaction) -> Self {
        Self {
            unsigned_transaction,
            verified_signatures: HashMap::new(),
        }
    }

    fn get_sigs_for_input(
        &self,
        input_idx: usize,
        pubkeys: &[PublicKey],
    ) -> Result<Vec<Vec<u8>>, Error> {
        pubkeys
            .iter()
            .map(|pubkey| {
                match self.verified_signatures.get(pubkey) {
                    // missing member is fine, the script tolerates n - t gaps
                    None => Ok(vec![]),
                    Some(sigs) => sigs
                        .get(input_idx)
                        .ok_or(Error::MissingSignature)
                        .map(|sig| {
                            SchnorrSig {
                                sig: *sig,
                                hash_ty: TapSighashType::Default,
                            }
                            .to_vec()
                        }),
                }
            })
            .collect::<Result<Vec<_>, _>>()
    }

    pub fn finalize(&self, descriptor: &FederationDescriptor) -> Result<Transaction, Error> {
        if self.verified_signatures.len() < descriptor.threshold {
            return Err(Error::InvalidNumberOfSignatures);
        }

        let signed_inputs = self
            .unsigned_transaction
            .input
            .iter()
            .enumerate()
            .map(|(input_idx, tx_in)| -> Result<TxIn, Error> {
                let sigs = self.get_sigs_for_input(input_idx, &descriptor.pubkeys)?;
                let control = descriptor.control_block_witness();
                let redeem_script = descriptor.redeem_script.to_bytes();
                let witnesses = sigs
                    .into_iter()
                    .rev()
                    .chain([redeem_script, control].into_iter())
                    .collect::<Vec<_>>();

                Ok(TxIn {
                    witness: Witness::from_slice(&witnesses),
                    ..tx_in.clone()
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Transaction {
            input: signed_inputs,
            ..self.unsigned_transaction.clone()
        })
    }
}

/// Accumulates verified member signatures per withdrawal until a
/// broadcastable transaction can be produced.
pub struct SignatureCollector {
    transactions: HashMap<Txid, PartiallySignedPegOut>,
    descriptor: FederationDescriptor,
}

impl SignatureCollector {
    pub fn new(descriptor: FederationDescriptor) -> Self {
        Self {
            transactions: HashMap::new(),
            descriptor,
        }
    }

    /// Verify and record one member's signatures. Extra signatures past
    /// the threshold are dropped; only t signatures fit the witness.
    pub fn add_signature<T: Database>(
        &mut self,
        tracker: &UtxoTracker<T>,
        txid: Txid,
        signature: MemberSignatures,
    ) -> Result<(), Error> {
        let pending = match self.transactions.entry(txid) {
            Entry::Vacant(entry) => {
                let tx = tracker.get_transaction(&txid)?;
                entry.insert(PartiallySignedPegOut::new(tx))
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        if pending.verified_signatures.len() >= self.descriptor.threshold {
            return Ok(());
        }

        tracker.check_member_signatures(&pending.unsigned_transaction, &signature)?;
        pending
            .verified_signatures
            .insert(signature.0, signature.1);

        Ok(())
    }

    pub fn signature_count(&self, txid: &Txid) -> usize {
        self.transactions
            .get(txid)
            .map(|pending| pending.verified_signatures.len())
            .unwrap_or(0)
    }

    pub fn get_finalized(&self, txid: Txid) -> Result<Transaction, Error> {
        let pending = self.transactions.get(&txid).ok_or(Error::TxidNotFound)?;
        pending.finalize(&self.descriptor)
    }

    pub fn cleanup_signatures_for(&mut self, txid: &Txid) {
        self.transactions.remove(txid);
    }
}
