use bridge::Error as BridgeError;
use ecash::Error as EcashError;
use std::time::SystemTimeError;

#[allow(clippy::enum_variant_names)]
#[derive(Debug)]
pub enum Error {
    DbError,
    CodecError,
    SpecChanged,
    TimeError(SystemTimeError),
    EcashError(EcashError),
    BridgeError(BridgeError),
    // consensus
    UnknownMember,
    InvalidSignature,
    WrongEpoch,
    WrongParent,
    NotTheLeader,
    InsufficientVotes,
    DuplicateVote,
    EquivocatingMember(u16),
    // ledger
    UnbalancedTransaction,
    DoubleSpend,
    DepositAlreadyClaimed,
    UnknownOutput,
    OutputNotReady,
    DuplicateIssuanceShare,
    // contracts
    InvalidContract,
    UnknownContract,
    ContractAlreadyResolved,
    ContractExpired,
    ContractNotExpired,
    WrongPreimage,
    // gateway
    NoGateway,
    // client
    InsufficientBalance,
    InvalidInvoice,
    PaymentFailed,
    Timeout,
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::TimeError(e)
    }
}

impl From<EcashError> for Error {
    fn from(e: EcashError) -> Self {
        Error::EcashError(e)
    }
}

impl From<BridgeError> for Error {
    fn from(e: BridgeError) -> Self {
        Error::BridgeError(e)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(_: rmp_serde::encode::Error) -> Self {
        Error::CodecError
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(_: rmp_serde::decode::Error) -> Self {
        Error::CodecError
    }
}
