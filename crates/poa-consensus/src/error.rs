//! Error kinds surfaced by the consensus facade.

use ethereum_types::{Address, H256};
use poa_types::CodecError;
use thiserror::Error;

/// Errors that reject a header outright or abort a voting/selection step.
/// Operational faults (storage retries, ACL persistence) never reach this
/// type — they are logged and degrade gracefully instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("{0} is not an authorized signer at this height")]
    UnauthorizedSigner(Address),

    #[error("{0} signed too recently (within the last floor(N/2)+1 blocks)")]
    RecentlySigned(Address),

    #[error("checkpoint at height {height} has invalid extra data: {reason}")]
    InvalidCheckpoint { height: u64, reason: String },

    #[error("vote dropped: {0}")]
    InvalidVote(String),

    #[error("header codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("no active validators available for committee selection")]
    NoActiveValidators,

    #[error("{0} is blocked by the access control list: {1}")]
    AccessDenied(Address, String),

    #[error("difficulty {actual} does not match the expected in-turn/no-turn value")]
    BadDifficulty { actual: u64 },

    #[error("local signer is not registered")]
    NoSigner,

    #[error("sealing was cancelled")]
    Cancelled,

    #[error("snapshot unavailable for block {0}")]
    UnknownSnapshot(H256),
}
