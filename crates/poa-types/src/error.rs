//! Error kinds surfaced by the header codec and signer recovery.

use thiserror::Error;

/// Failures from decoding `extra` or recovering the sealer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// `extra` is shorter than the fixed vanity + seal region, or a checkpoint's
    /// signer region is not a multiple of 20 bytes.
    #[error("malformed extra data: {0}")]
    MalformedExtra(String),

    /// `extra` does not carry a trailing 65-byte seal.
    #[error("header is missing its seal")]
    MissingSeal,

    /// The seal bytes do not recover to a valid public key / address.
    #[error("bad signature: {0}")]
    BadSignature(String),
}
