//! Header codec, signer recovery and storage primitives shared by the PoA
//! consensus core. Split out of `poa-consensus` as its own crate so that
//! callers that only need to decode a header or recover its author don't
//! need to pull in the rest of the engine.

pub mod error;
pub mod extra;
pub mod header;
pub mod kv;
pub mod signer;

pub use error::CodecError;
pub use extra::{decode_extra, encode_extra, encode_extra_unsealed, DecodedExtra};
pub use header::{BlockNumber, Header, Nonce, NONCE_AUTHORIZE, NONCE_DEAUTHORIZE};
pub use kv::{KvDbStore, KvStore, StoreError};
pub use signer::SignerRecovery;

pub use ethereum_types::{Address, H256, U256};
