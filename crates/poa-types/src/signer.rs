//! Sealer recovery from a header's ECDSA seal, with an LRU cache keyed by
//! header hash so re-verifying the same header (common during reorgs and
//! snapshot replay) doesn't re-run secp256k1 recovery.

use std::num::NonZeroUsize;

use ethereum_types::{Address, H256};
use lru::LruCache;
use parity_crypto::publickey::{public_to_address, recover, Signature};
use parking_lot::Mutex;

use crate::error::CodecError;
use crate::extra::{decode_extra, SEAL_LENGTH};
use crate::header::Header;

/// Default capacity of the recovered-sealer cache: a few recent epochs'
/// worth of blocks.
const DEFAULT_CACHE_CAPACITY: usize = 8192;

/// Recovers and caches the address that sealed a given header.
pub struct SignerRecovery {
    cache: Mutex<LruCache<H256, Address>>,
}

impl SignerRecovery {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        SignerRecovery {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Recover the sealer of `header`, consulting/populating the cache by the
    /// header's full hash (including its seal — two headers that differ only
    /// in fields other than the seal would be a different hash anyway).
    pub fn author(&self, header: &Header) -> Result<Address, CodecError> {
        let hash = header.hash();
        if let Some(addr) = self.cache.lock().get(&hash).copied() {
            return Ok(addr);
        }

        let decoded = decode_extra(&header.extra_data, header_is_checkpoint(header))?;

        let signature = Signature::from(decoded.seal);
        let message = header.sealing_hash();
        let public = recover(&signature, &message.as_fixed_bytes().into())
            .map_err(|e| CodecError::BadSignature(e.to_string()))?;
        let address = public_to_address(&public);

        self.cache.lock().put(hash, address);
        Ok(address)
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl Default for SignerRecovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `header`'s `extra_data` layout implies a checkpoint signer list:
/// anything beyond vanity+seal must be exactly that list. Checkpoint-ness is
/// properly the snapshot engine's call (`number % epoch == 0`); this is only
/// used where the caller hasn't threaded epoch length through, and falls
/// back to shape-sniffing which `decode_extra` double-checks for validity.
fn header_is_checkpoint(header: &Header) -> bool {
    header.extra_data.len() > crate::extra::VANITY_LENGTH + SEAL_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::extra::encode_extra_unsealed;
    use parity_crypto::publickey::{sign, KeyPair, Secret};

    fn signer_keypair() -> KeyPair {
        KeyPair::from_secret(Secret::from([0x11u8; 32])).expect("valid secret")
    }

    fn sealed_header(keypair: &KeyPair) -> Header {
        let mut header = Header::new(1, H256::zero(), 1_700_000_000);
        header.extra_data = encode_extra_unsealed([0u8; 32], None);
        let digest = header.sealing_hash();
        let sig = sign(keypair.secret(), &digest.as_fixed_bytes().into()).expect("sign");
        let mut extra = header.extra_data.clone();
        let seal_bytes: [u8; SEAL_LENGTH] = sig.into();
        extra.truncate(32);
        extra.extend_from_slice(&seal_bytes);
        header.extra_data = extra;
        header
    }

    #[test]
    fn recovers_the_signer_and_caches_it() {
        let keypair = signer_keypair();
        let header = sealed_header(&keypair);
        let recovery = SignerRecovery::new();

        let first = recovery.author(&header).expect("recover");
        assert_eq!(first, keypair.address());

        // second call should hit the cache and agree.
        let second = recovery.author(&header).expect("recover cached");
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_truncated_seal() {
        let mut header = Header::new(1, H256::zero(), 0);
        header.extra_data = vec![0u8; 10];
        let recovery = SignerRecovery::new();
        assert!(recovery.author(&header).is_err());
    }
}
