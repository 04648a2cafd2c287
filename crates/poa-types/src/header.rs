//! Ethereum-compatible block header: the external contract this crate verifies
//! and seals against. Mirrors the handful of fields the consensus data model
//! names; state/transaction roots and gas accounting are owned by the block-assembly
//! layer and are out of scope here.

use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp, RlpStream};

use crate::extra::SEAL_LENGTH;

/// Block height. Aliased so callers don't have to remember it's a `u64`.
pub type BlockNumber = u64;

/// A 32-byte nonce. Only the first 8 bytes carry vote polarity (see `extra`);
/// the header format reserves the full 32 bytes for forward compatibility.
pub type Nonce = H256;

/// All-ones nonce: the sealer is proposing to *authorize* `coinbase`.
pub const NONCE_AUTHORIZE: Nonce = H256([0xff; 32]);
/// All-zero nonce: the sealer is proposing to *deauthorize* `coinbase`.
pub const NONCE_DEAUTHORIZE: Nonce = H256([0x00; 32]);

/// Block header as seen by the consensus core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub number: BlockNumber,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub nonce: Nonce,
    /// Vote subject, or the zero address on a non-voting block.
    pub coinbase: Address,
    pub difficulty: U256,
    /// `vanity[32] || (signers[20*N] iff checkpoint) || seal[65]`.
    pub extra_data: Vec<u8>,
}

impl Header {
    /// A header with no seal yet appended to `extra_data`, ready for `prepare()`
    /// to populate and a local signer to seal.
    pub fn new(number: BlockNumber, parent_hash: H256, timestamp: u64) -> Self {
        Header {
            number,
            parent_hash,
            timestamp,
            nonce: NONCE_DEAUTHORIZE,
            coinbase: Address::zero(),
            difficulty: U256::zero(),
            extra_data: Vec::new(),
        }
    }

    /// Full header hash, used as `parent_hash` by the next block and as the
    /// seed input to leader election. Includes the seal.
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }

    /// The hash actually signed by the sealer: the RLP encoding of the header
    /// with the trailing seal bytes stripped out of `extra_data` (not zeroed —
    /// removed, so decoding and re-signing are inverses of each other).
    pub fn sealing_hash(&self) -> H256 {
        let mut reduced = self.clone();
        let len = reduced.extra_data.len();
        if len >= SEAL_LENGTH {
            reduced.extra_data.truncate(len - SEAL_LENGTH);
        }
        keccak(rlp::encode(&reduced))
    }
}

impl rlp::Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.number);
        s.append(&self.parent_hash);
        s.append(&self.timestamp);
        s.append(&self.nonce);
        s.append(&self.coinbase);
        s.append(&self.difficulty);
        s.append(&self.extra_data);
    }
}

impl rlp::Decodable for Header {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Header {
            number: rlp.val_at(0)?,
            parent_hash: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
            nonce: rlp.val_at(3)?,
            coinbase: rlp.val_at(4)?,
            difficulty: rlp.val_at(5)?,
            extra_data: rlp.val_at(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_through_rlp() {
        let mut header = Header::new(7, H256::repeat_byte(0xab), 1_700_000_000);
        header.extra_data = vec![9u8; 32 + 65];
        header.difficulty = U256::from(2);

        let encoded = rlp::encode(&header);
        let decoded: Header = rlp::decode(&encoded).expect("decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn sealing_hash_excludes_seal_bytes() {
        let mut a = Header::new(1, H256::zero(), 0);
        a.extra_data = vec![1u8; 32];
        a.extra_data.extend(vec![0u8; SEAL_LENGTH]);

        let mut b = a.clone();
        let n = b.extra_data.len();
        b.extra_data[n - SEAL_LENGTH..].copy_from_slice(&[0xffu8; SEAL_LENGTH]);

        assert_eq!(a.sealing_hash(), b.sealing_hash());
        assert_ne!(a.hash(), b.hash());
    }
}
