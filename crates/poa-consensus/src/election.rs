//! Pseudorandom leader election: deterministic, but unpredictable before
//! the parent block is sealed.

use ethereum_types::{Address, H256};

/// Difficulty assigned to the in-turn signer.
pub const DIFF_IN_TURN: u64 = 2;
/// Difficulty assigned to every other signer.
pub const DIFF_NO_TURN: u64 = 1;

/// Derive the 64-bit seed for height `h` given the parent block hash `parent_hash`.
///
/// Byte layout is binding across the network — diverging here means every
/// other node elects a different signer for the same height. The seed
/// buffer is the 8 little-endian bytes of `h` followed by the first 24
/// bytes of `parent_hash`, 32 bytes total. The buffer is split into four
/// 8-byte chunks, each chunk read as a little-endian `u64`, and the seed
/// is the XOR of all four chunks.
pub fn derive_seed(height: u64, parent_hash: H256) -> u64 {
    let mut buf = [0u8; 32];
    buf[..8].copy_from_slice(&height.to_le_bytes());
    buf[8..32].copy_from_slice(&parent_hash.as_bytes()[..24]);

    let mut seed = 0u64;
    for chunk in buf.chunks_exact(8) {
        let word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        seed ^= word;
    }
    seed
}

/// The in-turn signer and its index within `signers` (ascending-address
/// order, as the snapshot engine maintains it).
pub struct InTurn {
    pub index: usize,
    pub signer: Address,
}

/// Elect the in-turn signer for `height` out of `signers`, using the parent
/// block's hash as the unpredictability source.
///
/// Panics only if `signers` is empty, which the snapshot engine must never
/// produce (an authority set always has at least one signer).
pub fn elect(height: u64, parent_hash: H256, signers: &[Address]) -> InTurn {
    assert!(!signers.is_empty(), "cannot elect from an empty signer set");
    let seed = derive_seed(height, parent_hash);
    let index = (seed % signers.len() as u64) as usize;
    InTurn {
        index,
        signer: signers[index],
    }
}

/// Difficulty for `signer` at `height` given the elected in-turn signer.
pub fn difficulty_for(signer: Address, in_turn: &InTurn) -> u64 {
    if signer == in_turn.signer {
        DIFF_IN_TURN
    } else {
        DIFF_NO_TURN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn signers(n: u8) -> Vec<Address> {
        (1..=n).map(Address::repeat_byte).collect()
    }

    #[test]
    fn is_deterministic_across_many_invocations() {
        let signers = signers(5);
        let parent = H256::repeat_byte(0x42);
        let first = elect(100, parent, &signers).signer;
        for _ in 0..1000 {
            assert_eq!(elect(100, parent, &signers).signer, first);
        }
    }

    #[test]
    fn different_parent_hashes_usually_change_the_outcome() {
        let signers = signers(7);
        let a = elect(10, H256::repeat_byte(1), &signers).signer;
        let b = elect(10, H256::repeat_byte(2), &signers).signer;
        // Not a hard guarantee for every seed pair, but true for this fixture;
        // documents that the parent hash, not just height, drives the seed.
        assert_ne!(a, b);
    }

    #[test]
    fn single_signer_is_always_in_turn() {
        let signers = signers(1);
        let elected = elect(999, H256::repeat_byte(7), &signers);
        assert_eq!(elected.signer, signers[0]);
        assert_eq!(difficulty_for(signers[0], &elected), DIFF_IN_TURN);
    }

    #[test]
    fn difficulty_matches_in_turn_status() {
        let signers = signers(4);
        let elected = elect(55, H256::repeat_byte(9), &signers);
        for &s in &signers {
            let expected = if s == elected.signer {
                DIFF_IN_TURN
            } else {
                DIFF_NO_TURN
            };
            assert_eq!(difficulty_for(s, &elected), expected);
        }
    }
}
