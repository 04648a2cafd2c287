//! Codec for the header's `extra` region: `vanity[32] || signers[20*N]? || seal[65]`.
//! The signer list is only present on checkpoint blocks (`number % epoch == 0`).

use ethereum_types::Address;

use crate::error::CodecError;

/// Fixed vanity prefix length.
pub const VANITY_LENGTH: usize = 32;
/// Fixed ECDSA seal suffix length (r[32] || s[32] || v[1]).
pub const SEAL_LENGTH: usize = 65;
/// One signer address occupies this many bytes in a checkpoint's signer list.
pub const ADDRESS_LENGTH: usize = 20;

/// Decoded view of an `extra` field.
pub struct DecodedExtra {
    pub vanity: [u8; VANITY_LENGTH],
    /// `Some` only for checkpoint blocks; the ascending-address-order signer list.
    pub signers: Option<Vec<Address>>,
    pub seal: [u8; SEAL_LENGTH],
}

/// Split `extra` into vanity, optional checkpoint signer list, and seal.
///
/// `is_checkpoint` tells the decoder whether to expect a signer list between
/// the vanity and the seal; a non-checkpoint header with extra bytes there is
/// malformed, not merely unexpected.
pub fn decode_extra(extra: &[u8], is_checkpoint: bool) -> Result<DecodedExtra, CodecError> {
    if extra.len() < VANITY_LENGTH + SEAL_LENGTH {
        return Err(CodecError::MissingSeal);
    }

    let mut vanity = [0u8; VANITY_LENGTH];
    vanity.copy_from_slice(&extra[..VANITY_LENGTH]);

    let mut seal = [0u8; SEAL_LENGTH];
    seal.copy_from_slice(&extra[extra.len() - SEAL_LENGTH..]);

    let middle = &extra[VANITY_LENGTH..extra.len() - SEAL_LENGTH];

    if !is_checkpoint {
        if !middle.is_empty() {
            return Err(CodecError::MalformedExtra(
                "signer list present on a non-checkpoint block".into(),
            ));
        }
        return Ok(DecodedExtra {
            vanity,
            signers: None,
            seal,
        });
    }

    if middle.is_empty() || middle.len() % ADDRESS_LENGTH != 0 {
        return Err(CodecError::MalformedExtra(format!(
            "checkpoint signer region is {} bytes, not a positive multiple of {}",
            middle.len(),
            ADDRESS_LENGTH
        )));
    }

    let signers = middle
        .chunks_exact(ADDRESS_LENGTH)
        .map(Address::from_slice)
        .collect();

    Ok(DecodedExtra {
        vanity,
        signers: Some(signers),
        seal,
    })
}

/// Build an `extra` field from its parts. `signers` should be `Some` exactly
/// at checkpoint heights, already sorted ascending by the caller (the
/// snapshot engine owns ordering; this codec does not re-sort).
pub fn encode_extra(
    vanity: [u8; VANITY_LENGTH],
    signers: Option<&[Address]>,
    seal: [u8; SEAL_LENGTH],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        VANITY_LENGTH + signers.map_or(0, |s| s.len() * ADDRESS_LENGTH) + SEAL_LENGTH,
    );
    out.extend_from_slice(&vanity);
    if let Some(signers) = signers {
        for addr in signers {
            out.extend_from_slice(addr.as_bytes());
        }
    }
    out.extend_from_slice(&seal);
    out
}

/// `extra` with a zero seal placeholder, for `prepare()` before signing.
pub fn encode_extra_unsealed(vanity: [u8; VANITY_LENGTH], signers: Option<&[Address]>) -> Vec<u8> {
    encode_extra(vanity, signers, [0u8; SEAL_LENGTH])
}
