//! Two-tier validator selection: periodically reduce the full authority set
//! to a small committee, seeded deterministically so every node converges
//! on the same selection.

use std::collections::BTreeMap;

use ethereum_types::{Address, H256, U256};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::config::{CommitteeConfig, SelectionMethod};
use crate::error::ConsensusError;
use crate::reputation::ReputationView;

/// Stake- and reputation-bearing validator entry, independent of whether the
/// address is currently a signer in the snapshot's authority set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    pub address: Address,
    pub stake: U256,
    pub reputation_millis: u64,
    pub active: bool,
}

/// One past committee selection, kept in a bounded history ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRecord {
    pub height: u64,
    pub hash: H256,
    pub method: SelectionMethod,
    pub selected: Vec<Address>,
}

pub struct CommitteeSelector {
    config: CommitteeConfig,
    validators: RwLock<BTreeMap<Address, ValidatorInfo>>,
    current: RwLock<Option<SelectionRecord>>,
    history: RwLock<Vec<SelectionRecord>>,
}

impl CommitteeSelector {
    pub fn new(config: CommitteeConfig) -> Self {
        CommitteeSelector {
            config,
            validators: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn add_validator(&self, address: Address, stake: U256) {
        self.validators
            .write()
            .entry(address)
            .and_modify(|v| v.stake = stake)
            .or_insert(ValidatorInfo {
                address,
                stake,
                reputation_millis: 0,
                active: true,
            });
    }

    pub fn update_stake(&self, address: Address, stake: U256) {
        if let Some(v) = self.validators.write().get_mut(&address) {
            v.stake = stake;
        }
    }

    pub fn update_reputation(&self, address: Address, reputation: f64) {
        if let Some(v) = self.validators.write().get_mut(&address) {
            v.reputation_millis = (reputation.max(0.0) * 1000.0) as u64;
        }
    }

    pub fn validator_info(&self, address: Address) -> Option<ValidatorInfo> {
        self.validators.read().get(&address).cloned()
    }

    pub fn active_validators(&self) -> Vec<ValidatorInfo> {
        self.validators
            .read()
            .values()
            .filter(|v| v.active)
            .cloned()
            .collect()
    }

    pub fn history(&self, limit: usize) -> Vec<SelectionRecord> {
        let history = self.history.read();
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn current(&self) -> Option<SelectionRecord> {
        self.current.read().clone()
    }

    /// True once `height` has advanced `selectionWindow` blocks past the
    /// current committee's selection height (or no committee exists yet).
    pub fn due_for_reselection(&self, height: u64) -> bool {
        match &*self.current.read() {
            None => true,
            Some(record) => height.saturating_sub(record.height) >= self.config.selection_window,
        }
    }

    /// Select (or reselect) the committee at `(height, hash)`, consulting
    /// `reputation` for the `reputation`/`hybrid` methods. Falls back to the
    /// full signer set with `NoActiveValidators` logged by the caller,
    /// degrading rather than halting consensus on this error kind.
    pub fn select(
        &self,
        height: u64,
        hash: H256,
        full_signers: &[Address],
        reputation: &dyn ReputationView,
    ) -> Result<SelectionRecord, ConsensusError> {
        self.select_with_method(height, hash, full_signers, reputation, self.config.method)
    }

    pub fn select_with_method(
        &self,
        height: u64,
        hash: H256,
        full_signers: &[Address],
        reputation: &dyn ReputationView,
        method: SelectionMethod,
    ) -> Result<SelectionRecord, ConsensusError> {
        let candidates = self.candidate_pool(full_signers);
        if candidates.is_empty() {
            return Err(ConsensusError::NoActiveValidators);
        }

        let k = self.config.small_set_size.min(candidates.len());
        let seed = crate::election::derive_seed(height, hash);
        let selected = match method {
            SelectionMethod::Random => sample_uniform(seed, &candidates, k),
            SelectionMethod::Stake => {
                sample_weighted(seed, &candidates, k, |v| v.stake.as_u128() as f64)
            }
            SelectionMethod::Reputation => sample_weighted(seed, &candidates, k, |v| {
                reputation.composite(v.address)
            }),
            SelectionMethod::Hybrid => select_hybrid(&self.config, &candidates, reputation, k),
        };

        let record = SelectionRecord {
            height,
            hash,
            method,
            selected,
        };
        *self.current.write() = Some(record.clone());
        let mut history = self.history.write();
        history.push(record.clone());
        if history.len() > self.config.history_capacity {
            let overflow = history.len() - self.config.history_capacity;
            history.drain(0..overflow);
        }
        Ok(record)
    }

    fn candidate_pool(&self, full_signers: &[Address]) -> Vec<ValidatorInfo> {
        let validators = self.validators.read();
        full_signers
            .iter()
            .filter_map(|addr| {
                validators
                    .get(addr)
                    .filter(|v| v.active)
                    .cloned()
                    .or(Some(ValidatorInfo {
                        address: *addr,
                        stake: U256::zero(),
                        reputation_millis: 0,
                        active: true,
                    }))
            })
            .collect()
    }
}

/// xorshift's state must not be all-zero, so the second half is mixed with
/// a fixed odd constant rather than reusing `seed` verbatim.
fn rng_from_seed(seed: u64) -> XorShiftRng {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..].copy_from_slice(&seed.wrapping_add(0x9E37_79B9_7F4A_7C15).to_be_bytes());
    XorShiftRng::from_seed(bytes)
}

fn sample_uniform(seed: u64, candidates: &[ValidatorInfo], k: usize) -> Vec<Address> {
    let mut rng = rng_from_seed(seed);
    let mut addrs: Vec<Address> = candidates.iter().map(|v| v.address).collect();
    addrs.sort();
    let chosen: Vec<Address> = addrs.partial_shuffle(&mut rng, k).0.to_vec();
    let mut chosen = chosen;
    chosen.sort();
    chosen
}

/// Weighted sampling without replacement (efraimidis-spirakis style: key
/// each candidate by `u^(1/w)` for `u ~ Uniform(0,1)` and take the top-k).
/// Deterministic given `seed` and the weight function.
fn sample_weighted(
    seed: u64,
    candidates: &[ValidatorInfo],
    k: usize,
    weight: impl Fn(&ValidatorInfo) -> f64,
) -> Vec<Address> {
    let mut rng = rng_from_seed(seed);
    let mut keyed: Vec<(f64, Address)> = candidates
        .iter()
        .map(|v| {
            let w = weight(v).max(1e-9);
            let u: f64 = rng.gen_range(1e-12..1.0);
            (u.powf(1.0 / w), v.address)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut chosen: Vec<Address> = keyed.into_iter().take(k).map(|(_, a)| a).collect();
    chosen.sort();
    chosen
}

fn select_hybrid(
    config: &CommitteeConfig,
    candidates: &[ValidatorInfo],
    reputation: &dyn ReputationView,
    k: usize,
) -> Vec<Address> {
    let max_stake = candidates
        .iter()
        .map(|v| v.stake.as_u128() as f64)
        .fold(0.0_f64, f64::max)
        .max(1.0);
    let max_rep = candidates
        .iter()
        .map(|v| reputation.composite(v.address))
        .fold(0.0_f64, f64::max)
        .max(1.0);

    let mut scored: Vec<(f64, Address)> = candidates
        .iter()
        .map(|v| {
            let stake_hat = (v.stake.as_u128() as f64) / max_stake;
            let rep_hat = reputation.composite(v.address) / max_rep;
            let score = config.hybrid_weight_stake * stake_hat
                + config.hybrid_weight_reputation * rep_hat
                + config.hybrid_weight_random * 0.5;
            (score, v.address)
        })
        .collect();

    // Deterministic tie-break by address, descending score.
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    let mut chosen: Vec<Address> = scored.into_iter().take(k).map(|(_, a)| a).collect();
    chosen.sort();
    chosen
}
