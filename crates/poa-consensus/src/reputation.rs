//! Composite reputation scoring: every validator carries a score in
//! `[minRep, maxRep]` built from four weighted components, with
//! fairness mechanisms that keep a single bad or single lucky stretch from
//! dominating the score.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use ethereum_types::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ReputationConfig;

/// Bound on how many recent block-mined timestamps feed the consistency
/// component; old intervals age out on their own as the ring fills.
const INTERVAL_HISTORY: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum ReputationEvent {
    BlockMined { address: Address, timestamp_secs: u64 },
    UptimeTick { address: Address, timestamp_secs: u64 },
    ConsistencyRecomputed { address: Address, value: f64 },
    ViolationRecorded {
        address: Address,
        total: u32,
        height: u64,
        kind: String,
        msg: String,
    },
    PenaltyApplied { address: Address, amount: f64 },
    Decayed { address: Address, new_composite: f64 },
    PartialReset { address: Address },
}

/// Bound on how many past events `get_events`/`get_decay_history` can see.
const EVENT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReputationStats {
    pub validator_count: usize,
    pub average_composite: f64,
    pub total_violations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReputationScore {
    pub block_mining: f64,
    pub uptime: f64,
    pub consistency: f64,
    pub penalty: f64,
    pub composite: f64,
    pub violations: u32,
    pub total_blocks_mined: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FairnessStats {
    pub new_validator_count: usize,
    pub veteran_count: usize,
    pub total_validators: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FairnessInfo {
    pub is_new_validator: bool,
    pub is_veteran: bool,
    pub age_secs: u64,
    pub last_partial_reset_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Entry {
    block_mining: f64,
    uptime: f64,
    consistency: f64,
    penalty: f64,
    composite: f64,
    violations: u32,
    total_blocks_mined: u64,
    last_mined_height: Option<u64>,
    active: bool,
    registered_at_secs: u64,
    /// Last time any mutating call touched this entry.
    last_updated_secs: u64,
    /// Last time `record_uptime_tick` ran, anchoring the next call's `Δt`.
    last_uptime_secs: u64,
    last_decay_secs: u64,
    last_partial_reset_secs: u64,
    last_violation_kind: Option<String>,
    last_violation_height: Option<u64>,
    #[serde(skip)]
    mined_at: VecDeque<u64>,
}

/// Read-only view the committee selector consults for the `reputation` and
/// `hybrid` selection methods, kept separate from the mutating engine so
/// selection code never needs write access.
pub trait ReputationView: Send + Sync {
    fn composite(&self, address: Address) -> f64;
}

pub struct NullReputationView;

impl ReputationView for NullReputationView {
    fn composite(&self, _address: Address) -> f64 {
        1.0
    }
}

pub struct ReputationEngine {
    config: ReputationConfig,
    entries: RwLock<BTreeMap<Address, Entry>>,
    events: RwLock<VecDeque<ReputationEvent>>,
    store: Arc<dyn poa_types::KvStore>,
}

impl ReputationEngine {
    pub fn new(config: ReputationConfig, store: Arc<dyn poa_types::KvStore>) -> Self {
        ReputationEngine {
            config,
            entries: RwLock::new(BTreeMap::new()),
            events: RwLock::new(VecDeque::new()),
            store,
        }
    }

    fn log_events(&self, new_events: &[ReputationEvent]) {
        if new_events.is_empty() {
            return;
        }
        let mut log = self.events.write();
        log.extend(new_events.iter().cloned());
        while log.len() > EVENT_LOG_CAPACITY {
            log.pop_front();
        }
    }

    /// Register `address` if unseen; a no-op otherwise. `now_secs` anchors
    /// the new-validator boost window.
    pub fn register(&self, address: Address, now_secs: u64) {
        self.entries
            .write()
            .entry(address)
            .or_insert_with(|| fresh_entry(&self.config, now_secs));
    }

    pub fn record_block_mined(&self, address: Address, height: u64, now_secs: u64) -> Vec<ReputationEvent> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(address)
            .or_insert_with(|| fresh_entry(&self.config, now_secs));
        entry.block_mining = (entry.block_mining + self.config.reward_mining)
            .min(self.config.max_component);
        entry.mined_at.push_back(now_secs);
        if entry.mined_at.len() > INTERVAL_HISTORY {
            entry.mined_at.pop_front();
        }
        entry.total_blocks_mined += 1;
        entry.last_mined_height = Some(height);
        entry.last_updated_secs = now_secs;
        let mut events = vec![ReputationEvent::BlockMined {
            address,
            timestamp_secs: now_secs,
        }];
        if let Some(value) = recompute_consistency(entry, &self.config) {
            events.push(ReputationEvent::ConsistencyRecomputed { address, value });
        }
        recompute_composite(entry, &self.config, now_secs);
        drop(entries);
        self.log_events(&events);
        events
    }

    /// Accrue uptime as `Δt_hours · rewardUptimePerHour`, `Δt` measured from
    /// the last tick for this address (or from registration, on the first
    /// tick).
    pub fn record_uptime_tick(&self, address: Address, now_secs: u64) -> ReputationEvent {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(address)
            .or_insert_with(|| fresh_entry(&self.config, now_secs));
        let elapsed_hours = now_secs.saturating_sub(entry.last_uptime_secs) as f64 / 3600.0;
        entry.uptime = (entry.uptime + elapsed_hours * self.config.reward_uptime_per_hour)
            .min(self.config.max_component);
        entry.last_uptime_secs = now_secs;
        entry.last_updated_secs = now_secs;
        recompute_composite(entry, &self.config, now_secs);
        drop(entries);
        let event = ReputationEvent::UptimeTick {
            address,
            timestamp_secs: now_secs,
        };
        self.log_events(std::slice::from_ref(&event));
        event
    }

    /// Record a violation of `kind` (e.g. `"rapid_signing"`) observed at
    /// `height`; once the count crosses `penalty_threshold` in a single call
    /// window, a penalty is applied and the counter resets.
    pub fn record_violation(
        &self,
        address: Address,
        height: u64,
        kind: impl Into<String>,
        msg: impl Into<String>,
        now_secs: u64,
    ) -> Vec<ReputationEvent> {
        let kind = kind.into();
        let msg = msg.into();
        let mut entries = self.entries.write();
        let entry = entries
            .entry(address)
            .or_insert_with(|| fresh_entry(&self.config, now_secs));
        entry.violations += 1;
        entry.last_violation_kind = Some(kind.clone());
        entry.last_violation_height = Some(height);
        entry.last_updated_secs = now_secs;
        let mut events = vec![ReputationEvent::ViolationRecorded {
            address,
            total: entry.violations,
            height,
            kind,
            msg,
        }];
        if entry.violations >= self.config.penalty_threshold {
            entry.penalty = (entry.penalty + self.config.penalty_amount)
                .min(self.config.max_component);
            entry.violations = 0;
            events.push(ReputationEvent::PenaltyApplied {
                address,
                amount: self.config.penalty_amount,
            });
        }
        recompute_composite(entry, &self.config, now_secs);
        drop(entries);
        self.log_events(&events);
        events
    }

    /// Apply time-based decay to every component if `decay_interval_secs`
    /// has elapsed since the last decay for that validator.
    pub fn decay_all(&self, now_secs: u64) -> Vec<ReputationEvent> {
        let mut events = Vec::new();
        let mut entries = self.entries.write();
        for (&address, entry) in entries.iter_mut() {
            let elapsed = now_secs.saturating_sub(entry.last_decay_secs);
            if elapsed < self.config.decay_interval_secs {
                continue;
            }
            let hours = elapsed as f64 / 3600.0;
            let factor = (1.0 - self.config.decay_rate_per_hour * hours).max(0.0);
            entry.block_mining *= factor;
            entry.uptime *= factor;
            entry.consistency *= factor;
            entry.last_decay_secs = now_secs;
            entry.last_updated_secs = now_secs;
            recompute_composite(entry, &self.config, now_secs);
            events.push(ReputationEvent::Decayed {
                address,
                new_composite: entry.composite,
            });
        }
        drop(entries);
        self.log_events(&events);
        events
    }

    /// Weekly partial reset (a fairness mechanism): halves the mining and
    /// uptime components so a long-idle validator isn't locked out forever,
    /// but never touches `penalty`.
    pub fn maybe_partial_reset(&self, now_secs: u64) -> Vec<ReputationEvent> {
        let mut events = Vec::new();
        let mut entries = self.entries.write();
        for (&address, entry) in entries.iter_mut() {
            let elapsed = now_secs.saturating_sub(entry.last_partial_reset_secs);
            if elapsed < self.config.partial_reset_interval_secs {
                continue;
            }
            entry.block_mining *= 0.5;
            entry.uptime *= 0.5;
            entry.last_partial_reset_secs = now_secs;
            entry.last_updated_secs = now_secs;
            recompute_composite(entry, &self.config, now_secs);
            events.push(ReputationEvent::PartialReset { address });
        }
        drop(entries);
        self.log_events(&events);
        events
    }

    /// Force an immediate partial reset of a single validator, bypassing the
    /// `partial_reset_interval_secs` gate `maybe_partial_reset` enforces.
    pub fn force_partial_reset(&self, address: Address, now_secs: u64) -> Option<ReputationEvent> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&address)?;
        entry.block_mining *= 0.5;
        entry.uptime *= 0.5;
        entry.last_partial_reset_secs = now_secs;
        entry.last_updated_secs = now_secs;
        recompute_composite(entry, &self.config, now_secs);
        drop(entries);
        let event = ReputationEvent::PartialReset { address };
        self.log_events(std::slice::from_ref(&event));
        Some(event)
    }

    /// Run the periodic update cycle: decay followed by any partial resets
    /// that have come due. Driven by the dynamic timing controller's cadence
    /// rather than a fixed clock.
    pub fn update_all(&self, now_secs: u64) -> Vec<ReputationEvent> {
        let mut events = self.decay_all(now_secs);
        events.extend(self.maybe_partial_reset(now_secs));
        events
    }

    pub fn mark_online(&self, address: Address, now_secs: u64) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(address)
            .or_insert_with(|| fresh_entry(&self.config, now_secs));
        entry.active = true;
    }

    pub fn mark_offline(&self, address: Address) {
        if let Some(entry) = self.entries.write().get_mut(&address) {
            entry.active = false;
        }
    }

    pub fn composite_of(&self, address: Address) -> f64 {
        self.entries
            .read()
            .get(&address)
            .map(|e| e.composite)
            .unwrap_or(self.config.initial_composite)
    }

    pub fn get_score(&self, address: Address) -> Option<ReputationScore> {
        self.entries.read().get(&address).map(|e| ReputationScore {
            block_mining: e.block_mining,
            uptime: e.uptime,
            consistency: e.consistency,
            penalty: e.penalty,
            composite: e.composite,
            violations: e.violations,
            total_blocks_mined: e.total_blocks_mined,
            active: e.active,
        })
    }

    pub fn get_stats(&self) -> ReputationStats {
        let entries = self.entries.read();
        let validator_count = entries.len();
        let total_violations: u32 = entries.values().map(|e| e.violations).sum();
        let average_composite = if validator_count == 0 {
            0.0
        } else {
            entries.values().map(|e| e.composite).sum::<f64>() / validator_count as f64
        };
        ReputationStats {
            validator_count,
            average_composite,
            total_violations,
        }
    }

    /// The `n` highest-composite validators, descending, ties broken by
    /// address for determinism.
    pub fn get_top(&self, n: usize) -> Vec<(Address, f64)> {
        let entries = self.entries.read();
        let mut scored: Vec<(Address, f64)> = entries.iter().map(|(a, e)| (*a, e.composite)).collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(n);
        scored
    }

    /// The last `n` reputation events recorded across every validator.
    pub fn get_events(&self, n: usize) -> Vec<ReputationEvent> {
        let log = self.events.read();
        let len = log.len();
        log.iter().skip(len.saturating_sub(n)).cloned().collect()
    }

    /// The last `n` decay events, a subsequence of `get_events`.
    pub fn get_decay_history(&self, n: usize) -> Vec<ReputationEvent> {
        let decayed: Vec<ReputationEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| matches!(e, ReputationEvent::Decayed { .. }))
            .cloned()
            .collect();
        let len = decayed.len();
        decayed.into_iter().skip(len.saturating_sub(n)).collect()
    }

    pub fn get_fairness_stats(&self, now_secs: u64) -> FairnessStats {
        let entries = self.entries.read();
        let mut new_validator_count = 0;
        let mut veteran_count = 0;
        for entry in entries.values() {
            let age = now_secs.saturating_sub(entry.registered_at_secs);
            if age < self.config.new_validator_window_secs {
                new_validator_count += 1;
            } else if age > self.config.veteran_after_secs {
                veteran_count += 1;
            }
        }
        FairnessStats {
            new_validator_count,
            veteran_count,
            total_validators: entries.len(),
        }
    }

    pub fn get_fairness_info(&self, address: Address, now_secs: u64) -> Option<FairnessInfo> {
        let entries = self.entries.read();
        let entry = entries.get(&address)?;
        let age_secs = now_secs.saturating_sub(entry.registered_at_secs);
        Some(FairnessInfo {
            is_new_validator: age_secs < self.config.new_validator_window_secs,
            is_veteran: age_secs > self.config.veteran_after_secs,
            age_secs,
            last_partial_reset_secs: entry.last_partial_reset_secs,
        })
    }

    pub fn persist(&self) -> Result<(), poa_types::StoreError> {
        let entries = self.entries.read();
        for (address, entry) in entries.iter() {
            let key = format!("rep-{:#x}", address);
            let bytes = serde_json::to_vec(entry)
                .map_err(|e| poa_types::StoreError::Put(e.to_string()))?;
            self.store.put(key.as_bytes(), &bytes)?;
        }
        Ok(())
    }
}

impl ReputationView for ReputationEngine {
    fn composite(&self, address: Address) -> f64 {
        self.composite_of(address)
    }
}

fn fresh_entry(config: &ReputationConfig, now_secs: u64) -> Entry {
    Entry {
        block_mining: 0.0,
        uptime: 0.0,
        consistency: 0.0,
        penalty: 0.0,
        composite: config.initial_composite,
        violations: 0,
        total_blocks_mined: 0,
        last_mined_height: None,
        active: true,
        registered_at_secs: now_secs,
        last_updated_secs: now_secs,
        last_uptime_secs: now_secs,
        last_decay_secs: now_secs,
        last_partial_reset_secs: now_secs,
        last_violation_kind: None,
        last_violation_height: None,
        mined_at: VecDeque::new(),
    }
}

/// `rewardConsistency / (1 + sigma/mu)` over the inter-block intervals,
/// once at least `consistency_min_samples` intervals are available.
fn recompute_consistency(entry: &mut Entry, config: &ReputationConfig) -> Option<f64> {
    if entry.mined_at.len() < config.consistency_min_samples + 1 {
        return None;
    }
    let intervals: Vec<f64> = entry
        .mined_at
        .iter()
        .zip(entry.mined_at.iter().skip(1))
        .map(|(a, b)| b.saturating_sub(*a) as f64)
        .collect();
    let mu = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mu <= 0.0 {
        return None;
    }
    let variance =
        intervals.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / intervals.len() as f64;
    let sigma = variance.sqrt();
    let value = (config.reward_consistency / (1.0 + sigma / mu)).min(config.max_component);
    entry.consistency = value;
    Some(value)
}

fn recompute_composite(entry: &mut Entry, config: &ReputationConfig, now_secs: u64) {
    let mut score = config.weight_block_mining * entry.block_mining
        + config.weight_uptime * entry.uptime
        + config.weight_consistency * entry.consistency
        - config.weight_penalty * entry.penalty;

    let age_secs = now_secs.saturating_sub(entry.registered_at_secs);
    if age_secs < config.new_validator_window_secs {
        score += config.new_validator_boost;
    } else if age_secs > config.veteran_after_secs {
        score -= config.veteran_penalty;
    }

    entry.composite = score.clamp(config.min_rep, config.max_rep);
}
