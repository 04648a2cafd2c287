//! Aggregated engine configuration. Parsed from TOML (the same chain-spec
//! convention the consensus engine's host uses) via `serde`; every subsystem
//! config carries explicit defaults, with each numeric assumption that isn't
//! otherwise pinned down called out below.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dispatch tag for the committee selector: a closed, tagged set of
/// selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    Random,
    Stake,
    Reputation,
    Hybrid,
}

impl Default for SelectionMethod {
    fn default() -> Self {
        SelectionMethod::Random
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Target seconds between blocks; informs `prepare()`'s timestamp rule.
    pub period_secs: u64,
    /// Checkpoint spacing: heights that are a multiple of this embed the
    /// full signer list in `extra` and discard pending votes.
    pub epoch_length: u64,
    /// How often (in blocks) a full snapshot is persisted rather than
    /// replayed from the nearest checkpoint ancestor.
    pub checkpoint_interval: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            period_secs: 15,
            epoch_length: 30_000,
            checkpoint_interval: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitteeConfig {
    pub small_set_size: usize,
    /// Blocks between forced committee reselection.
    pub selection_window: u64,
    pub method: SelectionMethod,
    /// Bounded history length: how many prior selections are kept.
    pub history_capacity: usize,
    pub hybrid_weight_stake: f64,
    pub hybrid_weight_reputation: f64,
    pub hybrid_weight_random: f64,
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        CommitteeConfig {
            small_set_size: 3,
            selection_window: 100,
            method: SelectionMethod::Random,
            history_capacity: 256,
            hybrid_weight_stake: 0.4,
            hybrid_weight_reputation: 0.4,
            hybrid_weight_random: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub reward_mining: f64,
    pub reward_uptime_per_hour: f64,
    /// Numerator of the consistency formula
    /// `rewardConsistency / (1 + sigma/mu)`. Pinned to `1.0` so the
    /// component sits in `[0, 1]` before weighting, matching the scale of
    /// the other components.
    pub reward_consistency: f64,
    pub penalty_threshold: u32,
    pub penalty_amount: f64,
    pub decay_rate_per_hour: f64,
    pub decay_interval_secs: u64,
    pub max_component: f64,
    pub min_rep: f64,
    pub max_rep: f64,
    pub weight_block_mining: f64,
    pub weight_uptime: f64,
    pub weight_consistency: f64,
    pub weight_penalty: f64,
    pub partial_reset_interval_secs: u64,
    pub new_validator_window_secs: u64,
    pub new_validator_boost: f64,
    pub veteran_after_secs: u64,
    pub veteran_penalty: f64,
    pub initial_composite: f64,
    /// Minimum ring length before `consistency` is recomputed.
    pub consistency_min_samples: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            reward_mining: 0.1,
            reward_uptime_per_hour: 0.05,
            reward_consistency: 1.0,
            penalty_threshold: 3,
            penalty_amount: 0.5,
            decay_rate_per_hour: 0.05,
            decay_interval_secs: 60,
            max_component: 5.0,
            min_rep: 0.0,
            max_rep: 10.0,
            weight_block_mining: 0.4,
            weight_uptime: 0.3,
            weight_consistency: 0.2,
            weight_penalty: 0.1,
            partial_reset_interval_secs: 7 * 24 * 3600,
            new_validator_window_secs: 24 * 3600,
            new_validator_boost: 0.5,
            veteran_after_secs: 30 * 24 * 3600,
            veteran_penalty: 0.1,
            initial_composite: 1.0,
            consistency_min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub pattern_window_size: usize,
    pub max_blocks_per_signer: usize,
    pub suspicious_threshold: usize,
    pub max_signer_frequency: f64,
    /// Share below which a known signer is flagged `MissingSigner` once the
    /// window has at least 10 blocks. Set well below `1/committee_size` for
    /// the default 3-seat committee.
    pub min_signer_frequency: f64,
    pub max_timestamp_drift_secs: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        AnomalyConfig {
            pattern_window_size: 20,
            max_blocks_per_signer: 10,
            suspicious_threshold: 5,
            max_signer_frequency: 0.6,
            min_signer_frequency: 0.05,
            max_timestamp_drift_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// Auto-blacklist the sealer when composite reputation drops below this.
    pub low_threshold: f64,
    /// Auto-whitelist the sealer when composite reputation reaches this.
    pub high_threshold: f64,
    pub auto_blacklist_ttl_secs: u64,
    pub whitelist_strict: bool,
    pub monitoring_mode: bool,
    pub json_path: PathBuf,
}

impl Default for AclConfig {
    fn default() -> Self {
        AclConfig {
            low_threshold: 2.0,
            high_threshold: 8.0,
            auto_blacklist_ttl_secs: 24 * 3600,
            whitelist_strict: false,
            monitoring_mode: true,
            json_path: PathBuf::from("acl.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub base_period_secs: u64,
    pub min_period_secs: u64,
    pub max_period_secs: u64,
    pub tx_high: u64,
    pub tx_low: u64,
    pub tx_window: usize,
    pub wiggle_max_ms: u64,
}

impl TimingConfig {
    pub fn base_period(&self) -> Duration {
        Duration::from_secs(self.base_period_secs)
    }
    pub fn min_period(&self) -> Duration {
        Duration::from_secs(self.min_period_secs)
    }
    pub fn max_period(&self) -> Duration {
        Duration::from_secs(self.max_period_secs)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            base_period_secs: 15,
            min_period_secs: 5,
            max_period_secs: 20,
            tx_high: 100,
            tx_low: 5,
            tx_window: 16,
            wiggle_max_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub snapshot: SnapshotConfig,
    pub committee: CommitteeConfig,
    pub reputation: ReputationConfig,
    pub anomaly: AnomalyConfig,
    pub acl: AclConfig,
    pub timing: TimingConfig,
    pub tracer_capacity: usize,
    /// Blocks per audit round; defaults to the committee selection window.
    pub round_length: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let committee = CommitteeConfig::default();
        EngineConfig {
            round_length: committee.selection_window,
            committee,
            snapshot: SnapshotConfig::default(),
            reputation: ReputationConfig::default(),
            anomaly: AnomalyConfig::default(),
            acl: AclConfig::default(),
            timing: TimingConfig::default(),
            tracer_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = EngineConfig::default();
        let text = cfg.to_toml().expect("serialize");
        let parsed = EngineConfig::from_toml(&text).expect("parse");
        assert_eq!(cfg, parsed);
    }
}
