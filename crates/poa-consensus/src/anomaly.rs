//! Sliding-window anomaly detection feeding the reputation engine's
//! violation counter.

use std::collections::VecDeque;

use ethereum_types::Address;
use parking_lot::RwLock;

use crate::config::AnomalyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyEvent {
    RapidSigning {
        signer: Address,
        height: u64,
        occurrences: usize,
        severity: Severity,
    },
    SuspiciousPattern {
        height: u64,
        /// The two signers whose strict alternation tripped the detector.
        signers: (Address, Address),
        severity: Severity,
    },
    HighFrequency {
        signer: Address,
        height: u64,
        share: f64,
        severity: Severity,
    },
    MissingSigner {
        signer: Address,
        height: u64,
        share: f64,
        severity: Severity,
    },
    TimestampDrift {
        signer: Address,
        height: u64,
        drift_secs: i64,
        severity: Severity,
    },
}

impl AnomalyEvent {
    pub fn signer(&self) -> Option<Address> {
        match self {
            AnomalyEvent::RapidSigning { signer, .. }
            | AnomalyEvent::HighFrequency { signer, .. }
            | AnomalyEvent::MissingSigner { signer, .. }
            | AnomalyEvent::TimestampDrift { signer, .. } => Some(*signer),
            AnomalyEvent::SuspiciousPattern { .. } => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AnomalyEvent::RapidSigning { severity, .. }
            | AnomalyEvent::SuspiciousPattern { severity, .. }
            | AnomalyEvent::HighFrequency { severity, .. }
            | AnomalyEvent::MissingSigner { severity, .. }
            | AnomalyEvent::TimestampDrift { severity, .. } => *severity,
        }
    }

    /// Stable, lowercase name for this anomaly kind, used as the tracer's
    /// event kind and as the reputation engine's violation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AnomalyEvent::RapidSigning { .. } => "rapid_signing",
            AnomalyEvent::SuspiciousPattern { .. } => "suspicious_pattern",
            AnomalyEvent::HighFrequency { .. } => "high_frequency",
            AnomalyEvent::MissingSigner { .. } => "missing_signer",
            AnomalyEvent::TimestampDrift { .. } => "timestamp_drift",
        }
    }

    /// Addresses this event should be forwarded to the reputation engine as
    /// violations for. Empty for anomaly kinds that are monitoring-only.
    pub fn violators(&self) -> Vec<Address> {
        match self {
            AnomalyEvent::RapidSigning { signer, .. } => vec![*signer],
            AnomalyEvent::SuspiciousPattern {
                signers: (a, b), ..
            } => vec![*a, *b],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Observation {
    height: u64,
    signer: Address,
    timestamp_secs: u64,
}

/// Bounded observation ring plus the five independent detectors that read
/// it on every `observe()` call. Each detector sees the full window, so a
/// single block can trip more than one of them.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    window: RwLock<VecDeque<Observation>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        let capacity = config.pattern_window_size * 2;
        AnomalyDetector {
            config,
            window: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Feed one sealed block into the window and run every detector over
    /// the resulting state. `known_signers` is the current authority set,
    /// used by the `MissingSigner` detector; `expected_period_secs` anchors
    /// the `TimestampDrift` detector.
    pub fn observe(
        &self,
        height: u64,
        signer: Address,
        timestamp_secs: u64,
        known_signers: &[Address],
        expected_period_secs: u64,
    ) -> Vec<AnomalyEvent> {
        let mut window = self.window.write();
        let previous_timestamp = window.back().map(|o| o.timestamp_secs);
        window.push_back(Observation {
            height,
            signer,
            timestamp_secs,
        });
        let cap = self.config.pattern_window_size * 2;
        while window.len() > cap.max(1) {
            window.pop_front();
        }

        let recent: Vec<&Observation> = window
            .iter()
            .rev()
            .take(self.config.pattern_window_size)
            .collect();

        let mut events = Vec::new();
        events.extend(self.rapid_signing(&recent, signer, height));
        events.extend(self.suspicious_pattern(&recent, height));
        events.extend(self.high_frequency(&recent, signer, height));
        events.extend(self.missing_signer(&recent, known_signers, height));
        if let Some(prev) = previous_timestamp {
            events.extend(self.timestamp_drift(
                signer,
                height,
                timestamp_secs,
                prev,
                expected_period_secs,
            ));
        }
        events
    }

    fn rapid_signing(
        &self,
        recent: &[&Observation],
        signer: Address,
        height: u64,
    ) -> Option<AnomalyEvent> {
        let count = recent.iter().filter(|o| o.signer == signer).count();
        if count > self.config.max_blocks_per_signer {
            let severity = if count > self.config.max_blocks_per_signer * 2 {
                Severity::High
            } else {
                Severity::Medium
            };
            Some(AnomalyEvent::RapidSigning {
                signer,
                height,
                occurrences: count,
                severity,
            })
        } else {
            None
        }
    }

    /// Flags a strict period-2 alternation (`A,B,A,B,...`) sustained across
    /// `suspicious_threshold` consecutive blocks — consistent with two
    /// colluding signers locking out the rest of the committee.
    fn suspicious_pattern(&self, recent: &[&Observation], height: u64) -> Option<AnomalyEvent> {
        let threshold = self.config.suspicious_threshold;
        if recent.len() < threshold || threshold < 4 {
            return None;
        }
        let window = &recent[..threshold];
        let a = window[0].signer;
        let b = window[1].signer;
        if a == b {
            return None;
        }
        let alternates = window
            .iter()
            .enumerate()
            .all(|(i, o)| o.signer == if i % 2 == 0 { a } else { b });
        if alternates {
            Some(AnomalyEvent::SuspiciousPattern {
                height,
                signers: (a, b),
                severity: Severity::Medium,
            })
        } else {
            None
        }
    }

    fn high_frequency(
        &self,
        recent: &[&Observation],
        signer: Address,
        height: u64,
    ) -> Option<AnomalyEvent> {
        if recent.is_empty() {
            return None;
        }
        let share = recent.iter().filter(|o| o.signer == signer).count() as f64
            / recent.len() as f64;
        if share > self.config.max_signer_frequency {
            let severity = if share > self.config.max_signer_frequency * 1.5 {
                Severity::High
            } else {
                Severity::Low
            };
            Some(AnomalyEvent::HighFrequency {
                signer,
                height,
                share,
                severity,
            })
        } else {
            None
        }
    }

    fn missing_signer(
        &self,
        recent: &[&Observation],
        known_signers: &[Address],
        height: u64,
    ) -> Vec<AnomalyEvent> {
        if recent.len() < 10 {
            return Vec::new();
        }
        known_signers
            .iter()
            .filter_map(|&signer| {
                let share = recent.iter().filter(|o| o.signer == signer).count() as f64
                    / recent.len() as f64;
                if share < self.config.min_signer_frequency {
                    Some(AnomalyEvent::MissingSigner {
                        signer,
                        height,
                        share,
                        severity: Severity::Low,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    fn timestamp_drift(
        &self,
        signer: Address,
        height: u64,
        timestamp_secs: u64,
        previous_timestamp_secs: u64,
        expected_period_secs: u64,
    ) -> Option<AnomalyEvent> {
        let actual_delta = timestamp_secs as i64 - previous_timestamp_secs as i64;
        let drift = actual_delta - expected_period_secs as i64;
        if drift.unsigned_abs() > self.config.max_timestamp_drift_secs {
            let severity = if drift.unsigned_abs() > self.config.max_timestamp_drift_secs * 2 {
                Severity::High
            } else {
                Severity::Medium
            };
            Some(AnomalyEvent::TimestampDrift {
                signer,
                height,
                drift_secs: drift,
                severity,
            })
        } else {
            None
        }
    }
}
