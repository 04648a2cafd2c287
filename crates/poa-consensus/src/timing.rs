//! Dynamic timing controller: adjusts the block period from recent
//! transaction load, and computes each signer's sealing delay.

use std::collections::VecDeque;
use std::time::Duration;

use ethereum_types::Address;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::config::TimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodReason {
    /// Recent average transaction count exceeded `tx_high`.
    HighLoad,
    /// Recent average transaction count fell below `tx_low`.
    LowLoad,
    /// Average sits inside `[tx_low, tx_high]`; the base period holds.
    Nominal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingStats {
    pub average_tx_count: f64,
    pub window_len: usize,
    pub current_period_secs: u64,
    pub reason: PeriodReason,
}

pub struct TimingController {
    config: TimingConfig,
    tx_window: RwLock<VecDeque<u64>>,
}

impl TimingController {
    pub fn new(config: TimingConfig) -> Self {
        let capacity = config.tx_window;
        TimingController {
            config,
            tx_window: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record the transaction count of the most recently sealed block.
    pub fn record_tx_count(&self, count: u64) {
        let mut window = self.tx_window.write();
        window.push_back(count);
        while window.len() > self.config.tx_window.max(1) {
            window.pop_front();
        }
    }

    fn average_tx_count(&self) -> f64 {
        let window = self.tx_window.read();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<u64>() as f64 / window.len() as f64
    }

    /// Current target period given the tx-count ring buffer, per the
    /// four-branch rule: high load shortens the period to `min`, low load
    /// lengthens it to `max`, otherwise the configured `base` holds, always
    /// clamped to `[min, max]`.
    pub fn current_period(&self) -> (Duration, PeriodReason) {
        let average = self.average_tx_count();
        let (period, reason) = if average > self.config.tx_high as f64 {
            (self.config.min_period(), PeriodReason::HighLoad)
        } else if average < self.config.tx_low as f64 {
            (self.config.max_period(), PeriodReason::LowLoad)
        } else {
            (self.config.base_period(), PeriodReason::Nominal)
        };
        let clamped = period.clamp(self.config.min_period(), self.config.max_period());
        (clamped, reason)
    }

    /// Delay before this signer should broadcast its sealed block. In-turn
    /// signers wait exactly the target period; out-of-turn signers add a
    /// deterministic jitter (seeded by height and address, so every node
    /// that replays the same block computes the same wiggle) bounded by
    /// `wiggle_max_ms`, which staggers them behind the in-turn signer.
    pub fn sealing_delay(&self, height: u64, signer: Address, in_turn: bool) -> Duration {
        let (period, _) = self.current_period();
        if in_turn {
            return period;
        }
        let wiggle_ms = wiggle_for(height, signer, self.config.wiggle_max_ms);
        period + Duration::from_millis(wiggle_ms)
    }

    /// Snapshot of the controller's current load reading and the period it
    /// produces, for callers that want to surface timing state without
    /// recomputing it themselves.
    pub fn get_stats(&self) -> TimingStats {
        let (period, reason) = self.current_period();
        TimingStats {
            average_tx_count: self.average_tx_count(),
            window_len: self.tx_window.read().len(),
            current_period_secs: period.as_secs(),
            reason,
        }
    }

    pub fn get_config(&self) -> &TimingConfig {
        &self.config
    }
}

fn wiggle_for(height: u64, signer: Address, wiggle_max_ms: u64) -> u64 {
    if wiggle_max_ms == 0 {
        return 0;
    }
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&height.to_le_bytes());
    bytes[8..16].copy_from_slice(&signer.as_bytes()[..8]);
    if bytes == [0u8; 16] {
        bytes[15] = 1;
    }
    let mut rng = XorShiftRng::from_seed(bytes);
    rng.gen_range(0..=wiggle_max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn high_load_shortens_the_period() {
        let controller = TimingController::new(TimingConfig {
            tx_window: 4,
            tx_high: 50,
            ..Default::default()
        });
        for _ in 0..4 {
            controller.record_tx_count(200);
        }
        let (period, reason) = controller.current_period();
        assert_eq!(reason, PeriodReason::HighLoad);
        assert_eq!(period, TimingConfig::default().min_period());
    }

    #[test]
    fn low_load_lengthens_the_period() {
        let controller = TimingController::new(TimingConfig {
            tx_window: 4,
            tx_low: 5,
            ..Default::default()
        });
        for _ in 0..4 {
            controller.record_tx_count(0);
        }
        let (period, reason) = controller.current_period();
        assert_eq!(reason, PeriodReason::LowLoad);
        assert_eq!(period, TimingConfig::default().max_period());
    }

    #[test]
    fn nominal_load_holds_the_base_period() {
        let controller = TimingController::new(TimingConfig {
            tx_window: 4,
            tx_low: 5,
            tx_high: 100,
            ..Default::default()
        });
        for _ in 0..4 {
            controller.record_tx_count(20);
        }
        let (period, reason) = controller.current_period();
        assert_eq!(reason, PeriodReason::Nominal);
        assert_eq!(period, TimingConfig::default().base_period());
    }

    #[test]
    fn in_turn_signer_gets_no_wiggle() {
        let controller = TimingController::new(TimingConfig::default());
        let delay = controller.sealing_delay(10, addr(1), true);
        assert_eq!(delay, TimingConfig::default().base_period());
    }

    #[test]
    fn get_stats_reflects_the_current_window_and_period() {
        let controller = TimingController::new(TimingConfig {
            tx_window: 4,
            tx_high: 50,
            ..Default::default()
        });
        for _ in 0..4 {
            controller.record_tx_count(200);
        }
        let stats = controller.get_stats();
        assert_eq!(stats.window_len, 4);
        assert_eq!(stats.average_tx_count, 200.0);
        assert_eq!(stats.reason, PeriodReason::HighLoad);
        assert_eq!(stats.current_period_secs, TimingConfig::default().min_period().as_secs());
    }

    #[test]
    fn out_of_turn_wiggle_is_deterministic_and_bounded() {
        let controller = TimingController::new(TimingConfig::default());
        let a = controller.sealing_delay(10, addr(2), false);
        let b = controller.sealing_delay(10, addr(2), false);
        assert_eq!(a, b);
        let base = TimingConfig::default().base_period();
        assert!(a >= base);
        assert!(a <= base + Duration::from_millis(TimingConfig::default().wiggle_max_ms));
    }
}
