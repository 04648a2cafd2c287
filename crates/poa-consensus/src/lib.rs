//! Enhanced proof-of-authority consensus core. Wires together signer-set
//! snapshots, leader election, committee selection, reputation, anomaly
//! detection, ACLs, dynamic timing and an audit trail behind one facade
//! that a block-assembly layer drives through a single engine interface.

pub mod acl;
pub mod anomaly;
pub mod committee;
pub mod config;
pub mod election;
pub mod error;
pub mod reputation;
pub mod snapshot;
pub mod timing;
pub mod tracer;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ethereum_types::{Address, H256, U256};
use log::{debug, trace};
use parity_crypto::publickey::{sign, KeyPair};
use parking_lot::RwLock;
use poa_types::extra::{encode_extra_unsealed, SEAL_LENGTH};
use poa_types::{Header, KvStore, SignerRecovery};
use tokio::sync::Notify;

pub use acl::AccessControlList;
pub use anomaly::AnomalyDetector;
pub use committee::CommitteeSelector;
pub use config::EngineConfig;
pub use error::ConsensusError;
pub use reputation::ReputationEngine;
pub use snapshot::{ChainReader, Snapshot, SnapshotEngine};
pub use timing::TimingController;
pub use tracer::Tracer;

/// The sealing pipeline's current stage. Every transition runs
/// under the engine's single state lock, so two overlapping `seal()` calls
/// can't both reach `Signing` at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Preparing,
    Waiting,
    Signing,
    Broadcasting,
}

/// Top-level facade a block-assembly layer drives: `prepare()` a header,
/// `seal()` it once its turn and wiggle have elapsed, `finalize()` it once
/// imported, and `verify_header()` everyone else's headers the same way.
pub struct PoaEngine<C: ChainReader> {
    config: EngineConfig,
    snapshots: SnapshotEngine<C>,
    committee: CommitteeSelector,
    reputation: ReputationEngine,
    anomaly: AnomalyDetector,
    acl: AccessControlList,
    timing: TimingController,
    tracer: Tracer,
    recovery: SignerRecovery,
    local: RwLock<Option<KeyPair>>,
    state: RwLock<EngineState>,
    cancel: Notify,
}

impl<C: ChainReader> PoaEngine<C> {
    pub fn new(config: EngineConfig, chain: Arc<C>, store: Arc<dyn KvStore>) -> Self {
        let reputation_store = store.clone();
        PoaEngine {
            snapshots: SnapshotEngine::new(chain, config.snapshot.clone(), store),
            committee: CommitteeSelector::new(config.committee.clone()),
            reputation: ReputationEngine::new(config.reputation.clone(), reputation_store),
            anomaly: AnomalyDetector::new(config.anomaly.clone()),
            acl: AccessControlList::new(config.acl.clone()),
            timing: TimingController::new(config.timing.clone()),
            tracer: Tracer::new(config.tracer_capacity),
            recovery: SignerRecovery::new(),
            local: RwLock::new(None),
            state: RwLock::new(EngineState::Idle),
            config,
            cancel: Notify::new(),
        }
    }

    pub fn init_genesis(&self, hash: H256, signers: Vec<Address>) {
        self.snapshots.init_genesis(hash, signers);
    }

    pub fn set_local_signer(&self, keypair: KeyPair) {
        *self.local.write() = Some(keypair);
    }

    pub fn register_validator(&self, address: Address, stake: U256) {
        self.committee.add_validator(address, stake);
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn cancel_seal(&self) {
        self.cancel.notify_waiters();
    }

    pub fn reputation(&self) -> &ReputationEngine {
        &self.reputation
    }

    pub fn acl(&self) -> &AccessControlList {
        &self.acl
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn committee(&self) -> &CommitteeSelector {
        &self.committee
    }

    /// The block-assembly layer calls this once it knows how many
    /// transactions the just-sealed block carried; transaction selection
    /// itself is out of this crate's scope.
    pub fn record_transaction_count(&self, count: u64) {
        self.timing.record_tx_count(count);
    }

    pub fn author(&self, header: &Header) -> Result<Address, ConsensusError> {
        Ok(self.recovery.author(header)?)
    }

    /// The signer set election should draw from at `height`: the current
    /// committee intersected with the snapshot's authority set if a
    /// committee is active, or the full authority set otherwise. The bool is
    /// `true` only when that intersection is genuinely restricting the set,
    /// i.e. a committee is active and at least one of its members is
    /// authorized — callers use it to decide whether membership in the
    /// returned set should be enforced or merely informs election. Falling
    /// back to the full set is the classic degrade path for when committee
    /// selection has no active validators to draw from.
    fn eligible_signers(&self, snapshot: &Snapshot) -> (Vec<Address>, bool) {
        match self.committee.current() {
            Some(record) => {
                let restricted: Vec<Address> = snapshot
                    .signers
                    .iter()
                    .copied()
                    .filter(|s| record.selected.contains(s))
                    .collect();
                if restricted.is_empty() {
                    (snapshot.signers.clone(), false)
                } else {
                    (restricted, true)
                }
            }
            None => (snapshot.signers.clone(), false),
        }
    }

    /// Verify an externally received header against the snapshot chain,
    /// committing the resulting snapshot and feeding every ambient
    /// subsystem (reputation, anomaly, committee, ACL, tracer) on success.
    pub fn verify_header(&self, header: &Header) -> Result<(), ConsensusError> {
        if header.number == 0 {
            return Ok(());
        }
        let sealer = match self.author(header) {
            Ok(sealer) => sealer,
            Err(e) => {
                log::warn!("rejecting header {}: cannot recover author: {}", header.number, e);
                return Err(e);
            }
        };
        if let Err(e) = self.acl.validate(sealer, header.timestamp) {
            log::warn!("rejecting header {} from {:?}: {}", header.number, sealer, e);
            return Err(e);
        }

        let parent = self
            .snapshots
            .snapshot_at(header.number - 1, header.parent_hash)?;
        let (eligible, committee_active) = self.eligible_signers(&parent);
        if committee_active && !eligible.contains(&sealer) {
            log::warn!(
                "rejecting header {} from {:?}: not a member of the active committee",
                header.number,
                sealer
            );
            return Err(ConsensusError::UnauthorizedSigner(sealer));
        }
        let in_turn = election::elect(header.number, header.parent_hash, &eligible);
        let expected = U256::from(election::difficulty_for(sealer, &in_turn));
        if header.difficulty != expected {
            log::warn!(
                "rejecting header {} from {:?}: difficulty {} != expected {}",
                header.number,
                sealer,
                header.difficulty,
                expected
            );
            return Err(ConsensusError::BadDifficulty {
                actual: header.difficulty.as_u64(),
            });
        }

        let snapshot = match parent.apply(header, sealer) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("rejecting header {} from {:?}: {}", header.number, sealer, e);
                return Err(e);
            }
        };
        self.commit_and_observe(header, sealer, snapshot);
        Ok(())
    }

    /// Build the next header's consensus fields (nonce/coinbase are left at
    /// their no-vote defaults; a caller wanting to cast a vote sets them
    /// before sealing). The seal itself is zeroed, ready for `seal()`.
    pub fn prepare(&self, parent: &Header) -> Result<(Header, bool), ConsensusError> {
        let local = self.local.read().clone().ok_or(ConsensusError::NoSigner)?;
        let parent_snapshot = self.snapshots.snapshot_at(parent.number, parent.hash())?;
        let number = parent.number + 1;

        let mut header = Header::new(number, parent.hash(), now_secs());
        header.extra_data = if parent_snapshot.is_checkpoint(number) {
            encode_extra_unsealed([0u8; 32], Some(&parent_snapshot.signers))
        } else {
            encode_extra_unsealed([0u8; 32], None)
        };

        let (eligible, _) = self.eligible_signers(&parent_snapshot);
        let in_turn = election::elect(number, parent.hash(), &eligible);
        let local_address = local.address();
        header.difficulty = U256::from(election::difficulty_for(local_address, &in_turn));

        *self.state.write() = EngineState::Preparing;
        Ok((header, local_address == in_turn.signer))
    }

    /// Wait out this signer's turn (in-turn signers wait the bare period;
    /// out-of-turn signers add the deterministic wiggle), then sign. Refuses
    /// up front exactly like `verify_header` would refuse the header once it
    /// came back around: an unauthorized, recently-signed, blacklisted, or
    /// out-of-committee local signer never gets as far as scheduling the
    /// delay. Cancels cleanly if `cancel_seal()` is called while waiting.
    pub async fn seal(&self, mut header: Header, in_turn: bool) -> Result<Header, ConsensusError> {
        let local = self.local.read().clone().ok_or(ConsensusError::NoSigner)?;
        let address = local.address();

        let parent = self
            .snapshots
            .snapshot_at(header.number - 1, header.parent_hash)?;
        if !parent.is_authorized(address) {
            return Err(ConsensusError::UnauthorizedSigner(address));
        }
        if parent.recently_signed(address, header.number) {
            return Err(ConsensusError::RecentlySigned(address));
        }
        self.acl.validate(address, header.timestamp)?;
        let (eligible, committee_active) = self.eligible_signers(&parent);
        if committee_active && !eligible.contains(&address) {
            return Err(ConsensusError::UnauthorizedSigner(address));
        }

        *self.state.write() = EngineState::Waiting;
        let delay = self.timing.sealing_delay(header.number, address, in_turn);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.notified() => {
                *self.state.write() = EngineState::Idle;
                return Err(ConsensusError::Cancelled);
            }
        }

        *self.state.write() = EngineState::Signing;
        let digest = header.sealing_hash();
        let signature = sign(local.secret(), &digest.as_fixed_bytes().into())
            .map_err(|e| ConsensusError::Codec(poa_types::CodecError::BadSignature(e.to_string())))?;
        let seal_bytes: [u8; SEAL_LENGTH] = signature.into();
        let len = header.extra_data.len();
        header.extra_data.truncate(len - SEAL_LENGTH);
        header.extra_data.extend_from_slice(&seal_bytes);

        *self.state.write() = EngineState::Broadcasting;
        let result = Ok(header);
        *self.state.write() = EngineState::Idle;
        result
    }

    /// Commit a header we sealed ourselves. Equivalent to `verify_header`'s
    /// bookkeeping tail, minus the checks only meaningful for headers we
    /// didn't produce (difficulty sanity, ACL gating).
    pub fn finalize(&self, header: &Header) -> Result<(), ConsensusError> {
        if header.number == 0 {
            return Ok(());
        }
        let sealer = self.author(header)?;
        let parent = self
            .snapshots
            .snapshot_at(header.number - 1, header.parent_hash)?;
        let snapshot = parent.apply(header, sealer)?;
        self.commit_and_observe(header, sealer, snapshot);
        Ok(())
    }

    /// Force a committee reselection at `height`/`hash` outside the normal
    /// due-for-reselection cadence, e.g. from an operator control surface.
    pub fn trigger_committee_selection(
        &self,
        height: u64,
        hash: H256,
    ) -> Result<committee::SelectionRecord, ConsensusError> {
        let snapshot = self.snapshots.snapshot_at(height, hash)?;
        self.committee
            .select(height, hash, &snapshot.signers, &self.reputation)
    }

    /// Run the reputation engine's decay-and-partial-reset cycle immediately
    /// rather than waiting for the next sealed block to trigger it.
    pub fn trigger_decay(&self, now_secs: u64) -> Vec<reputation::ReputationEvent> {
        self.reputation.update_all(now_secs)
    }

    pub fn decay_history(&self, limit: usize) -> Vec<reputation::ReputationEvent> {
        self.reputation.get_decay_history(limit)
    }

    pub fn timing_stats(&self) -> timing::TimingStats {
        self.timing.get_stats()
    }

    pub fn timing_config(&self) -> &config::TimingConfig {
        self.timing.get_config()
    }

    pub fn calc_difficulty(&self, parent: &Header) -> Result<U256, ConsensusError> {
        let local = self.local.read().clone().ok_or(ConsensusError::NoSigner)?;
        let parent_snapshot = self.snapshots.snapshot_at(parent.number, parent.hash())?;
        let (eligible, _) = self.eligible_signers(&parent_snapshot);
        let in_turn = election::elect(parent.number + 1, parent.hash(), &eligible);
        Ok(U256::from(election::difficulty_for(local.address(), &in_turn)))
    }

    fn commit_and_observe(&self, header: &Header, sealer: Address, snapshot: Snapshot) {
        let timestamp_ms = header.timestamp.saturating_mul(1000);
        let committed = self.snapshots.commit(snapshot);
        self.reputation.register(sealer, header.timestamp);
        self.reputation.record_block_mined(sealer, header.number, header.timestamp);
        self.reputation.record_uptime_tick(sealer, header.timestamp);
        trace!("recorded block-mined and uptime ticks for {:?} at height {}", sealer, header.number);

        let (period, _) = self.timing.current_period();
        let anomalies = self.anomaly.observe(
            header.number,
            sealer,
            header.timestamp,
            &committed.signers,
            period.as_secs(),
        );
        for event in &anomalies {
            for offender in event.violators() {
                self.reputation.record_violation(
                    offender,
                    header.number,
                    event.kind(),
                    format!("{event:?}"),
                    header.timestamp,
                );
            }
            self.tracer.record(
                header.number,
                event.kind(),
                event.severity(),
                event.violators().first().copied().unwrap_or(Address::zero()),
                serde_json::json!({ "detail": format!("{event:?}") }),
                timestamp_ms,
            );
        }

        if self.committee.due_for_reselection(header.number) {
            match self
                .committee
                .select(header.number, header.hash(), &committed.signers, &self.reputation)
            {
                Ok(record) => debug!(
                    "committee reselected at height {}: {} member(s)",
                    header.number,
                    record.selected.len()
                ),
                Err(e) => log::warn!("committee reselection skipped at height {}: {}", header.number, e),
            }
        }

        let decay_events = self.reputation.update_all(header.timestamp);
        if !decay_events.is_empty() {
            debug!(
                "reputation update cycle at height {} produced {} event(s)",
                header.number,
                decay_events.len()
            );
        }

        self.acl
            .auto_manage(sealer, self.reputation.composite_of(sealer), header.timestamp);
        self.tracer.record(
            header.number,
            "header_finalized",
            anomaly::Severity::Low,
            sealer,
            serde_json::json!({ "sealer": format!("{sealer:?}") }),
            timestamp_ms,
        );
        let round_length = self.config.round_length.max(1);
        if header.number % round_length == 0 {
            let root = self.tracer.anchor_round(header.number / round_length);
            debug!("anchored audit root {:?} for round {}", root, header.number / round_length);
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_secs()
}
