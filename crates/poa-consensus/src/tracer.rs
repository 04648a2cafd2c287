//! Tamper-evident audit trace: a bounded ring of consensus events anchored
//! by a Merkle root recomputed lazily, with per-round
//! anchors so an external auditor can pin a root to a block range without
//! replaying the whole ring.

use std::collections::BTreeMap;

use ethereum_types::{Address, H256};
use keccak_hash::keccak;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::anomaly::Severity;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub id: u64,
    pub kind: String,
    pub level: Severity,
    pub height: u64,
    pub address: Address,
    pub payload: serde_json::Value,
    pub timestamp_ms: u64,
    pub hash: H256,
}

impl TraceEvent {
    fn compute_hash(
        kind: &str,
        height: u64,
        address: Address,
        payload: &serde_json::Value,
        timestamp_ms: u64,
    ) -> H256 {
        let mut buf = Vec::new();
        buf.extend_from_slice(kind.as_bytes());
        buf.extend_from_slice(&height.to_le_bytes());
        buf.extend_from_slice(address.as_bytes());
        // `serde_json::Value`'s map is `BTreeMap`-backed without the
        // `preserve_order` feature, so this serialization is already
        // canonical: object keys come out sorted regardless of insertion
        // order.
        buf.extend_from_slice(payload.to_string().as_bytes());
        buf.extend_from_slice(&timestamp_ms.to_le_bytes());
        keccak(buf)
    }
}

struct State {
    events: Vec<TraceEvent>,
    next_id: u64,
    capacity: usize,
    min_level: Severity,
    cached_root: Option<H256>,
    round_anchors: BTreeMap<u64, H256>,
}

pub struct Tracer {
    state: Mutex<State>,
}

impl Tracer {
    pub fn new(capacity: usize) -> Self {
        Tracer {
            state: Mutex::new(State {
                events: Vec::new(),
                next_id: 0,
                capacity: capacity.max(1),
                min_level: Severity::Low,
                cached_root: None,
                round_anchors: BTreeMap::new(),
            }),
        }
    }

    /// Raise or lower the floor below which `record` drops events instead
    /// of appending them. Defaults to `Severity::Low`, i.e. nothing is
    /// dropped until a caller asks for a quieter trace.
    pub fn set_level(&self, level: Severity) {
        self.state.lock().min_level = level;
    }

    pub fn level(&self) -> Severity {
        self.state.lock().min_level
    }

    /// Append one event at `level`, or drop it silently if `level` is below
    /// the tracer's current floor. `address` is the actor the event is
    /// about, or `Address::zero()` for events with no single actor (e.g. a
    /// committee reselection). Returns the event's id, or `None` if it was
    /// dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        height: u64,
        kind: impl Into<String>,
        level: Severity,
        address: Address,
        payload: serde_json::Value,
        timestamp_ms: u64,
    ) -> Option<u64> {
        let mut state = self.state.lock();
        if level < state.min_level {
            return None;
        }
        let kind = kind.into();
        let id = state.next_id;
        state.next_id += 1;
        let hash = TraceEvent::compute_hash(&kind, height, address, &payload, timestamp_ms);
        let event = TraceEvent {
            id,
            kind,
            level,
            height,
            address,
            payload,
            timestamp_ms,
            hash,
        };
        state.events.push(event);
        let capacity = state.capacity;
        if state.events.len() > capacity {
            let overflow = state.events.len() - capacity;
            state.events.drain(0..overflow);
        }
        state.cached_root = None;
        Some(id)
    }

    pub fn filter(&self, mut predicate: impl FnMut(&TraceEvent) -> bool) -> Vec<TraceEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Most recent `limit` events matching `kind` (if given) and at least
    /// `min_level`, newest first.
    pub fn get_events(&self, kind: Option<&str>, min_level: Severity, limit: usize) -> Vec<TraceEvent> {
        let mut matched: Vec<TraceEvent> = self.filter(|e| {
            e.level >= min_level && kind.map(|k| e.kind == k).unwrap_or(true)
        });
        matched.reverse();
        matched.truncate(limit);
        matched
    }

    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.state.lock().events)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.events.clear();
        state.cached_root = None;
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merkle root of the current ring, recomputed only when the ring has
    /// changed since the last call.
    pub fn root(&self) -> H256 {
        let mut state = self.state.lock();
        if let Some(root) = state.cached_root {
            return root;
        }
        let leaves: Vec<H256> = state.events.iter().map(|e| e.hash).collect();
        let root = merkle_root(&leaves);
        state.cached_root = Some(root);
        root
    }

    /// Snapshot the current root under `round`, for callers that need to
    /// cite "the audit root as of round N" later even after the ring has
    /// moved past events from that round.
    pub fn anchor_round(&self, round: u64) -> H256 {
        let root = self.root();
        self.state.lock().round_anchors.insert(round, root);
        root
    }

    pub fn round_anchor(&self, round: u64) -> Option<H256> {
        self.state.lock().round_anchors.get(&round).copied()
    }

    /// Sibling hashes from `id`'s leaf up to the root, bottom-up, or `None`
    /// if `id` has aged out of the ring.
    pub fn inclusion_proof(&self, id: u64) -> Option<Vec<H256>> {
        let state = self.state.lock();
        let index = state.events.iter().position(|e| e.id == id)?;
        let leaves: Vec<H256> = state.events.iter().map(|e| e.hash).collect();
        Some(merkle_proof(&leaves, index))
    }
}

/// Verify `leaf` plus `proof` reconstructs `root`. `index` is the leaf's
/// position among the events at proof-generation time.
pub fn verify_proof(leaf: H256, index: usize, proof: &[H256], root: H256) -> bool {
    let mut hash = leaf;
    let mut idx = index;
    for sibling in proof {
        hash = if idx % 2 == 0 {
            hash_pair(hash, *sibling)
        } else {
            hash_pair(*sibling, hash)
        };
        idx /= 2;
    }
    hash == root
}

fn hash_pair(left: H256, right: H256) -> H256 {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(left.as_bytes());
    buf.extend_from_slice(right.as_bytes());
    keccak(buf)
}

fn merkle_root(leaves: &[H256]) -> H256 {
    if leaves.is_empty() {
        return H256::zero();
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = pair_up(&level);
    }
    level[0]
}

fn pair_up(level: &[H256]) -> Vec<H256> {
    let mut next = Vec::with_capacity(level.len().div_ceil(2));
    let mut i = 0;
    while i < level.len() {
        if i + 1 < level.len() {
            next.push(hash_pair(level[i], level[i + 1]));
        } else {
            next.push(hash_pair(level[i], level[i]));
        }
        i += 2;
    }
    next
}

fn merkle_proof(leaves: &[H256], mut index: usize) -> Vec<H256> {
    let mut proof = Vec::new();
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
        let sibling = *level.get(sibling_index).unwrap_or(&level[index]);
        proof.push(sibling);
        level = pair_up(&level);
        index /= 2;
    }
    proof
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn rec(tracer: &Tracer, height: u64, kind: &str, detail: &str, ts: u64) -> Option<u64> {
        tracer.record(height, kind, Severity::Low, Address::zero(), json!({ "detail": detail }), ts)
    }

    #[test]
    fn root_changes_as_events_are_recorded() {
        let tracer = Tracer::new(100);
        let empty_root = tracer.root();
        rec(&tracer, 1, "header_sealed", "block 1", 1_000);
        assert_ne!(tracer.root(), empty_root);
    }

    #[test]
    fn ring_is_bounded_by_capacity() {
        let tracer = Tracer::new(3);
        for i in 0..10 {
            rec(&tracer, i, "tick", &format!("{i}"), i);
        }
        assert_eq!(tracer.len(), 3);
    }

    #[test]
    fn inclusion_proof_verifies_against_the_root() {
        let tracer = Tracer::new(100);
        let ids: Vec<u64> = (0..7)
            .map(|i| rec(&tracer, i, "tick", &format!("{i}"), i).expect("not dropped"))
            .collect();
        let root = tracer.root();
        for id in ids {
            let proof = tracer.inclusion_proof(id).expect("present");
            let event = tracer
                .filter(|e| e.id == id)
                .into_iter()
                .next()
                .expect("recorded");
            assert!(verify_proof(event.hash, id as usize, &proof, root));
        }
    }

    #[test]
    fn round_anchor_is_stable_after_more_events_arrive() {
        let tracer = Tracer::new(100);
        rec(&tracer, 1, "header_sealed", "block 1", 1_000);
        let anchored = tracer.anchor_round(1);
        rec(&tracer, 2, "header_sealed", "block 2", 1_015);
        assert_eq!(tracer.round_anchor(1), Some(anchored));
        assert_ne!(tracer.root(), anchored);
    }

    #[test]
    fn filter_finds_only_matching_events() {
        let tracer = Tracer::new(100);
        rec(&tracer, 1, "vote_cast", "a->b", 1_000);
        rec(&tracer, 2, "header_sealed", "block 2", 1_015);
        let votes = tracer.filter(|e| e.kind == "vote_cast");
        assert_eq!(votes.len(), 1);
    }

    #[test]
    fn set_level_drops_events_below_the_floor() {
        let tracer = Tracer::new(100);
        tracer.set_level(Severity::High);
        let dropped = tracer.record(1, "anomaly", Severity::Medium, addr(1), json!({}), 1_000);
        assert!(dropped.is_none());
        assert_eq!(tracer.len(), 0);
        let kept = tracer.record(2, "anomaly", Severity::Critical, addr(1), json!({}), 1_015);
        assert!(kept.is_some());
        assert_eq!(tracer.len(), 1);
    }

    #[test]
    fn get_events_filters_by_kind_and_level_and_caps_the_result() {
        let tracer = Tracer::new(100);
        tracer.record(1, "anomaly", Severity::Low, addr(1), json!({}), 1_000);
        tracer.record(2, "anomaly", Severity::High, addr(1), json!({}), 1_015);
        tracer.record(3, "header_finalized", Severity::High, addr(1), json!({}), 1_030);

        let anomalies = tracer.get_events(Some("anomaly"), Severity::Low, 10);
        assert_eq!(anomalies.len(), 2);

        let high_only = tracer.get_events(None, Severity::High, 10);
        assert_eq!(high_only.len(), 2);

        let capped = tracer.get_events(None, Severity::Low, 1);
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].height, 3, "newest event comes first");
    }

    #[test]
    fn identical_payloads_at_different_heights_hash_differently() {
        let a = TraceEvent::compute_hash("anomaly", 1, addr(1), &json!({ "x": 1 }), 1_000);
        let b = TraceEvent::compute_hash("anomaly", 2, addr(1), &json!({ "x": 1 }), 1_000);
        assert_ne!(a, b);
    }
}
