//! End-to-end exercises of the full facade: a signer seals a chain of
//! blocks through a minimal in-memory chain reader, and the engine's
//! snapshot/committee/reputation/ACL/tracer subsystems are checked against
//! the resulting state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ethereum_types::{Address, H256};
use parity_crypto::publickey::{KeyPair, Secret};
use poa_consensus::config::EngineConfig;
use poa_consensus::snapshot::ChainReader;
use poa_consensus::PoaEngine;
use poa_types::header::Header;
use poa_types::kv::KvDbStore;
use pretty_assertions::assert_eq;

struct MemoryChain {
    headers: RwLock<HashMap<H256, Header>>,
}

impl MemoryChain {
    fn new() -> Self {
        MemoryChain {
            headers: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, header: Header) {
        self.headers.write().unwrap().insert(header.hash(), header);
    }
}

impl ChainReader for MemoryChain {
    fn header_by_hash(&self, hash: H256) -> Option<Header> {
        self.headers.read().unwrap().get(&hash).cloned()
    }
}

fn keypair(seed: u8) -> KeyPair {
    KeyPair::from_secret(Secret::from([seed; 32])).expect("valid secret")
}

fn genesis_header() -> Header {
    let mut header = Header::new(0, H256::zero(), 1_700_000_000);
    header.extra_data = vec![0u8; 32 + 65];
    header
}

/// Seal one block on top of `parent` with `engine`, whose local signer is
/// already set, then finalize it and insert it into `chain`.
async fn seal_next(
    engine: &PoaEngine<MemoryChain>,
    chain: &MemoryChain,
    parent: &Header,
) -> Header {
    let (header, in_turn) = engine.prepare(parent).expect("prepare");
    let sealed = engine.seal(header, in_turn).await.expect("seal");
    engine.finalize(&sealed).expect("finalize");
    chain.insert(sealed.clone());
    sealed
}

#[tokio::test]
async fn three_signers_rotate_and_chain_stays_verifiable() {
    let chain = Arc::new(MemoryChain::new());
    let store: Arc<dyn poa_types::KvStore> = Arc::new(KvDbStore::in_memory());
    let config = EngineConfig::default();

    let keys: Vec<KeyPair> = (1..=3u8).map(keypair).collect();
    let signers: Vec<Address> = keys.iter().map(|k| k.address()).collect();

    let genesis = genesis_header();
    let genesis_hash = genesis.hash();
    let engine = PoaEngine::new(config, chain.clone(), store);
    engine.init_genesis(genesis_hash, signers.clone());
    chain.insert(genesis.clone());

    let mut parent = genesis;
    for _ in 0..6 {
        // Whichever key is actually in turn for this height sealed it;
        // since small test committees rotate through all three signers in
        // a handful of blocks, trying each key and taking the first success
        // exercises the in-turn/no-turn difficulty split realistically.
        let mut sealed = None;
        for key in &keys {
            engine.set_local_signer(key.clone());
            if let Ok((header, in_turn)) = engine.prepare(&parent) {
                if in_turn {
                    sealed = Some(engine.seal(header, true).await.expect("seal"));
                    break;
                }
            }
        }
        let sealed = sealed.expect("some signer is always in turn");
        engine.finalize(&sealed).expect("finalize");
        chain.insert(sealed.clone());
        parent = sealed;
    }

    assert_eq!(parent.number, 6);
    assert!(engine.tracer().len() > 0);

    // A fresh engine sharing nothing but the chain and genesis signer set
    // must independently accept the block the first engine produced.
    let verifier_store: Arc<dyn poa_types::KvStore> = Arc::new(KvDbStore::in_memory());
    let verifier = PoaEngine::new(EngineConfig::default(), chain.clone(), verifier_store);
    verifier.init_genesis(genesis_hash, signers);
    for height in 1..=parent.number {
        let header = chain
            .headers
            .read()
            .unwrap()
            .values()
            .find(|h| h.number == height)
            .cloned()
            .unwrap();
        verifier.verify_header(&header).expect("independent verification succeeds");
    }
}

#[tokio::test]
async fn an_immediate_reseal_by_the_same_signer_is_rejected() {
    let chain = Arc::new(MemoryChain::new());
    let store: Arc<dyn poa_types::KvStore> = Arc::new(KvDbStore::in_memory());
    let config = EngineConfig::default();

    let keys: Vec<KeyPair> = (1..=4u8).map(keypair).collect();
    let signers: Vec<Address> = keys.iter().map(|k| k.address()).collect();

    let genesis = genesis_header();
    let engine = PoaEngine::new(config, chain.clone(), store);
    engine.init_genesis(genesis.hash(), signers);
    chain.insert(genesis.clone());

    engine.set_local_signer(keys[0].clone());
    let parent = seal_next(&engine, &chain, &genesis).await;

    // The same signer immediately tries again one block later, which the
    // recent-signer rule (limit = floor(4/2)+1 = 3) must reject regardless
    // of whether its difficulty happens to be the in-turn or no-turn value.
    let (mut header, _) = engine.prepare(&parent).expect("prepare");
    let digest = header.sealing_hash();
    let signature =
        parity_crypto::publickey::sign(keys[0].secret(), &digest.as_fixed_bytes().into()).unwrap();
    let seal_bytes: [u8; 65] = signature.into();
    let len = header.extra_data.len();
    header.extra_data.truncate(len - 65);
    header.extra_data.extend_from_slice(&seal_bytes);

    let result = engine.verify_header(&header);
    assert!(result.is_err(), "sealing twice inside the window must be rejected");
}

#[tokio::test]
async fn a_signer_outside_the_active_committee_cannot_seal_or_verify() {
    let chain = Arc::new(MemoryChain::new());
    let store: Arc<dyn poa_types::KvStore> = Arc::new(KvDbStore::in_memory());
    let mut config = EngineConfig::default();
    config.committee.small_set_size = 1;

    let keys: Vec<KeyPair> = (1..=4u8).map(keypair).collect();
    let signers: Vec<Address> = keys.iter().map(|k| k.address()).collect();

    let genesis = genesis_header();
    let genesis_hash = genesis.hash();
    let engine = PoaEngine::new(config, chain.clone(), store);
    engine.init_genesis(genesis_hash, signers);
    chain.insert(genesis.clone());

    let record = engine
        .trigger_committee_selection(0, genesis_hash)
        .expect("selection succeeds with every signer as a fallback candidate");
    assert_eq!(record.selected.len(), 1);

    let outsider = keys
        .iter()
        .find(|k| !record.selected.contains(&k.address()))
        .expect("three of the four signers are excluded");

    engine.set_local_signer(outsider.clone());
    let (header, _) = engine.prepare(&genesis).expect("prepare");
    let result = engine.seal(header, true).await;
    assert!(
        matches!(result, Err(poa_consensus::ConsensusError::UnauthorizedSigner(_))),
        "a signer outside the active committee must be refused before the wait, got {result:?}"
    );
}
