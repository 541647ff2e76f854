//! End-to-end sequencing scenarios against the in-process engine and L1.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, Bytes, U256};
use secp256k1::SecretKey;
use tokio::sync::{mpsc, watch};

use tempo::{
    batcher::{execute_tx::ExecuteTxBuilder, Batch, BatchBuilder},
    common::BlockInfo,
    engine::MockEngine,
    errors::FatalError,
    forkchoice::SharedBlockState,
    l1::{mock::MockL1, DerivationEvent},
    mempool::{InclusionPredicate, Mempool},
    node::ReceiptStore,
    oracle::{AccountCache, AccountState},
    sequencer::{BatchSubmitter, SequencerConfig, SequencingDriver},
    transaction::{sign_digest, LegacyTransaction, ParsedTransaction, Signature},
};

fn signed_legacy(key: &SecretKey, nonce: u64, gas_price: u64) -> ParsedTransaction {
    let mut tx = LegacyTransaction {
        nonce,
        gas_price: U256::from(gas_price),
        gas_limit: 21000,
        to: Some(Address::repeat_byte(0x22)),
        value: U256::ZERO,
        data: Bytes::new(),
        signature: Signature {
            v: 37,
            ..Default::default()
        },
    };
    let (rec, r, s) = sign_digest(tx.signing_digest(), key);
    tx.signature = Signature {
        v: 35 + 2 + rec as u64,
        r,
        s,
    };
    ParsedTransaction::parse(tempo::common::RawTransaction(alloy_rlp::encode(&tx))).unwrap()
}

struct Harness {
    driver: SequencingDriver<MockEngine>,
    engine: Arc<MockEngine>,
    mempool: Arc<Mempool>,
    accounts: Arc<AccountCache>,
    state: SharedBlockState,
    receipts: Arc<ReceiptStore>,
    derivation_tx: mpsc::Sender<DerivationEvent>,
    batch_rx: mpsc::Receiver<Batch>,
    _shutdown: watch::Sender<bool>,
}

fn harness(batch_size_limit: usize) -> Harness {
    let genesis = BlockInfo::default();
    let engine = Arc::new(MockEngine::new(genesis));
    let mempool = Arc::new(Mempool::new(1000));
    let accounts = Arc::new(AccountCache::default());
    let state = SharedBlockState::new(genesis);
    let receipts = Arc::new(ReceiptStore::new(1000));
    let (derivation_tx, derivation_rx) = mpsc::channel(64);
    let (batch_tx, batch_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let driver = SequencingDriver::new(
        engine.clone(),
        mempool.clone(),
        accounts.clone(),
        state.clone(),
        BatchBuilder::new(batch_size_limit, usize::MAX, Duration::from_secs(3600)),
        derivation_rx,
        batch_tx,
        receipts.clone(),
        SequencerConfig {
            tick_interval: Duration::from_millis(10),
            block_gas_limit: 30_000_000,
            max_txs_per_block: 1000,
            fee_recipient: Address::repeat_byte(0x0f),
        },
        shutdown_rx,
    );

    Harness {
        driver,
        engine,
        mempool,
        accounts,
        state,
        receipts,
        derivation_tx,
        batch_rx,
        _shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn admitted_transaction_is_included_once() {
    let mut h = harness(1000);
    let key = SecretKey::from_slice(&[0x01; 32]).unwrap();
    let tx = signed_legacy(&key, 0, 1);
    h.accounts.update(
        tx.sender,
        AccountState {
            nonce: 0,
            balance: U256::from(10u64).pow(U256::from(18u64)),
        },
    );
    h.mempool.insert(tx.clone(), None).unwrap();

    h.driver.tick().await.unwrap();

    assert!(!h.mempool.contains(&tx.hash));
    let receipt = h.receipts.get(&tx.hash).expect("receipt retrievable");
    assert_eq!(receipt.block_number, 1);
    assert_eq!(h.state.snapshot().unsafe_head.number, 1);
}

#[tokio::test]
async fn unsafe_chain_links_parent_hashes() {
    let mut h = harness(1000);
    let mut parents = vec![h.state.snapshot().unsafe_head];
    for _ in 0..3 {
        h.driver.tick().await.unwrap();
        parents.push(h.state.snapshot().unsafe_head);
    }
    for pair in parents.windows(2) {
        assert_eq!(pair[1].parent_hash, pair[0].hash);
        assert_eq!(pair[1].number, pair[0].number + 1);
    }
}

#[tokio::test]
async fn conditional_transaction_respects_block_ceiling() {
    let mut h = harness(1000);
    // current height 150: the ceiling of 100 can never be met
    let mut parent = h.state.snapshot().unsafe_head;
    for _ in 0..150 {
        h.driver.tick().await.unwrap();
        let next = h.state.snapshot().unsafe_head;
        assert_eq!(next.number, parent.number + 1);
        parent = next;
    }

    let key = SecretKey::from_slice(&[0x02; 32]).unwrap();
    let tx = signed_legacy(&key, 0, 1);
    h.mempool
        .insert(
            tx.clone(),
            Some(InclusionPredicate {
                block_number_max: Some(100),
                ..Default::default()
            }),
        )
        .unwrap();

    h.driver.tick().await.unwrap();

    // skipped, never included, still pending
    assert!(h.mempool.contains(&tx.hash));
    assert!(h.receipts.get(&tx.hash).is_none());
}

#[tokio::test]
async fn engine_outage_degrades_to_empty_blocks() {
    let mut h = harness(1000);
    let key = SecretKey::from_slice(&[0x03; 32]).unwrap();
    let tx = signed_legacy(&key, 0, 1);
    h.mempool.insert(tx.clone(), None).unwrap();

    h.engine.set_failing(true);
    for _ in 0..3 {
        h.driver.tick().await.unwrap();
    }

    // height advances, nothing leaves the pool
    assert_eq!(h.state.snapshot().unsafe_head.number, 3);
    assert!(h.mempool.contains(&tx.hash));

    // derivation progress still applies while the engine is down
    let safe = BlockInfo {
        number: 1,
        ..Default::default()
    };
    h.derivation_tx
        .send(DerivationEvent::SafeAdvanced { safe, l1_block: 1 })
        .await
        .unwrap();
    h.driver.tick().await.unwrap();
    assert_eq!(h.state.snapshot().safe_head.number, 1);

    // recovery: the engine comes back and the pool drains
    h.engine.set_failing(false);
    h.driver.tick().await.unwrap();
    assert!(!h.mempool.contains(&tx.hash));
}

#[tokio::test]
async fn reorg_below_finalized_is_fatal_in_the_loop() {
    let mut h = harness(1000);
    for _ in 0..10 {
        h.driver.tick().await.unwrap();
    }

    let at = |number: u64| BlockInfo {
        number,
        ..Default::default()
    };
    h.derivation_tx
        .send(DerivationEvent::SafeAdvanced {
            safe: at(8),
            l1_block: 8,
        })
        .await
        .unwrap();
    h.derivation_tx
        .send(DerivationEvent::Finalized { finalized: at(5) })
        .await
        .unwrap();
    h.driver.tick().await.unwrap();
    assert_eq!(h.state.snapshot().finalized_head.number, 5);

    // a rewind above finalized is survivable
    h.derivation_tx
        .send(DerivationEvent::Reorged { safe: at(6) })
        .await
        .unwrap();
    h.driver.tick().await.unwrap();
    assert_eq!(h.state.snapshot().safe_head.number, 6);

    // a rewind below finalized is not
    h.derivation_tx
        .send(DerivationEvent::Reorged { safe: at(3) })
        .await
        .unwrap();
    let err = h.driver.tick().await.unwrap_err();
    assert!(matches!(err, FatalError::FinalizedRewind(3)));
}

#[tokio::test]
async fn batch_flush_reaches_l1() {
    let mut h = harness(3);

    // three one-transaction blocks across three ticks
    for i in 1..=3u8 {
        let key = SecretKey::from_slice(&[i; 32]).unwrap();
        let tx = signed_legacy(&key, 0, 1);
        h.mempool.insert(tx, None).unwrap();
        h.driver.tick().await.unwrap();
    }

    let batch = h.batch_rx.try_recv().expect("batch flushed after third tick");
    assert_eq!(batch.blocks.len(), 3);
    assert_eq!(batch.blocks[0].number, 1);

    // hand the batch to the submitter against a mocked L1
    let l1 = Arc::new(MockL1::new());
    let builder = ExecuteTxBuilder::new(
        SecretKey::from_slice(&[0x42; 32]).unwrap(),
        1,
        None,
        U256::from(100u64),
        U256::from(2u64),
        10_000_000,
        Address::repeat_byte(0x0f),
    );
    let (_tx, rx) = mpsc::channel(1);
    let submitter = BatchSubmitter::new(l1.clone(), Some(builder.clone()), rx, 1);

    let submitted = submitter.submit(&builder, batch).await.unwrap();
    assert_eq!(submitted.batch.blocks.len(), 3);
    assert!(submitted.l1_block > 0);
}
