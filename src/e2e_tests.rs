// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests: mock chain sources on both sides, the
//! in-memory store, and the real watchers and bus in between.

use crate::bus::RelayBus;
use crate::checkpoint::CheckpointStore;
use crate::store::{TransactionStatus, TransactionStore};
use crate::test_utils::{printable_deposit, fixed_point_deposit, MemoryTransactionStore, MockChainSource};
use crate::types::Asset;
use crate::watcher::{ChainWatcher, WatcherConfig};
use std::sync::Arc;
use std::time::Duration;

fn watcher(
    chain: &str,
    source: Arc<MockChainSource>,
    checkpoint: CheckpointStore,
) -> ChainWatcher {
    ChainWatcher::new(
        WatcherConfig::new(chain, 2, Duration::from_millis(10)),
        source,
        checkpoint,
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_steem_deposit_relays_to_evm() {
    let dir = tempfile::tempdir().unwrap();

    let steem = MockChainSource::new("steem");
    steem.set_head(10);
    steem.add_deposit(printable_deposit("steem", "tx-1", 6, "alice"));
    let steem_checkpoint = CheckpointStore::new("steem", dir.path().join("steem.cp"));
    steem_checkpoint.save(5).unwrap();

    let evm = MockChainSource::new("bsc");
    evm.set_head(100);

    let store = MemoryTransactionStore::new();
    let mut bus = RelayBus::new(
        store.clone(),
        vec![
            watcher("steem", steem.clone(), steem_checkpoint),
            watcher("bsc", evm.clone(), CheckpointStore::new("bsc", dir.path().join("bsc.cp"))),
        ],
    );
    bus.start().await.unwrap();

    // Exactly one outbound transfer on the EVM side
    wait_until(|| !evm.broadcasts().is_empty()).await;
    let broadcasts = evm.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(
        broadcasts[0].to_address,
        "0x1111111111111111111111111111111111111111"
    );
    assert_eq!(broadcasts[0].amount, Asset::new(10_000, "STEEM"));
    assert_eq!(broadcasts[0].reference, "alice");

    // One record, settled once the broadcast confirmed
    wait_until(|| {
        store
            .records()
            .first()
            .is_some_and(|r| r.status == TransactionStatus::Completed)
    })
    .await;
    let record = store.get_by_txid("tx-1").await.unwrap().unwrap();
    assert_eq!(record.from_account, "alice");
    assert_eq!(record.amount_units, 10_000);
    assert_eq!(record.symbol, "STEEM");
    assert_eq!(record.source_chain, "steem");
    assert_eq!(record.target_chain, "bsc");
    assert_eq!(store.records().len(), 1);

    bus.stop().await;
    // Nothing re-dispatched after shutdown
    assert_eq!(evm.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_evm_deposit_relays_to_steem() {
    let dir = tempfile::tempdir().unwrap();

    let steem = MockChainSource::new("steem");
    steem.set_head(10);

    let evm = MockChainSource::new("bsc");
    evm.set_head(100);
    evm.add_deposit(fixed_point_deposit("bsc", "0xdead", 98, "0x11", "steem", "alice"));
    let evm_checkpoint = CheckpointStore::new("bsc", dir.path().join("bsc.cp"));
    evm_checkpoint.save(97).unwrap();

    let store = MemoryTransactionStore::new();
    let mut bus = RelayBus::new(
        store.clone(),
        vec![
            watcher("steem", steem.clone(), CheckpointStore::new("steem", dir.path().join("steem.cp"))),
            watcher("bsc", evm.clone(), evm_checkpoint),
        ],
    );
    bus.start().await.unwrap();

    wait_until(|| !steem.broadcasts().is_empty()).await;
    let broadcasts = steem.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].to_address, "alice");
    assert_eq!(broadcasts[0].amount, Asset::new(10_000, "TSTEEM"));
    assert_eq!(broadcasts[0].reference, "0x11");

    wait_until(|| {
        store
            .records()
            .first()
            .is_some_and(|r| r.status == TransactionStatus::Completed)
    })
    .await;
    bus.stop().await;
}

#[tokio::test]
async fn test_reprocessed_block_does_not_double_dispatch() {
    // Crash-before-checkpoint-write: the first run emits the deposit and
    // settles it; the checkpoint is then rewound as if the process died
    // before persisting it. The re-run re-emits the deposit, the store
    // rejects the duplicate, and no second outbound transfer happens.
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_path = dir.path().join("steem.cp");

    let steem = MockChainSource::new("steem");
    steem.set_head(10);
    steem.add_deposit(printable_deposit("steem", "tx-1", 6, "alice"));
    let evm = MockChainSource::new("bsc");
    evm.set_head(100);
    let store = MemoryTransactionStore::new();

    let steem_checkpoint = CheckpointStore::new("steem", &checkpoint_path);
    steem_checkpoint.save(5).unwrap();
    let mut bus = RelayBus::new(
        store.clone(),
        vec![
            watcher("steem", steem.clone(), steem_checkpoint.clone()),
            watcher("bsc", evm.clone(), CheckpointStore::new("bsc", dir.path().join("bsc.cp"))),
        ],
    );
    bus.start().await.unwrap();
    wait_until(|| !evm.broadcasts().is_empty()).await;
    bus.stop().await;

    // Simulate the crash: rewind the checkpoint below the processed block
    steem_checkpoint.save(5).unwrap();

    let mut bus2 = RelayBus::new(
        store.clone(),
        vec![
            watcher("steem", steem.clone(), steem_checkpoint.clone()),
            watcher("bsc", evm.clone(), CheckpointStore::new("bsc", dir.path().join("bsc.cp"))),
        ],
    );
    bus2.start().await.unwrap();
    // Let the re-run scan past block 6 again
    wait_until(|| steem_checkpoint.load().unwrap() == Some(8)).await;
    bus2.stop().await;

    // Still exactly one record and one outbound transfer
    assert_eq!(store.records().len(), 1);
    assert_eq!(evm.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_failed_outbound_transfer_is_marked_failed() {
    let dir = tempfile::tempdir().unwrap();

    let steem = MockChainSource::new("steem");
    steem.set_head(10);
    steem.add_deposit(printable_deposit("steem", "tx-1", 6, "alice"));
    let steem_checkpoint = CheckpointStore::new("steem", dir.path().join("steem.cp"));
    steem_checkpoint.save(5).unwrap();

    let evm = MockChainSource::new("bsc");
    evm.set_head(100);
    evm.set_fail_broadcast(true);

    let store = MemoryTransactionStore::new();
    let mut bus = RelayBus::new(
        store.clone(),
        vec![
            watcher("steem", steem.clone(), steem_checkpoint),
            watcher("bsc", evm.clone(), CheckpointStore::new("bsc", dir.path().join("bsc.cp"))),
        ],
    );
    bus.start().await.unwrap();

    wait_until(|| {
        store
            .records()
            .first()
            .is_some_and(|r| r.status == TransactionStatus::Failed)
    })
    .await;
    let record = store.get_by_txid("tx-1").await.unwrap().unwrap();
    assert_eq!(record.retry_count, 1);
    assert!(record.error_message.is_some());
    assert!(evm.broadcasts().is_empty());

    bus.stop().await;
}

#[tokio::test]
async fn test_start_fails_cleanly_when_store_is_down() {
    let dir = tempfile::tempdir().unwrap();

    let steem = MockChainSource::new("steem");
    steem.set_head(10);
    let store = MemoryTransactionStore::new();
    store.set_healthy(false);

    let mut bus = RelayBus::new(
        store.clone(),
        vec![watcher(
            "steem",
            steem,
            CheckpointStore::new("steem", dir.path().join("steem.cp")),
        )],
    );
    assert!(bus.start().await.is_err());
    assert!(!bus.is_running());
    // stop after a failed start is safe
    bus.stop().await;
}
