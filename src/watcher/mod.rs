// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain watchers
//!
//! A watcher polls one ledger from a persisted checkpoint forward, applies a
//! confirmation-depth safety margin, and emits normalized [`Deposit`] events.
//! It also accepts outbound [`TransferRequest`]s and broadcasts them on its
//! chain. The poll-loop skeleton is shared; everything chain-specific is
//! behind the [`ChainSource`] trait.

pub mod evm;
pub mod steem;

use crate::checkpoint::CheckpointStore;
use crate::error::{RelayError, RelayResult};
use crate::metrics::RelayMetrics;
use crate::retry_with_max_elapsed_time;
use crate::types::{Deposit, TransferRequest, WatcherEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Chain-specific fetch/parse/broadcast operations backing one watcher.
/// These are the only boundary between the relay core and a ledger.
#[async_trait]
pub trait ChainSource: Send + Sync + 'static {
    /// Chain name this source serves (e.g. "steem", "bsc")
    fn chain(&self) -> &str;

    /// Current head height of the chain
    async fn head_height(&self) -> RelayResult<u64>;

    /// Qualifying deposits in one block. Blocks without qualifying
    /// transfers (including blocks past the head) yield an empty vec.
    async fn deposits_in_block(&self, height: u64) -> RelayResult<Vec<Deposit>>;

    /// Broadcast an outbound transfer and wait for the chain's own
    /// confirmation signal. Returns the transaction id on success.
    async fn broadcast_transfer(&self, request: &TransferRequest) -> RelayResult<String>;
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub chain: String,
    /// Blocks to stay behind the observed head before scanning a block
    pub confirm_blocks: u64,
    pub poll_interval: Duration,
    pub channel_size: usize,
    /// Retry window for the initial head fetch when seeding the checkpoint
    pub max_retry_duration: Duration,
}

impl WatcherConfig {
    pub fn new(chain: impl Into<String>, confirm_blocks: u64, poll_interval: Duration) -> Self {
        Self {
            chain: chain.into(),
            confirm_blocks,
            poll_interval,
            channel_size: default_channel_size(),
            max_retry_duration: default_max_retry_duration(),
        }
    }

    pub fn with_channel_size(mut self, channel_size: usize) -> Self {
        self.channel_size = channel_size;
        self
    }
}

fn default_channel_size() -> usize {
    100
}

fn default_max_retry_duration() -> Duration {
    Duration::from_secs(60)
}

/// One chain watcher: a poll task scanning confirmed blocks and a transfer
/// task broadcasting outbound requests. `start` is a no-op when already
/// running; `stop` is cooperative and waits for the current iteration.
pub struct ChainWatcher {
    config: WatcherConfig,
    source: Arc<dyn ChainSource>,
    checkpoint: CheckpointStore,
    event_tx: mpsc::Sender<WatcherEvent>,
    event_rx: Option<mpsc::Receiver<WatcherEvent>>,
    transfer_tx: mpsc::Sender<TransferRequest>,
    transfer_rx: Arc<Mutex<mpsc::Receiver<TransferRequest>>>,
    metrics: Option<Arc<RelayMetrics>>,
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl ChainWatcher {
    pub fn new(
        config: WatcherConfig,
        source: Arc<dyn ChainSource>,
        checkpoint: CheckpointStore,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_size);
        let (transfer_tx, transfer_rx) = mpsc::channel(config.channel_size);
        Self {
            config,
            source,
            checkpoint,
            event_tx,
            event_rx: Some(event_rx),
            transfer_tx,
            transfer_rx: Arc::new(Mutex::new(transfer_rx)),
            metrics: None,
            cancel: None,
            handles: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn chain(&self) -> &str {
        &self.config.chain
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Sender for outbound transfer requests, used by the bus
    pub fn transfer_handle(&self) -> mpsc::Sender<TransferRequest> {
        self.transfer_tx.clone()
    }

    /// The watcher's event channel, taken once by the bus that owns it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<WatcherEvent>> {
        self.event_rx.take()
    }

    pub async fn start(&mut self) -> RelayResult<()> {
        if self.cancel.is_some() {
            warn!("[{}] watcher already running", self.config.chain);
            return Ok(());
        }

        // Seed the checkpoint to the current head on first start; the
        // watcher never scans from genesis.
        let checkpoint = match self.checkpoint.load()? {
            Some(height) => height,
            None => {
                let head = match retry_with_max_elapsed_time!(
                    self.source.head_height(),
                    self.config.max_retry_duration
                ) {
                    Ok(Ok(head)) => head,
                    _ => {
                        return Err(RelayError::Rpc(format!(
                            "[{}] failed to fetch head height for checkpoint seeding",
                            self.config.chain
                        )))
                    }
                };
                self.checkpoint.save(head)?;
                info!(
                    "[{}] seeded checkpoint at current head {}",
                    self.config.chain, head
                );
                head
            }
        };

        let cancel = CancellationToken::new();

        let source = self.source.clone();
        let config = self.config.clone();
        let checkpoint_store = self.checkpoint.clone();
        let event_tx = self.event_tx.clone();
        let cancel_clone = cancel.clone();
        let metrics = self.metrics.clone();
        let poll_handle = tokio::spawn(async move {
            run_poll_task(
                source,
                config,
                checkpoint_store,
                checkpoint,
                event_tx,
                cancel_clone,
                metrics,
            )
            .await;
        });

        let source = self.source.clone();
        let chain = self.config.chain.clone();
        let event_tx = self.event_tx.clone();
        let transfer_rx = self.transfer_rx.clone();
        let cancel_clone = cancel.clone();
        let transfer_handle = tokio::spawn(async move {
            run_transfer_task(source, chain, event_tx, transfer_rx, cancel_clone).await;
        });

        self.cancel = Some(cancel);
        self.handles = vec![poll_handle, transfer_handle];
        info!(
            "[{}] watcher started from checkpoint {} (confirm_blocks={})",
            self.config.chain, checkpoint, self.config.confirm_blocks
        );
        Ok(())
    }

    /// Request the tasks to exit after their current iteration and wait for
    /// them. No-op when not running.
    pub async fn stop(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("[{}] watcher stopped", self.config.chain);
    }
}

/// Poll loop: fetch the head, scan confirmed blocks one at a time, emit
/// deposits, persist the checkpoint, sleep.
///
/// The checkpoint write happens only after every deposit of the block has
/// been handed to the bus: a crash between emission and the write merely
/// re-emits on restart, which the store's uniqueness guard absorbs, while
/// the reverse order would lose deposits.
async fn run_poll_task(
    source: Arc<dyn ChainSource>,
    config: WatcherConfig,
    checkpoint_store: CheckpointStore,
    mut checkpoint: u64,
    event_tx: mpsc::Sender<WatcherEvent>,
    cancel: CancellationToken,
    metrics: Option<Arc<RelayMetrics>>,
) {
    info!("[{}] starting poll task", config.chain);

    let mut interval = time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{}] poll task cancelled", config.chain);
                break;
            }
            _ = interval.tick() => {}
        }

        let head = match source.head_height().await {
            Ok(head) => head,
            Err(e) => {
                warn!("[{}] failed to fetch head height: {e}", config.chain);
                continue;
            }
        };
        if let Some(ref m) = metrics {
            m.observed_head_block
                .with_label_values(&[&config.chain])
                .set(head as i64);
        }

        while checkpoint < head.saturating_sub(config.confirm_blocks) {
            if cancel.is_cancelled() {
                break;
            }
            let next = checkpoint + 1;

            let deposits = match source.deposits_in_block(next).await {
                Ok(deposits) => deposits,
                Err(e) => {
                    warn!("[{}] failed to scan block {next}: {e}", config.chain);
                    break;
                }
            };

            for deposit in deposits {
                debug!(
                    "[{}] deposit {} from {} in block {next}",
                    config.chain, deposit.txid, deposit.from_account
                );
                if let Some(ref m) = metrics {
                    m.deposits_observed
                        .with_label_values(&[&config.chain])
                        .inc();
                }
                if event_tx.send(WatcherEvent::Deposit(deposit)).await.is_err() {
                    error!(
                        "[{}] event channel closed, stopping poll task",
                        config.chain
                    );
                    return;
                }
            }

            if let Err(e) = checkpoint_store.save(next) {
                // Do not advance in memory either: the block is re-scanned
                // next iteration and duplicates are absorbed downstream.
                error!("[{}] failed to persist checkpoint {next}: {e}", config.chain);
                break;
            }
            checkpoint = next;
            if let Some(ref m) = metrics {
                m.last_processed_block
                    .with_label_values(&[&config.chain])
                    .set(next as i64);
            }
        }
    }
}

/// Transfer loop: broadcast outbound requests issued by the bus, one at a
/// time, without blocking the poll task. Failures are reported back as
/// settlement events; retry policy belongs to the caller.
async fn run_transfer_task(
    source: Arc<dyn ChainSource>,
    chain: String,
    event_tx: mpsc::Sender<WatcherEvent>,
    transfer_rx: Arc<Mutex<mpsc::Receiver<TransferRequest>>>,
    cancel: CancellationToken,
) {
    info!("[{chain}] starting transfer task");
    let mut transfer_rx = transfer_rx.lock().await;

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{chain}] transfer task cancelled");
                break;
            }
            request = transfer_rx.recv() => {
                let Some(request) = request else {
                    info!("[{chain}] transfer channel closed");
                    break;
                };
                request
            }
        };

        info!(
            "[{chain}] broadcasting transfer of {} to {} (transaction {})",
            request.amount, request.to_address, request.transaction_id
        );
        let result = match source.broadcast_transfer(&request).await {
            Ok(txid) => {
                info!("[{chain}] transfer confirmed: {txid}");
                Ok(txid)
            }
            Err(e) => {
                error!(
                    "[{chain}] transfer for transaction {} failed: {e}",
                    request.transaction_id
                );
                Err(e.to_string())
            }
        };
        let settled = WatcherEvent::TransferSettled {
            transaction_id: request.transaction_id,
            result,
        };
        if event_tx.send(settled).await.is_err() {
            error!("[{chain}] event channel closed, stopping transfer task");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{printable_deposit, MockChainSource};
    use crate::types::DepositAmount;
    use tokio::time::timeout;

    fn test_config(chain: &str) -> WatcherConfig {
        WatcherConfig::new(chain, 2, Duration::from_millis(10))
    }

    async fn recv_deposit(rx: &mut mpsc::Receiver<WatcherEvent>) -> Deposit {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(WatcherEvent::Deposit(deposit))) => deposit,
            other => panic!("expected a deposit event, got {other:?}"),
        }
    }

    async fn wait_for_checkpoint(store: &CheckpointStore, expected: u64) {
        for _ in 0..500 {
            if store.load().unwrap() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "checkpoint never reached {expected}, still at {:?}",
            store.load().unwrap()
        );
    }

    #[tokio::test]
    async fn test_checkpoint_seeded_to_head_on_first_start() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("steem", dir.path().join("cp"));
        let source = MockChainSource::new("steem");
        source.set_head(500);

        let mut watcher = ChainWatcher::new(test_config("steem"), source, checkpoint.clone());
        watcher.start().await.unwrap();

        // Seeded immediately and persisted; nothing before the head is scanned.
        assert_eq!(checkpoint.load().unwrap(), Some(500));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_processes_exactly_the_confirmed_range() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("steem", dir.path().join("cp"));
        checkpoint.save(5).unwrap();

        let source = MockChainSource::new("steem");
        source.set_head(10);
        for block in 1..=10u64 {
            source.add_deposit(printable_deposit(
                "steem",
                &format!("tx-{block}"),
                block,
                "alice",
            ));
        }

        let mut watcher =
            ChainWatcher::new(test_config("steem"), source.clone(), checkpoint.clone());
        let mut events = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        // head=10, confirm_blocks=2, checkpoint=5 => exactly blocks 6..=8
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(recv_deposit(&mut events).await.txid);
        }
        assert_eq!(seen, vec!["tx-6", "tx-7", "tx-8"]);

        wait_for_checkpoint(&checkpoint, 8).await;

        // No further blocks are scanned while the head stays put
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(checkpoint.load().unwrap(), Some(8));

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_checkpoint_advances_monotonically_with_head() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("steem", dir.path().join("cp"));
        checkpoint.save(5).unwrap();

        let source = MockChainSource::new("steem");
        source.set_head(10);

        let mut watcher =
            ChainWatcher::new(test_config("steem"), source.clone(), checkpoint.clone());
        watcher.start().await.unwrap();

        wait_for_checkpoint(&checkpoint, 8).await;
        source.set_head(12);
        wait_for_checkpoint(&checkpoint, 10).await;

        watcher.stop().await;
        assert_eq!(checkpoint.load().unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_persisted_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("steem", dir.path().join("cp"));
        checkpoint.save(5).unwrap();

        let source = MockChainSource::new("steem");
        source.set_head(10);
        source.add_deposit(printable_deposit("steem", "tx-7", 7, "alice"));

        let mut watcher =
            ChainWatcher::new(test_config("steem"), source.clone(), checkpoint.clone());
        let mut events = watcher.take_events().unwrap();
        watcher.start().await.unwrap();
        assert_eq!(recv_deposit(&mut events).await.txid, "tx-7");
        wait_for_checkpoint(&checkpoint, 8).await;
        watcher.stop().await;

        // A fresh instance over the same checkpoint file must not re-emit
        let mut watcher2 =
            ChainWatcher::new(test_config("steem"), source.clone(), checkpoint.clone());
        let mut events2 = watcher2.take_events().unwrap();
        watcher2.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events2.try_recv().is_err());
        watcher2.stop().await;
    }

    #[tokio::test]
    async fn test_transient_head_errors_do_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("steem", dir.path().join("cp"));
        checkpoint.save(5).unwrap();

        let source = MockChainSource::new("steem");
        source.set_head(10);
        source.set_fail_head(true);

        let mut watcher =
            ChainWatcher::new(test_config("steem"), source.clone(), checkpoint.clone());
        watcher.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(checkpoint.load().unwrap(), Some(5));

        source.set_fail_head(false);
        wait_for_checkpoint(&checkpoint, 8).await;
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_a_noop_when_running() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("steem", dir.path().join("cp"));
        checkpoint.save(5).unwrap();

        let source = MockChainSource::new("steem");
        source.set_head(10);

        let mut watcher = ChainWatcher::new(test_config("steem"), source, checkpoint);
        watcher.start().await.unwrap();
        assert!(watcher.is_running());
        watcher.start().await.unwrap();
        assert!(watcher.is_running());
        watcher.stop().await;
        assert!(!watcher.is_running());
        // Stopping twice is safe
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_transfer_request_settles_ok() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("bsc", dir.path().join("cp"));
        checkpoint.save(100).unwrap();

        let source = MockChainSource::new("bsc");
        source.set_head(100);

        let mut watcher = ChainWatcher::new(test_config("bsc"), source.clone(), checkpoint);
        let mut events = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        let request = TransferRequest {
            transaction_id: 7,
            to_address: "0x1111111111111111111111111111111111111111".to_string(),
            amount: crate::types::Asset::new(10_000, "STEEM"),
            reference: "alice".to_string(),
        };
        watcher.transfer_handle().send(request.clone()).await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WatcherEvent::TransferSettled {
                transaction_id,
                result,
            } => {
                assert_eq!(transaction_id, 7);
                assert!(result.is_ok());
            }
            other => panic!("expected settlement, got {other:?}"),
        }
        assert_eq!(source.broadcasts(), vec![request]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_transfer_failure_settles_err_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("bsc", dir.path().join("cp"));
        checkpoint.save(100).unwrap();

        let source = MockChainSource::new("bsc");
        source.set_head(100);
        source.set_fail_broadcast(true);

        let mut watcher = ChainWatcher::new(test_config("bsc"), source.clone(), checkpoint);
        let mut events = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        watcher
            .transfer_handle()
            .send(TransferRequest {
                transaction_id: 9,
                to_address: "alice".to_string(),
                amount: crate::types::Asset::new(1_000, "TSTEEM"),
                reference: "0x11".to_string(),
            })
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WatcherEvent::TransferSettled {
                transaction_id,
                result,
            } => {
                assert_eq!(transaction_id, 9);
                assert!(result.is_err());
            }
            other => panic!("expected settlement, got {other:?}"),
        }
        // The watcher itself never retries
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(source.broadcasts().is_empty());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_deposit_emitted_before_checkpoint_write() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = CheckpointStore::new("steem", dir.path().join("cp"));
        checkpoint.save(5).unwrap();

        let source = MockChainSource::new("steem");
        source.set_head(8); // exactly one confirmed block: 6
        source.add_deposit(Deposit {
            amount: DepositAmount::Printable("1.000 STEEM".to_string()),
            ..printable_deposit("steem", "tx-6", 6, "alice")
        });

        // A full event channel blocks the sender; the checkpoint must not
        // advance past a block whose deposits were not accepted downstream.
        let config = test_config("steem").with_channel_size(1);
        let mut watcher = ChainWatcher::new(config, source.clone(), checkpoint.clone());
        let mut events = watcher.take_events().unwrap();
        watcher.start().await.unwrap();

        let deposit = recv_deposit(&mut events).await;
        assert_eq!(deposit.txid, "tx-6");
        wait_for_checkpoint(&checkpoint, 6).await;
        watcher.stop().await;
    }
}
