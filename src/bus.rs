// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Relay bus
//!
//! Single point wiring Deposit production to persistence and Transfer
//! dispatch. The bus owns both watchers and the store handle; watcher event
//! channels are merged into one stream consumed by a dispatcher task.

use crate::error::{RelayError, RelayResult};
use crate::metrics::RelayMetrics;
use crate::store::{NewTransaction, StoreError, TransactionStatus, TransactionStore};
use crate::types::{Deposit, TransferRequest, WatcherEvent};
use crate::watcher::ChainWatcher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MERGED_CHANNEL_SIZE: usize = 256;

const BACKLOG_REPORT_INTERVAL: Duration = Duration::from_secs(60);

const BACKLOG_QUERY_LIMIT: i64 = 100;

pub struct RelayBus {
    store: Arc<dyn TransactionStore>,
    watchers: Vec<ChainWatcher>,
    metrics: Option<Arc<RelayMetrics>>,
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl RelayBus {
    pub fn new(store: Arc<dyn TransactionStore>, watchers: Vec<ChainWatcher>) -> Self {
        Self {
            store,
            watchers,
            metrics: None,
            cancel: None,
            handles: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Verify store health, wire the watcher channels to the dispatcher,
    /// and start both watchers. Any failure rolls back whatever already
    /// started; a partially started bus is never left running.
    pub async fn start(&mut self) -> RelayResult<()> {
        if self.cancel.is_some() {
            warn!("relay bus already running");
            return Ok(());
        }
        info!("starting relay bus");

        if !self.store.health_check().await {
            return Err(RelayError::Other("store health check failed".to_string()));
        }

        let mut routes = HashMap::new();
        let mut event_receivers = Vec::new();
        for watcher in &mut self.watchers {
            routes.insert(watcher.chain().to_string(), watcher.transfer_handle());
            let receiver = watcher.take_events().ok_or_else(|| {
                RelayError::Other(format!(
                    "event channel for {} already consumed",
                    watcher.chain()
                ))
            })?;
            event_receivers.push((watcher.chain().to_string(), receiver));
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        // Merge the per-watcher event channels into one stream
        let (merged_tx, merged_rx) = mpsc::channel(MERGED_CHANNEL_SIZE);
        for (chain, mut receiver) in event_receivers {
            let merged_tx = merged_tx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = receiver.recv() => {
                            let Some(event) = event else { break };
                            if merged_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!("[{chain}] event forwarding task exited");
            }));
        }
        drop(merged_tx);

        handles.push(tokio::spawn(run_dispatcher(
            self.store.clone(),
            merged_rx,
            routes,
            self.metrics.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(run_backlog_reporter(
            self.store.clone(),
            self.metrics.clone(),
            cancel.clone(),
        )));

        for index in 0..self.watchers.len() {
            if let Err(e) = self.watchers[index].start().await {
                error!(
                    "failed to start {} watcher: {e}",
                    self.watchers[index].chain()
                );
                for started in self.watchers.iter_mut().take(index) {
                    started.stop().await;
                }
                cancel.cancel();
                for handle in handles {
                    let _ = handle.await;
                }
                return Err(e);
            }
        }

        self.cancel = Some(cancel);
        self.handles = handles;
        info!("relay bus started");
        Ok(())
    }

    /// Stop both watchers and the dispatcher. Safe to call even if
    /// `start` partially failed, and idempotent.
    pub async fn stop(&mut self) {
        for watcher in &mut self.watchers {
            watcher.stop().await;
        }
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("relay bus stopped");
    }
}

/// Consume merged watcher events until cancelled
pub(crate) async fn run_dispatcher(
    store: Arc<dyn TransactionStore>,
    mut events: mpsc::Receiver<WatcherEvent>,
    routes: HashMap<String, mpsc::Sender<TransferRequest>>,
    metrics: Option<Arc<RelayMetrics>>,
    cancel: CancellationToken,
) {
    info!("dispatcher started ({} routes)", routes.len());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("dispatcher cancelled");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    info!("all watcher channels closed, dispatcher exiting");
                    break;
                };
                match event {
                    WatcherEvent::Deposit(deposit) => {
                        handle_deposit(&*store, &routes, metrics.as_ref(), deposit).await;
                    }
                    WatcherEvent::TransferSettled { transaction_id, result } => {
                        handle_settlement(&*store, metrics.as_ref(), transaction_id, result).await;
                    }
                }
            }
        }
    }
}

/// Persist one deposit and dispatch the matching outbound transfer.
///
/// Duplicate inserts are an expected no-op (re-delivery after a watcher
/// restart). Any other store failure drops the deposit from automatic
/// processing: a blind re-insert whose failure mode is unknown risks a
/// duplicate outbound transfer, so recovery is left to an operator via
/// `get_pending`.
pub(crate) async fn handle_deposit(
    store: &dyn TransactionStore,
    routes: &HashMap<String, mpsc::Sender<TransferRequest>>,
    metrics: Option<&Arc<RelayMetrics>>,
    deposit: Deposit,
) {
    let asset = match deposit.amount.normalize() {
        Ok(asset) => asset,
        Err(e) => {
            error!(
                "[{}] dropping deposit {} with unparseable amount: {e}",
                deposit.source_chain, deposit.txid
            );
            return;
        }
    };
    debug!(
        "[{}] deposit {} from {}: {} -> {}:{}",
        deposit.source_chain,
        deposit.txid,
        deposit.from_account,
        asset,
        deposit.route.chain,
        deposit.route.address
    );

    let record = NewTransaction {
        from_account: deposit.from_account.clone(),
        amount_units: asset.units,
        symbol: asset.symbol.clone(),
        source_chain: deposit.source_chain.clone(),
        target_chain: deposit.route.chain.clone(),
        to_address: deposit.route.address.clone(),
        txid: deposit.txid.clone(),
        block_num: deposit.block_num as i64,
        timestamp_ms: deposit.observed_at_ms,
    };

    match store.insert_transaction(&record).await {
        Ok(id) => {
            info!(
                "[{}] recorded deposit {} as transaction {id}",
                deposit.source_chain, deposit.txid
            );
            if let Some(m) = metrics {
                m.deposits_recorded
                    .with_label_values(&[&deposit.source_chain])
                    .inc();
            }

            let Some(transfer_tx) = routes.get(&deposit.route.chain) else {
                warn!(
                    "[{}] unknown target chain {:?} for transaction {id}, not dispatching",
                    deposit.source_chain, deposit.route.chain
                );
                return;
            };
            let request = TransferRequest {
                transaction_id: id,
                to_address: deposit.route.address.clone(),
                amount: asset,
                reference: deposit.from_account.clone(),
            };
            if transfer_tx.send(request).await.is_err() {
                error!(
                    "[{}] transfer channel for {:?} closed, transaction {id} stays pending",
                    deposit.source_chain, deposit.route.chain
                );
                return;
            }
            if let Some(m) = metrics {
                m.transfers_dispatched
                    .with_label_values(&[&deposit.route.chain])
                    .inc();
            }
        }
        Err(StoreError::Duplicate) => {
            warn!(
                "[{}] deposit {} already recorded, skipping",
                deposit.source_chain, deposit.txid
            );
            if let Some(m) = metrics {
                m.duplicate_deposits
                    .with_label_values(&[&deposit.source_chain])
                    .inc();
            }
        }
        Err(e) => {
            error!(
                "[{}] failed to record deposit {}: {e}",
                deposit.source_chain, deposit.txid
            );
            if let Some(m) = metrics {
                m.store_errors.inc();
            }
        }
    }
}

/// Settle the outbound leg: move the status to completed or failed
pub(crate) async fn handle_settlement(
    store: &dyn TransactionStore,
    metrics: Option<&Arc<RelayMetrics>>,
    transaction_id: i64,
    result: Result<String, String>,
) {
    match result {
        Ok(txid) => {
            match store
                .update_status(transaction_id, TransactionStatus::Completed, None)
                .await
            {
                Ok(()) => {
                    info!("transaction {transaction_id} completed ({txid})");
                    if let Some(m) = metrics {
                        m.transfers_completed.inc();
                    }
                }
                Err(e) => {
                    error!("failed to mark transaction {transaction_id} completed: {e}");
                }
            }
        }
        Err(reason) => {
            match store
                .update_status(transaction_id, TransactionStatus::Failed, Some(&reason))
                .await
            {
                Ok(()) => {
                    warn!("transaction {transaction_id} failed: {reason}");
                    if let Some(m) = metrics {
                        m.transfers_failed.inc();
                    }
                }
                Err(e) => {
                    error!("failed to mark transaction {transaction_id} failed: {e}");
                }
            }
        }
    }
}

/// Periodically surface the unsettled backlog. Automatic re-dispatch is
/// deliberately out of scope; this keeps the backlog visible to operators
/// and dashboards.
async fn run_backlog_reporter(
    store: Arc<dyn TransactionStore>,
    metrics: Option<Arc<RelayMetrics>>,
    cancel: CancellationToken,
) {
    let mut interval = time::interval(BACKLOG_REPORT_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match store.get_pending(BACKLOG_QUERY_LIMIT).await {
                    Ok(pending) => {
                        if let Some(ref m) = metrics {
                            m.pending_transactions.set(pending.len() as i64);
                        }
                        if !pending.is_empty() {
                            warn!(
                                "{} transactions awaiting settlement (oldest txid {})",
                                pending.len(),
                                pending[0].txid
                            );
                        }
                    }
                    Err(e) => warn!("failed to query pending backlog: {e}"),
                }
            }
        }
    }
}
