// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared test doubles: a scriptable chain source and an in-memory
//! transaction store.

use crate::error::{RelayError, RelayResult};
use crate::store::{
    NewTransaction, StoreError, TransactionRecord, TransactionStatus, TransactionStore,
};
use crate::types::{Deposit, DepositAmount, RouteTarget, TransferRequest};
use crate::watcher::ChainSource;
use async_trait::async_trait;
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Scriptable [`ChainSource`]: a settable head, per-block deposits, and a
/// record of successful broadcasts.
pub struct MockChainSource {
    chain: String,
    head: AtomicU64,
    fail_head: AtomicBool,
    fail_broadcast: AtomicBool,
    deposits: Mutex<HashMap<u64, Vec<Deposit>>>,
    broadcasts: Mutex<Vec<TransferRequest>>,
}

impl MockChainSource {
    pub fn new(chain: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            chain: chain.into(),
            head: AtomicU64::new(0),
            fail_head: AtomicBool::new(false),
            fail_broadcast: AtomicBool::new(false),
            deposits: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_fail_head(&self, fail: bool) {
        self.fail_head.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_broadcast(&self, fail: bool) {
        self.fail_broadcast.store(fail, Ordering::SeqCst);
    }

    pub fn add_deposit(&self, deposit: Deposit) {
        self.deposits
            .lock()
            .unwrap()
            .entry(deposit.block_num)
            .or_default()
            .push(deposit);
    }

    /// Successfully broadcast transfer requests, in order
    pub fn broadcasts(&self) -> Vec<TransferRequest> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainSource for MockChainSource {
    fn chain(&self) -> &str {
        &self.chain
    }

    async fn head_height(&self) -> RelayResult<u64> {
        if self.fail_head.load(Ordering::SeqCst) {
            return Err(RelayError::Rpc("mock head failure".to_string()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn deposits_in_block(&self, height: u64) -> RelayResult<Vec<Deposit>> {
        Ok(self
            .deposits
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_default())
    }

    async fn broadcast_transfer(&self, request: &TransferRequest) -> RelayResult<String> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(RelayError::Broadcast("mock broadcast failure".to_string()));
        }
        let mut broadcasts = self.broadcasts.lock().unwrap();
        broadcasts.push(request.clone());
        Ok(format!("{}-txid-{}", self.chain, broadcasts.len()))
    }
}

/// In-memory [`TransactionStore`] with the same duplicate and status
/// semantics as the Postgres implementation.
pub struct MemoryTransactionStore {
    records: Mutex<Vec<TransactionRecord>>,
    healthy: AtomicBool,
}

impl MemoryTransactionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
        })
    }

    /// When unhealthy, health checks fail and inserts report the store
    /// unavailable.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<TransactionRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<i64, StoreError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("mock store unavailable".to_string()));
        }
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|r| r.txid == transaction.txid) {
            return Err(StoreError::Duplicate);
        }
        let id = records.len() as i64 + 1;
        records.push(TransactionRecord {
            id,
            from_account: transaction.from_account.clone(),
            amount_units: transaction.amount_units,
            symbol: transaction.symbol.clone(),
            source_chain: transaction.source_chain.clone(),
            target_chain: transaction.target_chain.clone(),
            to_address: transaction.to_address.clone(),
            txid: transaction.txid.clone(),
            block_num: transaction.block_num,
            timestamp_ms: transaction.timestamp_ms,
            status: TransactionStatus::Pending,
            error_message: None,
            retry_count: 0,
            last_retry_time_ms: None,
        });
        Ok(id)
    }

    async fn update_status(
        &self,
        id: i64,
        status: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::Database(format!("no status row for transaction {id}")))?;
        record.status = status;
        record.error_message = error_message.map(|s| s.to_string());
        if status == TransactionStatus::Failed {
            record.retry_count += 1;
            record.last_retry_time_ms = Some(chrono::Utc::now().timestamp_millis());
        }
        Ok(())
    }

    async fn get_by_txid(&self, txid: &str) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.txid == txid)
            .cloned())
    }

    async fn get_pending(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut pending: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == TransactionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.timestamp_ms);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// A Steem-style deposit of `"10.000 STEEM"` routed to the canonical test
/// EVM address
pub fn printable_deposit(source_chain: &str, txid: &str, block_num: u64, from: &str) -> Deposit {
    Deposit {
        source_chain: source_chain.to_string(),
        from_account: from.to_string(),
        amount: DepositAmount::Printable("10.000 STEEM".to_string()),
        route: RouteTarget {
            chain: "bsc".to_string(),
            address: "0x1111111111111111111111111111111111111111".to_string(),
        },
        txid: txid.to_string(),
        block_num,
        observed_at_ms: 1_700_000_000_000 + block_num as i64,
    }
}

/// An EVM-style deposit of 10 tokens (18 decimals)
pub fn fixed_point_deposit(
    source_chain: &str,
    txid: &str,
    block_num: u64,
    from: &str,
    target_chain: &str,
    target_address: &str,
) -> Deposit {
    Deposit {
        source_chain: source_chain.to_string(),
        from_account: from.to_string(),
        amount: DepositAmount::FixedPoint {
            value: U256::from(10u64) * U256::exp10(18),
            decimals: 18,
            symbol: "TSTEEM".to_string(),
        },
        route: RouteTarget {
            chain: target_chain.to_string(),
            address: target_address.to_string(),
        },
        txid: txid.to_string(),
        block_num,
        observed_at_ms: 1_700_000_000_000 + block_num as i64,
    }
}
