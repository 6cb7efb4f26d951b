// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction store
//!
//! Durable, append-mostly record of observed deposits and their settlement
//! status. The `txid` unique constraint is the sole exactly-once guard
//! against re-delivery from watcher restarts or overlapping polls. These
//! operations are the only persisted state transitions in the system.

pub mod db;
pub mod models;
pub mod pg;
pub mod schema;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A record with the same txid already exists. Expected on
    /// re-delivery; not an error condition for the caller.
    #[error("duplicate transaction record")]
    Duplicate,

    #[error("database error: {0}")]
    Database(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(StoreError::Database(format!(
                "unknown transaction status {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Projection of a Deposit to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub from_account: String,
    /// Normalized amount in milli-units
    pub amount_units: i64,
    pub symbol: String,
    pub source_chain: String,
    pub target_chain: String,
    pub to_address: String,
    pub txid: String,
    pub block_num: i64,
    pub timestamp_ms: i64,
}

/// Stored record joined with its settlement status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: i64,
    pub from_account: String,
    pub amount_units: i64,
    pub symbol: String,
    pub source_chain: String,
    pub target_chain: String,
    pub to_address: String,
    pub txid: String,
    pub block_num: i64,
    pub timestamp_ms: i64,
    pub status: TransactionStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub last_retry_time_ms: Option<i64>,
}

#[async_trait]
pub trait TransactionStore: Send + Sync + 'static {
    /// Atomically create the record and its initial `pending` status row.
    /// Returns the store-assigned id, or [`StoreError::Duplicate`] when a
    /// record with the same txid already exists.
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<i64, StoreError>;

    /// Transition the settlement status. A transition to `failed`
    /// increments the retry counter and stamps the retry time.
    async fn update_status(
        &self,
        id: i64,
        status: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Point lookup by txid, joined with status
    async fn get_by_txid(&self, txid: &str) -> Result<Option<TransactionRecord>, StoreError>;

    /// Records still pending settlement, oldest observation first
    async fn get_pending(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn health_check(&self) -> bool;
}
