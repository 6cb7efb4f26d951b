// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::schema::{transaction_status, transactions};
use super::{StoreError, TransactionRecord, TransactionStatus};
use diesel::prelude::*;

#[derive(Debug, Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransactionRow<'a> {
    pub from_account: &'a str,
    pub amount: i64,
    pub symbol: &'a str,
    pub source_chain: &'a str,
    pub target_chain: &'a str,
    pub to_address: &'a str,
    pub txid: &'a str,
    pub block_num: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = transaction_status)]
pub struct NewStatusRow<'a> {
    pub transaction_id: i64,
    pub status: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = transactions)]
pub struct StoredTransaction {
    pub id: i64,
    pub from_account: String,
    pub amount: i64,
    pub symbol: String,
    pub source_chain: String,
    pub target_chain: String,
    pub to_address: String,
    pub txid: String,
    pub block_num: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = transaction_status)]
pub struct StoredStatus {
    pub id: i64,
    pub transaction_id: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub last_retry_time_ms: Option<i64>,
}

pub fn into_record(
    transaction: StoredTransaction,
    status: StoredStatus,
) -> Result<TransactionRecord, StoreError> {
    Ok(TransactionRecord {
        id: transaction.id,
        from_account: transaction.from_account,
        amount_units: transaction.amount,
        symbol: transaction.symbol,
        source_chain: transaction.source_chain,
        target_chain: transaction.target_chain,
        to_address: transaction.to_address,
        txid: transaction.txid,
        block_num: transaction.block_num,
        timestamp_ms: transaction.timestamp_ms,
        status: TransactionStatus::parse(&status.status)?,
        error_message: status.error_message,
        retry_count: status.retry_count,
        last_retry_time_ms: status.last_retry_time_ms,
    })
}
