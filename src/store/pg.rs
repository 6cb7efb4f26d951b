// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres-backed transaction store
//!
//! The record and its initial status row are created in one database
//! transaction; duplicate suppression relies solely on the `txid` unique
//! constraint, surfaced as [`StoreError::Duplicate`].

use super::db::Db;
use super::models::{into_record, NewStatusRow, NewTransactionRow, StoredStatus, StoredTransaction};
use super::schema::{transaction_status, transactions};
use super::{NewTransaction, StoreError, TransactionRecord, TransactionStatus, TransactionStore};
use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};

pub struct PgTransactionStore {
    db: Db,
}

impl PgTransactionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<i64, StoreError> {
        let mut conn = self
            .db
            .connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = NewTransactionRow {
            from_account: &transaction.from_account,
            amount: transaction.amount_units,
            symbol: &transaction.symbol,
            source_chain: &transaction.source_chain,
            target_chain: &transaction.target_chain,
            to_address: &transaction.to_address,
            txid: &transaction.txid,
            block_num: transaction.block_num,
            timestamp_ms: transaction.timestamp_ms,
        };

        let result = (*conn)
            .transaction::<i64, DieselError, _>(|conn| {
                async move {
                    let id = diesel::insert_into(transactions::table)
                        .values(&row)
                        .returning(transactions::id)
                        .get_result::<i64>(conn)
                        .await?;
                    diesel::insert_into(transaction_status::table)
                        .values(&NewStatusRow {
                            transaction_id: id,
                            status: TransactionStatus::Pending.as_str(),
                        })
                        .execute(conn)
                        .await?;
                    Ok(id)
                }
                .scope_boxed()
            })
            .await;

        match result {
            Ok(id) => Ok(id),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Err(StoreError::Duplicate)
            }
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    async fn update_status(
        &self,
        id: i64,
        status: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self
            .db
            .connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let target =
            transaction_status::table.filter(transaction_status::transaction_id.eq(id));
        let affected = match status {
            TransactionStatus::Failed => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                diesel::update(target)
                    .set((
                        transaction_status::status.eq(status.as_str()),
                        transaction_status::error_message.eq(error_message),
                        transaction_status::retry_count.eq(transaction_status::retry_count + 1),
                        transaction_status::last_retry_time_ms.eq(Some(now_ms)),
                    ))
                    .execute(&mut *conn)
                    .await
            }
            _ => {
                diesel::update(target)
                    .set((
                        transaction_status::status.eq(status.as_str()),
                        transaction_status::error_message.eq(error_message),
                    ))
                    .execute(&mut *conn)
                    .await
            }
        }
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if affected == 0 {
            return Err(StoreError::Database(format!(
                "no status row for transaction {id}"
            )));
        }
        Ok(())
    }

    async fn get_by_txid(&self, txid: &str) -> Result<Option<TransactionRecord>, StoreError> {
        let mut conn = self
            .db
            .connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row: Option<(StoredTransaction, StoredStatus)> = transactions::table
            .inner_join(transaction_status::table)
            .filter(transactions::txid.eq(txid))
            .select((StoredTransaction::as_select(), StoredStatus::as_select()))
            .first(&mut *conn)
            .await
            .optional()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.map(|(transaction, status)| into_record(transaction, status))
            .transpose()
    }

    async fn get_pending(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut conn = self
            .db
            .connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let rows: Vec<(StoredTransaction, StoredStatus)> = transactions::table
            .inner_join(transaction_status::table)
            .filter(transaction_status::status.eq(TransactionStatus::Pending.as_str()))
            .order(transactions::timestamp_ms.asc())
            .limit(limit)
            .select((StoredTransaction::as_select(), StoredStatus::as_select()))
            .load(&mut *conn)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|(transaction, status)| into_record(transaction, status))
            .collect()
    }

    async fn health_check(&self) -> bool {
        let Ok(mut conn) = self.db.connection().await else {
            return false;
        };
        diesel::sql_query("SELECT 1")
            .execute(&mut *conn)
            .await
            .is_ok()
    }
}
