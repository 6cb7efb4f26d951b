// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Steem chain source
//!
//! Scans blocks for `transfer` operations addressed to the watched account,
//! parses the routing memo, and emits printable-amount deposits. Outbound
//! transfers are broadcast as native transfers signed with the configured
//! active key, carrying the source account as memo.

use crate::error::RelayResult;
use crate::steem_rpc::{SignedBlock, SteemKey, SteemRpcClient};
use crate::types::{parse_route, Asset, Deposit, DepositAmount, TransferRequest};
use crate::watcher::ChainSource;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

pub const STEEM_CHAIN_NAME: &str = "steem";

pub struct SteemSource {
    client: SteemRpcClient,
    account: String,
    key: SteemKey,
    memo_pattern: Regex,
    /// Symbol used for outbound native transfers
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct TransferPayload {
    from: String,
    to: String,
    amount: String,
    #[serde(default)]
    memo: String,
}

impl SteemSource {
    pub fn new(
        client: SteemRpcClient,
        account: impl Into<String>,
        key: SteemKey,
        memo_pattern: Regex,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            client,
            account: account.into(),
            key,
            memo_pattern,
            symbol: symbol.into(),
        }
    }
}

#[async_trait]
impl ChainSource for SteemSource {
    fn chain(&self) -> &str {
        STEEM_CHAIN_NAME
    }

    async fn head_height(&self) -> RelayResult<u64> {
        Ok(self
            .client
            .dynamic_global_properties()
            .await?
            .head_block_number)
    }

    async fn deposits_in_block(&self, height: u64) -> RelayResult<Vec<Deposit>> {
        let Some(block) = self.client.block(height).await? else {
            return Ok(Vec::new());
        };
        Ok(scan_block_transfers(
            &block,
            height,
            &self.account,
            &self.memo_pattern,
        ))
    }

    async fn broadcast_transfer(&self, request: &TransferRequest) -> RelayResult<String> {
        // The outbound leg is always denominated in the chain's native symbol
        let amount = Asset::new(request.amount.units, self.symbol.clone()).to_string();
        self.client
            .broadcast_transfer(
                &self.key,
                &self.account,
                &request.to_address,
                &amount,
                &request.reference,
            )
            .await
    }
}

/// Extract qualifying deposits from one block: `transfer` operations
/// addressed to `account` whose memo matches the routing pattern.
/// Non-matching memos are ignored, not an error.
fn scan_block_transfers(
    block: &SignedBlock,
    height: u64,
    account: &str,
    memo_pattern: &Regex,
) -> Vec<Deposit> {
    let observed_at_ms = crate::steem_rpc::parse_block_timestamp_ms(&block.timestamp);

    let mut deposits = Vec::new();
    for (index, transaction) in block.transactions.iter().enumerate() {
        let Some(txid) = block.transaction_ids.get(index) else {
            continue;
        };
        for (name, payload) in &transaction.operations {
            if name != "transfer" {
                continue;
            }
            let Ok(transfer) = serde_json::from_value::<TransferPayload>(payload.clone()) else {
                continue;
            };
            if transfer.to != account {
                continue;
            }
            let Some(route) = parse_route(&transfer.memo, memo_pattern) else {
                debug!(
                    "[{STEEM_CHAIN_NAME}] ignoring transfer {txid} with non-routing memo {:?}",
                    transfer.memo
                );
                continue;
            };
            deposits.push(Deposit {
                source_chain: STEEM_CHAIN_NAME.to_string(),
                from_account: transfer.from,
                amount: DepositAmount::Printable(transfer.amount),
                route,
                txid: txid.clone(),
                block_num: height,
                observed_at_ms,
            });
        }
    }
    deposits
}
