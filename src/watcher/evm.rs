// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! EVM chain source
//!
//! Scans the watched bridge contract for `BridgeDeposit` events, whose
//! structured arguments carry the routing target directly (no string memo).
//! Outbound transfers call `releaseTokens` with the amount scaled back to
//! the token's decimals.

use crate::error::{RelayError, RelayResult};
use crate::evm_rpc::{decode_deposit_log, EvmRpcClient};
use crate::types::{Deposit, DepositAmount, RouteTarget, TransferRequest};
use crate::watcher::ChainSource;
use async_trait::async_trait;
use ethers::types::Address as EthAddress;

pub struct EvmSource {
    chain: String,
    client: EvmRpcClient,
    token_symbol: String,
    token_decimals: u32,
}

impl EvmSource {
    pub fn new(
        chain: impl Into<String>,
        client: EvmRpcClient,
        token_symbol: impl Into<String>,
        token_decimals: u32,
    ) -> Self {
        Self {
            chain: chain.into(),
            client,
            token_symbol: token_symbol.into(),
            token_decimals,
        }
    }
}

#[async_trait]
impl ChainSource for EvmSource {
    fn chain(&self) -> &str {
        &self.chain
    }

    async fn head_height(&self) -> RelayResult<u64> {
        self.client.head_height().await
    }

    async fn deposits_in_block(&self, height: u64) -> RelayResult<Vec<Deposit>> {
        let Some(observed_at_ms) = self.client.block_timestamp_ms(height).await? else {
            return Ok(Vec::new());
        };
        let logs = self.client.deposit_logs(height).await?;
        Ok(logs
            .iter()
            .filter_map(decode_deposit_log)
            .map(|event| Deposit {
                source_chain: self.chain.clone(),
                from_account: format!("{:?}", event.from),
                amount: DepositAmount::FixedPoint {
                    value: event.amount,
                    decimals: self.token_decimals,
                    symbol: self.token_symbol.clone(),
                },
                route: RouteTarget {
                    chain: event.target_chain,
                    address: event.target_address,
                },
                txid: format!("{:?}", event.tx_hash),
                block_num: height,
                observed_at_ms,
            })
            .collect())
    }

    async fn broadcast_transfer(&self, request: &TransferRequest) -> RelayResult<String> {
        let to: EthAddress = request.to_address.parse().map_err(|e| {
            RelayError::Broadcast(format!(
                "invalid destination address {:?}: {e}",
                request.to_address
            ))
        })?;
        let amount = request.amount.to_fixed_point(self.token_decimals);
        self.client
            .release_tokens(&request.reference, to, amount)
            .await
    }
}
