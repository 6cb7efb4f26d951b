// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! EVM ledger client
//!
//! Wraps an ethers HTTP provider behind the three capabilities the relay
//! needs: head height, per-block deposit logs of the watched contract, and
//! the outbound `releaseTokens` call signed by the configured minter key.

use crate::error::{RelayError, RelayResult};
use ethers::abi::{self, ParamType, Token};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{
    Address as EthAddress, BlockNumber, Bytes, Filter, Log, TransactionRequest, H256, U256, U64,
};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::sync::Arc;

pub type EthSigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Topic of `BridgeDeposit(address indexed from, uint256 amount,
/// string targetChain, string targetAddress)`
pub static DEPOSIT_EVENT_TOPIC: Lazy<H256> = Lazy::new(|| {
    H256::from(keccak256(
        "BridgeDeposit(address,uint256,string,string)".as_bytes(),
    ))
});

/// Selector of `releaseTokens(string sourceAccount, address to, uint256 amount)`
static RELEASE_TOKENS_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let hash = keccak256("releaseTokens(string,address,uint256)".as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
});

/// Decoded deposit event emitted by the bridge contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmDepositEvent {
    pub from: EthAddress,
    pub amount: U256,
    pub target_chain: String,
    pub target_address: String,
    pub tx_hash: H256,
    pub block_number: u64,
}

pub struct EvmRpcClient {
    client: Arc<EthSigner>,
    contract: EthAddress,
    confirmations: usize,
}

impl EvmRpcClient {
    pub async fn connect(
        rpc_url: &str,
        contract: EthAddress,
        minter_key: &str,
        confirmations: usize,
    ) -> RelayResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| RelayError::Config(format!("invalid EVM rpc url: {e}")))?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| RelayError::Rpc(format!("get_chainid: {e}")))?;
        let wallet = minter_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| RelayError::Config(format!("invalid minter key: {e}")))?
            .with_chain_id(chain_id.as_u64());
        Ok(Self {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            contract,
            confirmations,
        })
    }

    pub async fn head_height(&self) -> RelayResult<u64> {
        let number: U64 = self
            .client
            .get_block_number()
            .await
            .map_err(|e| RelayError::Rpc(format!("get_block_number: {e}")))?;
        Ok(number.as_u64())
    }

    /// Timestamp of a block in unix milliseconds, `None` if the block does
    /// not exist (yet).
    pub async fn block_timestamp_ms(&self, height: u64) -> RelayResult<Option<i64>> {
        let block = self
            .client
            .get_block(BlockNumber::Number(height.into()))
            .await
            .map_err(|e| RelayError::Rpc(format!("get_block {height}: {e}")))?;
        Ok(block.map(|b| b.timestamp.as_u64() as i64 * 1000))
    }

    /// Deposit-event logs of the watched contract within a single block
    pub async fn deposit_logs(&self, height: u64) -> RelayResult<Vec<Log>> {
        let filter = Filter::new()
            .address(self.contract)
            .topic0(*DEPOSIT_EVENT_TOPIC)
            .from_block(height)
            .to_block(height);
        self.client
            .get_logs(&filter)
            .await
            .map_err(|e| RelayError::Rpc(format!("get_logs {height}: {e}")))
    }

    /// Submit a `releaseTokens` call and wait for the configured number of
    /// confirmations. Returns the transaction hash.
    pub async fn release_tokens(
        &self,
        source_account: &str,
        to: EthAddress,
        amount: U256,
    ) -> RelayResult<String> {
        let data = release_tokens_calldata(source_account, to, amount);
        let tx = TransactionRequest::new().to(self.contract).data(data);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| RelayError::Broadcast(format!("send_transaction: {e}")))?;
        let receipt = pending
            .confirmations(self.confirmations)
            .await
            .map_err(|e| RelayError::Broadcast(format!("awaiting confirmations: {e}")))?
            .ok_or_else(|| {
                RelayError::Broadcast("transaction dropped from the mempool".to_string())
            })?;
        if receipt.status != Some(U64::one()) {
            return Err(RelayError::Broadcast(format!(
                "transaction {:?} reverted",
                receipt.transaction_hash
            )));
        }
        Ok(format!("{:?}", receipt.transaction_hash))
    }
}

/// Decode a `BridgeDeposit` log. Logs with a foreign topic or malformed
/// data yield `None` and are skipped by the caller.
pub fn decode_deposit_log(log: &Log) -> Option<EvmDepositEvent> {
    if log.topics.first() != Some(&*DEPOSIT_EVENT_TOPIC) {
        return None;
    }
    let from_topic = log.topics.get(1)?;
    let from = EthAddress::from_slice(&from_topic.as_bytes()[12..]);

    let tokens = abi::decode(
        &[ParamType::Uint(256), ParamType::String, ParamType::String],
        &log.data,
    )
    .ok()?;
    let amount = tokens.first()?.clone().into_uint()?;
    let target_chain = tokens.get(1)?.clone().into_string()?;
    let target_address = tokens.get(2)?.clone().into_string()?;

    Some(EvmDepositEvent {
        from,
        amount,
        target_chain,
        target_address,
        tx_hash: log.transaction_hash?,
        block_number: log.block_number?.as_u64(),
    })
}

fn release_tokens_calldata(source_account: &str, to: EthAddress, amount: U256) -> Bytes {
    let mut data = RELEASE_TOKENS_SELECTOR.to_vec();
    data.extend(abi::encode(&[
        Token::String(source_account.to_string()),
        Token::Address(to),
        Token::Uint(amount),
    ]));
    Bytes::from(data)
}
