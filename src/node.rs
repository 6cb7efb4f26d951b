// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Production wiring: build the store, both chain sources, and the relay
//! bus from a validated configuration.

use crate::bus::RelayBus;
use crate::checkpoint::CheckpointStore;
use crate::config::RelayNodeConfig;
use crate::evm_rpc::EvmRpcClient;
use crate::metrics::RelayMetrics;
use crate::steem_rpc::{SteemKey, SteemRpcClient};
use crate::store::db::Db;
use crate::store::pg::PgTransactionStore;
use crate::store::TransactionStore;
use crate::watcher::evm::EvmSource;
use crate::watcher::steem::{SteemSource, STEEM_CHAIN_NAME};
use crate::watcher::{ChainWatcher, WatcherConfig};
use anyhow::Context;
use ethers::types::Address as EthAddress;
use regex::Regex;
use std::sync::Arc;
use url::Url;

/// Build and start the relay. On any construction failure nothing is left
/// running; failures after `start` began are rolled back by the bus itself.
pub async fn run_relay_node(
    config: &RelayNodeConfig,
    metrics: Arc<RelayMetrics>,
) -> anyhow::Result<RelayBus> {
    let database_url: Url = config
        .store
        .database_url
        .parse()
        .context("invalid database-url")?;
    let db = Db::connect(
        &database_url,
        config.store.pool_size,
        config.store.connection_timeout(),
    )
    .await
    .context("failed to open store connection pool")?;
    db.run_migrations().await?;
    let store: Arc<dyn TransactionStore> = Arc::new(PgTransactionStore::new(db));

    let memo_pattern =
        Regex::new(&config.steem.memo_pattern).context("invalid memo-pattern")?;
    let steem_key = SteemKey::from_wif(&config.steem.active_key)?;
    let steem_source = Arc::new(SteemSource::new(
        SteemRpcClient::new(&config.steem.node_url),
        config.steem.account.clone(),
        steem_key,
        memo_pattern,
        config.steem.symbol.clone(),
    ));
    let steem_watcher = ChainWatcher::new(
        WatcherConfig::new(
            STEEM_CHAIN_NAME,
            config.steem.confirm_blocks,
            config.steem.poll_interval(),
        )
        .with_channel_size(config.channel_size),
        steem_source,
        CheckpointStore::new(STEEM_CHAIN_NAME, config.steem.checkpoint_path.clone()),
    )
    .with_metrics(metrics.clone());

    let contract: EthAddress = config
        .evm
        .contract_address
        .parse()
        .context("invalid contract-address")?;
    let evm_client = EvmRpcClient::connect(
        &config.evm.rpc_url,
        contract,
        &config.evm.minter_key,
        config.evm.confirm_blocks as usize,
    )
    .await?;
    let evm_source = Arc::new(EvmSource::new(
        config.evm.chain_name.clone(),
        evm_client,
        config.evm.token_symbol.clone(),
        config.evm.token_decimals,
    ));
    let evm_watcher = ChainWatcher::new(
        WatcherConfig::new(
            config.evm.chain_name.clone(),
            config.evm.confirm_blocks,
            config.evm.poll_interval(),
        )
        .with_channel_size(config.channel_size),
        evm_source,
        CheckpointStore::new(
            config.evm.chain_name.clone(),
            config.evm.checkpoint_path.clone(),
        ),
    )
    .with_metrics(metrics.clone());

    let mut bus =
        RelayBus::new(store, vec![steem_watcher, evm_watcher]).with_metrics(metrics);
    bus.start().await?;
    Ok(bus)
}
