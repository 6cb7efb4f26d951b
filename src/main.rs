// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use steem_bridge_relay::config::RelayNodeConfig;
use steem_bridge_relay::metrics::{start_metrics_server, RelayMetrics};
use steem_bridge_relay::node::run_relay_node;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayNodeConfig::load(&args.config_path)?;

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(RelayMetrics::new(&registry));
    let _metrics_server = start_metrics_server(config.metrics_port, registry);
    info!("Metrics server started at port {}", config.metrics_port);

    let mut bus = run_relay_node(&config, metrics).await?;

    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down gracefully...");
    bus.stop().await;
    Ok(())
}
