// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::task::JoinHandle;
use tracing::error;

#[derive(Clone, Debug)]
pub struct RelayMetrics {
    pub(crate) deposits_observed: IntCounterVec,
    pub(crate) deposits_recorded: IntCounterVec,
    pub(crate) duplicate_deposits: IntCounterVec,
    pub(crate) transfers_dispatched: IntCounterVec,
    pub(crate) transfers_completed: IntCounter,
    pub(crate) transfers_failed: IntCounter,
    pub(crate) store_errors: IntCounter,
    pub(crate) last_processed_block: IntGaugeVec,
    pub(crate) observed_head_block: IntGaugeVec,
    pub(crate) pending_transactions: IntGauge,
}

impl RelayMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            deposits_observed: register_int_counter_vec_with_registry!(
                "relay_deposits_observed",
                "Qualifying deposits emitted by a watcher",
                &["chain"],
                registry,
            )
            .unwrap(),
            deposits_recorded: register_int_counter_vec_with_registry!(
                "relay_deposits_recorded",
                "Deposits durably recorded by the store",
                &["chain"],
                registry,
            )
            .unwrap(),
            duplicate_deposits: register_int_counter_vec_with_registry!(
                "relay_duplicate_deposits",
                "Re-delivered deposits rejected by the txid uniqueness guard",
                &["chain"],
                registry,
            )
            .unwrap(),
            transfers_dispatched: register_int_counter_vec_with_registry!(
                "relay_transfers_dispatched",
                "Outbound transfer requests issued to a watcher",
                &["chain"],
                registry,
            )
            .unwrap(),
            transfers_completed: register_int_counter_with_registry!(
                "relay_transfers_completed",
                "Outbound transfers confirmed on the destination chain",
                registry,
            )
            .unwrap(),
            transfers_failed: register_int_counter_with_registry!(
                "relay_transfers_failed",
                "Outbound transfer attempts that failed",
                registry,
            )
            .unwrap(),
            store_errors: register_int_counter_with_registry!(
                "relay_store_errors",
                "Non-duplicate store failures on the deposit path",
                registry,
            )
            .unwrap(),
            last_processed_block: register_int_gauge_vec_with_registry!(
                "relay_last_processed_block",
                "Persisted checkpoint per chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            observed_head_block: register_int_gauge_vec_with_registry!(
                "relay_observed_head_block",
                "Most recently observed chain head per chain",
                &["chain"],
                registry,
            )
            .unwrap(),
            pending_transactions: register_int_gauge_with_registry!(
                "relay_pending_transactions",
                "Recorded transactions still awaiting settlement",
                registry,
            )
            .unwrap(),
        }
    }

}

/// Serve the registry under `/metrics` on the given port.
pub fn start_metrics_server(port: u16, registry: Registry) -> JoinHandle<()> {
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(registry);
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server on {address}: {e}");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server exited: {e}");
        }
    })
}

async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {e}");
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
}
