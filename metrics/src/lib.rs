// SPDX-License-Identifier: MIT

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::OnceLock;

use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub struct AppMetrics {
    registry: Registry,
    pub recon_peer_count: Gauge<f64, AtomicU64>,
    pub recon_queue_depth: Gauge<f64, AtomicU64>,
    pub fanout_tx_count: Counter<f64, AtomicU64>,
}

impl AppMetrics {
    pub fn new() -> Self {
        let mut registry = <Registry>::default();
        let recon_peer_count = Gauge::<f64, AtomicU64>::default();
        let recon_queue_depth = Gauge::<f64, AtomicU64>::default();
        let fanout_tx_count = Counter::<f64, AtomicU64>::default();

        registry.register(
            "recon_peer_count",
            "Number of peers registered for transaction reconciliation",
            recon_peer_count.clone(),
        );

        registry.register(
            "recon_queue_depth",
            "Number of peers waiting in the reconciliation queue",
            recon_queue_depth.clone(),
        );

        registry.register(
            "fanout_tx_count",
            "Number of transactions announced by flooding instead of reconciliation",
            fanout_tx_count.clone(),
        );

        Self {
            registry,
            recon_peer_count,
            recon_queue_depth,
            fanout_tx_count,
        }
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// Singleton to share metrics across crates
static METRICS: OnceLock<AppMetrics> = OnceLock::new();
pub fn get_metrics() -> &'static AppMetrics {
    METRICS.get_or_init(AppMetrics::new)
}

async fn metrics_handler() -> String {
    let mut buffer = String::new();
    encode(&mut buffer, &get_metrics().registry).unwrap();

    buffer
}

pub async fn metrics_server(metrics_server_address: SocketAddr) {
    let app = Router::new().route("/", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(metrics_server_address)
        .await
        .unwrap();
    axum::serve(listener, app).await.unwrap();
}
