//! Prometheus metrics and the reporting HTTP endpoint.
//!
//! Serves:
//! - `/metrics` - Prometheus text format
//! - `/clients` - JSON array of tracked connections (via the tracker's
//!   report channel)
//! - `/healthz` - liveness probe

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};
use crate::server::tracker::{Connection, ReportSender};

/// All counters, gauges, and histograms the data plane touches.
pub struct Metrics {
    registry: Registry,

    // Service
    pub accepted: IntCounter,

    // Client handler
    pub connects: IntCounter,
    pub disconnects: IntCounter,
    pub client_fail: IntCounterVec,

    // Tracker
    pub tracked: IntGaugeVec,

    // Netblock
    pub ip_usage: IntGaugeVec,

    // Router and session pumps
    pub rx_packets: IntCounter,
    pub rx_bytes: IntCounter,
    pub tx_packets: IntCounter,
    pub tx_bytes: IntCounter,
    pub tx_dropped: IntCounter,
    pub route_seconds: Histogram,
}

impl Metrics {
    /// Create and register all collectors.
    pub fn new() -> Result<Arc<Self>> {
        Self::build().map_err(|e| Error::Config(format!("metrics registry: {e}")))
    }

    fn build() -> std::result::Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let accepted = IntCounter::new("warren_client_accept", "Number of clients accepted")?;

        let connects = IntCounter::new(
            "warren_client_connect",
            "Number of times a client has connected",
        )?;
        let disconnects = IntCounter::new(
            "warren_client_disconnect",
            "Number of times a client has disconnected",
        )?;
        let client_fail = IntCounterVec::new(
            Opts::new(
                "warren_client_fail",
                "Number of times a client failed before the application handshake",
            ),
            &["reason"],
        )?;

        let tracked = IntGaugeVec::new(
            Opts::new("warren_clients_tracked", "Number of tracked clients"),
            &["table"],
        )?;

        let ip_usage = IntGaugeVec::new(
            Opts::new(
                "warren_ip_usage",
                "Client IP utilisation, free and allocated counts",
            ),
            &["table"],
        )?;

        let rx_packets = IntCounter::new(
            "warren_rx_packets",
            "Number of packets received from clients",
        )?;
        let rx_bytes =
            IntCounter::new("warren_rx_bytes", "Number of bytes received from clients")?;
        let tx_packets =
            IntCounter::new("warren_tx_packets", "Number of packets sent to clients")?;
        let tx_bytes = IntCounter::new("warren_tx_bytes", "Number of bytes sent to clients")?;
        let tx_dropped = IntCounter::new(
            "warren_tx_dropped",
            "Number of packets dropped for lack of a route or a full client queue",
        )?;
        let route_seconds = Histogram::with_opts(
            HistogramOpts::new("warren_router_seconds", "Router packet delivery time")
                .buckets(prometheus::exponential_buckets(156e-9, 2.0, 5)?),
        )?;

        registry.register(Box::new(accepted.clone()))?;
        registry.register(Box::new(connects.clone()))?;
        registry.register(Box::new(disconnects.clone()))?;
        registry.register(Box::new(client_fail.clone()))?;
        registry.register(Box::new(tracked.clone()))?;
        registry.register(Box::new(ip_usage.clone()))?;
        registry.register(Box::new(rx_packets.clone()))?;
        registry.register(Box::new(rx_bytes.clone()))?;
        registry.register(Box::new(tx_packets.clone()))?;
        registry.register(Box::new(tx_bytes.clone()))?;
        registry.register(Box::new(tx_dropped.clone()))?;
        registry.register(Box::new(route_seconds.clone()))?;

        Ok(Arc::new(Self {
            registry,
            accepted,
            connects,
            disconnects,
            client_fail,
            tracked,
            ip_usage,
            rx_packets,
            rx_bytes,
            tx_packets,
            tx_bytes,
            tx_dropped,
            route_seconds,
        }))
    }

    /// Render the registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut out) {
            tracing::error!("metrics encode failed: {e}");
        }
        String::from_utf8(out).unwrap_or_default()
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
    reports: ReportSender,
}

/// Serve the metrics endpoint until shutdown.
pub async fn serve_http(
    listen: SocketAddr,
    metrics: Arc<Metrics>,
    reports: ReportSender,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = AppState { metrics, reports };

    let app = Router::new()
        .route("/metrics", get(metrics_text))
        .route("/clients", get(clients))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "metrics: http listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(Error::Io)?;

    Ok(())
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}

async fn clients(State(state): State<AppState>) -> Response {
    let (reply, response) = oneshot::channel::<Vec<Connection>>();
    if state.reports.send(reply).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match response.await {
        Ok(list) => Json(list).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_encodes() {
        let metrics = Metrics::new().unwrap();
        metrics.accepted.inc();
        metrics.client_fail.with_label_values(&["tls"]).inc();
        metrics.ip_usage.with_label_values(&["free"]).set(2045);

        let text = metrics.encode();
        assert!(text.contains("warren_client_accept 1"));
        assert!(text.contains("warren_client_fail"));
        assert!(text.contains("warren_ip_usage"));
        assert!(text.contains("warren_router_seconds"));
    }
}
