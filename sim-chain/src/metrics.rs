//! Prometheus-backed metrics and their HTTP exporter.
//!
//! Defines a [`MetricsRegistry`] owning a Prometheus registry and a set of
//! strongly-typed node metrics, plus a small `hyper` server exposing them:
//! `GET /metrics` in the Prometheus text format for scrapers, and
//! `GET /healthz` as a one-line JSON summary for run scripts that just
//! want to poll whether a node is alive and sane.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;

/// Node-level Prometheus metrics.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Latency of block production (mining / slot wait), in seconds.
    pub block_production_seconds: Histogram,
    /// Latency of block validation, in seconds.
    pub block_validation_seconds: Histogram,
    /// Total blocks this node accepted into its local chain.
    pub blocks_accepted: IntCounter,
    /// Total blocks rejected as invalid.
    pub blocks_rejected: IntCounter,
    /// Total reorgs observed.
    pub reorgs_total: IntCounter,
    /// Total finality safety violations observed. Should remain 0 in any
    /// healthy run; a non-zero value indicates a consensus bug or a
    /// scenario that broke the engine's safety assumption.
    pub safety_violations_total: IntCounter,
    /// Current chain tip height.
    pub tip_height: prometheus::Gauge,
    /// Current count of directly connected gossip peers.
    pub connected_peers: prometheus::Gauge,
    /// Transactions currently waiting in the local pool.
    pub mempool_size: prometheus::Gauge,
}

impl NodeMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let block_production_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sim_block_production_seconds",
                "Time spent producing a block (mining or slot wait) in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(block_production_seconds.clone()))?;

        let block_validation_seconds = Histogram::with_opts(HistogramOpts::new(
            "sim_block_validation_seconds",
            "Time to validate an incoming block in seconds",
        ))?;
        registry.register(Box::new(block_validation_seconds.clone()))?;

        let blocks_accepted = IntCounter::with_opts(Opts::new(
            "sim_blocks_accepted_total",
            "Total number of blocks accepted into the local chain",
        ))?;
        registry.register(Box::new(blocks_accepted.clone()))?;

        let blocks_rejected = IntCounter::with_opts(Opts::new(
            "sim_blocks_rejected_total",
            "Total number of blocks rejected as invalid",
        ))?;
        registry.register(Box::new(blocks_rejected.clone()))?;

        let reorgs_total = IntCounter::with_opts(Opts::new(
            "sim_reorgs_total",
            "Total number of chain tip reorganisations observed",
        ))?;
        registry.register(Box::new(reorgs_total.clone()))?;

        let safety_violations_total = IntCounter::with_opts(Opts::new(
            "sim_safety_violations_total",
            "Total number of finality safety violations observed",
        ))?;
        registry.register(Box::new(safety_violations_total.clone()))?;

        let tip_height = prometheus::Gauge::with_opts(Opts::new(
            "sim_tip_height",
            "Current local chain tip height",
        ))?;
        registry.register(Box::new(tip_height.clone()))?;

        let connected_peers = prometheus::Gauge::with_opts(Opts::new(
            "sim_connected_peers",
            "Current number of directly connected gossip peers",
        ))?;
        registry.register(Box::new(connected_peers.clone()))?;

        let mempool_size = prometheus::Gauge::with_opts(Opts::new(
            "sim_mempool_size",
            "Transactions currently waiting in the local pool",
        ))?;
        registry.register(Box::new(mempool_size.clone()))?;

        Ok(Self {
            block_production_seconds,
            block_validation_seconds,
            blocks_accepted,
            blocks_rejected,
            reorgs_total,
            safety_violations_total,
            tip_height,
            connected_peers,
            mempool_size,
        })
    }
}

/// Wrapper around a Prometheus registry and the node metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    node_id: u64,
    pub node: NodeMetrics,
}

impl MetricsRegistry {
    pub fn new(node_id: u64) -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("sim_node".to_string()), {
            let mut labels = std::collections::HashMap::new();
            labels.insert("node_id".to_string(), node_id.to_string());
            Some(labels)
        })?;
        let node = NodeMetrics::register(&registry)?;
        Ok(Self {
            registry,
            node_id,
            node,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// One-line JSON health summary served at `/healthz`: enough for a run
    /// script to tell a live, converging node from a stalled or halted one
    /// without parsing the full Prometheus exposition.
    pub fn health_json(&self) -> String {
        serde_json::json!({
            "node_id": self.node_id,
            "tip_height": self.node.tip_height.get() as u64,
            "connected_peers": self.node.connected_peers.get() as u64,
            "mempool_size": self.node.mempool_size.get() as u64,
            "safety_violations": self.node.safety_violations_total.get(),
        })
        .to_string()
    }
}

/// Serves the node's observability endpoints, one task per connection.
/// Intended to be spawned onto the runtime once per node.
pub async fn run_metrics_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, remote) = listener.accept().await?;
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move { Ok::<_, Infallible>(route(&req, &metrics)) }
            });
            let served = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
            if let Err(err) = served {
                tracing::debug!(%remote, %err, "metrics connection error");
            }
        });
    }
}

/// Maps a request to a response. Everything here renders synchronously
/// from in-memory state; there is nothing to await.
fn route(req: &Request<Incoming>, metrics: &MetricsRegistry) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, None, "GET only".to_string());
    }
    match req.uri().path() {
        "/metrics" => respond(
            StatusCode::OK,
            Some("text/plain; version=0.0.4"),
            metrics.gather_text(),
        ),
        "/healthz" => respond(
            StatusCode::OK,
            Some("application/json"),
            metrics.health_json(),
        ),
        _ => respond(StatusCode::NOT_FOUND, None, "not found".to_string()),
    }
}

fn respond(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: String,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}
