//! Prometheus metrics for the relay server.
//!
//! This module provides:
//! - Metrics registry with relay counters and gauges
//! - HTTP server exposing `/metrics` and `/health`

use crate::error::ServerError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the relay server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Inbound frames decoded.
    pub frames_received_total: Counter,
    /// Inbound payload bytes.
    pub bytes_received_total: Counter,
    /// Outbound frames queued to recipients.
    pub frames_relayed_total: Counter,
    /// Sessions with at least one member.
    pub sessions_active: Gauge,
    /// Failed TLS handshakes.
    pub tls_handshake_failures_total: Counter,
    /// Connection terminations by reason.
    pub terminations_total: CounterVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "nfcrelay_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "nfcrelay_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let frames_received_total = Counter::with_opts(Opts::new(
            "nfcrelay_frames_received_total",
            "Total inbound frames decoded",
        ))?;
        registry.register(Box::new(frames_received_total.clone()))?;

        let bytes_received_total = Counter::with_opts(Opts::new(
            "nfcrelay_bytes_received_total",
            "Total inbound payload bytes",
        ))?;
        registry.register(Box::new(bytes_received_total.clone()))?;

        let frames_relayed_total = Counter::with_opts(Opts::new(
            "nfcrelay_frames_relayed_total",
            "Total outbound frames queued to session members",
        ))?;
        registry.register(Box::new(frames_relayed_total.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "nfcrelay_sessions_active",
            "Number of sessions with at least one member",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let tls_handshake_failures_total = Counter::with_opts(Opts::new(
            "nfcrelay_tls_handshake_failures_total",
            "Total failed TLS handshakes",
        ))?;
        registry.register(Box::new(tls_handshake_failures_total.clone()))?;

        let terminations_total = CounterVec::new(
            Opts::new(
                "nfcrelay_terminations_total",
                "Connection terminations by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(terminations_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            frames_received_total,
            bytes_received_total,
            frames_relayed_total,
            sessions_active,
            tls_handshake_failures_total,
            terminations_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let metric_families = self.registry.gather();
        if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Binds `addr` and serves metrics until shutdown.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics(listener, metrics, shutdown).await
}

/// Serves metrics on an already-bound listener until shutdown.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    tracing::info!(
        "Metrics server listening on http://{}/metrics",
        listener.local_addr()?
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(metrics.encode()),
        ),
        "/health" | "/healthz" => {
            text_response(StatusCode::OK, "text/plain", Bytes::from_static(b"OK"))
        }
        _ => text_response(
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    };

    Ok(response)
}
