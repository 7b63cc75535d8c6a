//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{ConnectionHandler, DEFAULT_IDLE_TIMEOUT, DEFAULT_OUTBOUND_QUEUE};
use crate::metrics::Metrics;
use crate::pipeline::{Diagnostics, Pipeline};
use crate::registry::SessionRegistry;
use crate::stream::RelayStream;
use crate::tls::acceptor_for;
use nfcrelay_protocol::{DEFAULT_PORT, MAX_PAYLOAD_SIZE};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle-read timeout per connection. It also bounds the TLS handshake
    /// and each wait on a recipient's full outbound queue.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest accepted inbound payload.
    pub max_payload: u32,
    /// Outbound units queued per connection before senders wait.
    pub outbound_queue: usize,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_payload", &self.max_payload)
            .field("outbound_queue", &self.outbound_queue)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: 1000,
            max_payload: MAX_PAYLOAD_SIZE,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            tls_acceptor: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server configuration from a validated [`Config`], loading
    /// TLS material if TLS is enabled.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let mut server_config = Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            max_payload: config.relay.max_payload_bytes,
            outbound_queue: config.relay.outbound_queue,
            ..Default::default()
        };
        if let Some(acceptor) = acceptor_for(&config.tls)? {
            server_config = server_config.with_tls(acceptor);
        }
        Ok(server_config)
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Keeps the active-connection counters honest on every exit path of a
/// connection task.
struct ActiveConnection {
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
}

impl ActiveConnection {
    fn enter(stats: Arc<ServerStats>, metrics: Option<Arc<Metrics>>) -> Self {
        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        Self { stats, metrics }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
        }
    }
}

/// Relay server.
pub struct Server {
    config: ServerConfig,
    handler: Arc<ConnectionHandler>,
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    stopping: AtomicBool,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server relaying through `pipeline`.
    pub fn new(config: ServerConfig, pipeline: Pipeline) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(SessionRegistry::new().with_send_timeout(config.idle_timeout));
        let mut handler = ConnectionHandler::new(registry.clone(), Arc::new(pipeline))
            .with_idle_timeout(config.idle_timeout)
            .with_max_payload(config.max_payload)
            .with_outbound_queue(config.outbound_queue);
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }
        Self {
            config,
            handler: Arc::new(handler),
            registry,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            stopping: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already-bound listener.
    ///
    /// Returns once shutdown has been requested and every connection task has
    /// finished its cleanup.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("Server listening on {} ({})", listener.local_addr()?, tls_mode);

        let mut tasks = JoinSet::new();

        while !self.stopping.load(Ordering::SeqCst) {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::reap(joined, &self.stats);
                }

                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            let conn_shutdown = self.shutdown.subscribe();
                            if self.stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            let active = ActiveConnection::enter(
                                self.stats.clone(),
                                self.config.metrics.clone(),
                            );
                            tasks.spawn(Self::handle_connection(
                                tcp_stream,
                                addr,
                                self.config.clone(),
                                self.handler.clone(),
                                conn_shutdown,
                                active,
                            ));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Server shutting down, waiting for {} connections",
            tasks.len()
        );
        drop(listener);
        while let Some(joined) = tasks.join_next().await {
            Self::reap(joined, &self.stats);
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Server stopped");
        Ok(())
    }

    fn reap(joined: Result<(), tokio::task::JoinError>, stats: &ServerStats) {
        if let Err(e) = joined {
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Connection task failed: {}", e);
        }
    }

    /// Performs the TLS handshake if enabled.
    async fn maybe_tls_accept(
        tcp_stream: TcpStream,
        acceptor: Option<&TlsAcceptor>,
        addr: SocketAddr,
        handshake_timeout: Duration,
    ) -> Result<RelayStream, ServerError> {
        match acceptor {
            Some(acceptor) => {
                tracing::debug!("[{}] Performing TLS handshake", addr);
                let accept = acceptor.accept(tcp_stream);
                let tls_stream = tokio::time::timeout(handshake_timeout, accept)
                    .await
                    .map_err(|_| ServerError::TlsHandshake("timed out".into()))?
                    .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                tracing::debug!("[{}] TLS handshake complete", addr);
                Ok(RelayStream::Tls { stream: tls_stream })
            }
            None => Ok(RelayStream::Plain { stream: tcp_stream }),
        }
    }

    /// Runs one accepted connection to completion.
    async fn handle_connection(
        tcp_stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        handler: Arc<ConnectionHandler>,
        mut shutdown: broadcast::Receiver<()>,
        active: ActiveConnection,
    ) {
        let handshake = Self::maybe_tls_accept(
            tcp_stream,
            config.tls_acceptor.as_deref(),
            addr,
            config.idle_timeout,
        );
        let stream = tokio::select! {
            result = handshake => match result {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("[{}] {}", addr, e);
                    active.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref metrics) = config.metrics {
                        metrics.tls_handshake_failures_total.inc();
                        metrics.terminations_total.with_label_values(&[e.label()]).inc();
                    }
                    return;
                }
            },
            _ = shutdown.recv() => return,
        };

        tracing::info!("Client connected: {} ({})", addr, stream.describe());

        let reason = match handler.run(stream, addr, &mut shutdown).await {
            Ok(termination) => {
                tracing::info!("Client disconnected: {} ({})", addr, termination);
                termination.label()
            }
            Err(e) => {
                active.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                Diagnostics::new("server", addr).emit(format_args!("Connection error: {}", e));
                tracing::info!("Client disconnected: {}", addr);
                e.label()
            }
        };

        if let Some(ref metrics) = config.metrics {
            metrics.terminations_total.with_label_values(&[reason]).inc();
        }
        drop(active);
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver notified when shutdown is requested.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
