//! nfcrelay - NFC session relay server
//!
//! Clients rendezvous on a numeric session and every payload one member sends
//! is relayed to all other members through an ordered stage pipeline.

use clap::Parser;
use nfcrelay_server::metrics::run_metrics_server;
use nfcrelay_server::{Config, Metrics, Server, ServerConfig, StageCatalog, TlsMode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nfcrelay")]
#[command(about = "Session relay server for NFC traffic")]
#[command(version)]
struct Cli {
    /// Stages to apply to relayed payloads, in order
    plugins: Vec<String>,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    // ===== TLS Options =====
    /// Enable TLS
    #[arg(short = 's', long)]
    tls: bool,

    /// Path to the PEM server certificate
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to the PEM server private key
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Require client certificates signed by --ca-cert (implies --tls)
    #[arg(long, requires = "ca_cert")]
    verify: bool,

    /// Path to the PEM CA certificate used to verify clients
    #[arg(long)]
    ca_cert: Option<PathBuf>,
}

impl Cli {
    /// Applies command-line flags on top of the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if !self.plugins.is_empty() {
            config.relay.plugins = self.plugins.clone();
        }
        if let Some(bind) = self.bind {
            config.network.bind_addr = bind;
        }
        if let Some(secs) = self.idle_timeout {
            config.network.idle_timeout_secs = secs;
        }
        if self.tls || self.verify {
            config.tls.enabled = true;
        }
        if let Some(ref path) = self.tls_cert {
            config.tls.cert_path = Some(path.clone());
        }
        if let Some(ref path) = self.tls_key {
            config.tls.key_path = Some(path.clone());
        }
        if self.verify {
            config.tls.require_client_cert = true;
        }
        if let Some(ref path) = self.ca_cert {
            config.tls.client_ca_path = Some(path.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::load()?,
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting nfcrelay server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Idle timeout: {}s", config.network.idle_timeout_secs);
    match config.tls.mode() {
        TlsMode::Disabled => tracing::info!("  TLS: disabled"),
        TlsMode::ServerOnly => tracing::info!("  TLS: enabled"),
        TlsMode::Mutual => tracing::info!("  mTLS: enabled (client certificate required)"),
    }

    let pipeline = StageCatalog::with_builtins().build(&config.relay.plugins)?;
    tracing::info!("  Stages: {:?}", pipeline);

    let mut server_config = ServerConfig::from_config(&config)?;
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        Some(metrics)
    } else {
        None
    };

    let server = Arc::new(Server::new(server_config, pipeline));

    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown and every connection has been cleaned up.
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    Ok(())
}
