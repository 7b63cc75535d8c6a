//! # nfcrelay-server
//!
//! Session relay server for nfcrelay.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Session registry with join, leave and broadcast
//! - Ordered stage pipeline applied to relayed payloads
//! - Optional TLS and mutual TLS
//! - Prometheus metrics

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod stages;
pub mod stream;
pub mod tls;

pub use config::{Config, MetricsConfig, NetworkConfig, RelayConfig, TlsConfig, TlsMode};
pub use error::ServerError;
pub use handler::{ConnectionHandler, Termination};
pub use metrics::Metrics;
pub use pipeline::{Diagnostics, Pipeline, PluginState, Stage, StageCatalog, Transformed};
pub use registry::{ClientId, Member, SessionRegistry};
pub use server::{Server, ServerConfig};
