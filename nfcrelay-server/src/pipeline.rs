//! Stage pipeline applied to relayed payloads.
//!
//! A relayed message is a batch of payloads. Every stage sees only the
//! current head of the batch: its output replaces the head and the tail
//! passes through untouched. For single-payload stages the result of
//! `[A, B]` over `[p0, p1]` is therefore `[B(A(p0)), p1]`.

use crate::error::ServerError;
use crate::stages::{CountStage, FingerprintStage, LogStage};
use bytes::Bytes;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Diagnostic sink handed to stages, tagged with the stage name and the
/// connection it runs for.
#[derive(Debug, Clone, Copy)]
pub struct Diagnostics<'a> {
    tag: &'a str,
    origin: SocketAddr,
}

impl<'a> Diagnostics<'a> {
    pub fn new(tag: &'a str, origin: SocketAddr) -> Self {
        Self { tag, origin }
    }

    pub fn tag(&self) -> &str {
        self.tag
    }

    pub fn origin(&self) -> SocketAddr {
        self.origin
    }

    /// Emits one diagnostic event. Never blocks.
    pub fn emit(&self, message: impl fmt::Display) {
        tracing::info!(
            target: "nfcrelay::diag",
            tag = self.tag,
            origin = %self.origin,
            "{}",
            message
        );
    }
}

/// Per-connection scratch space shared by all stages for the lifetime of
/// one connection.
#[derive(Debug, Clone, Default)]
pub struct PluginState {
    values: HashMap<String, Value>,
}

impl PluginState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.values.get_mut(key)
    }

    /// Stores a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn entry(&mut self, key: impl Into<String>) -> Entry<'_, String, Value> {
        self.values.entry(key.into())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of running one stage over the head of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    /// Replace the head with one payload.
    One(Bytes),
    /// Replace the head with zero or more payloads. An empty sequence drops
    /// the head.
    Many(Vec<Bytes>),
}

impl Transformed {
    /// Drops the head of the batch.
    pub fn dropped() -> Self {
        Transformed::Many(Vec::new())
    }

    fn splice_into(self, batch: &mut Vec<Bytes>) {
        match self {
            Transformed::One(payload) => batch.insert(0, payload),
            Transformed::Many(payloads) => {
                batch.splice(0..0, payloads);
            }
        }
    }
}

impl From<Bytes> for Transformed {
    fn from(payload: Bytes) -> Self {
        Transformed::One(payload)
    }
}

impl From<Vec<Bytes>> for Transformed {
    fn from(payloads: Vec<Bytes>) -> Self {
        Transformed::Many(payloads)
    }
}

/// A named transform or inspection step.
///
/// Stages only ever see the evolving head of a batch and the state of the
/// connection that produced it.
pub trait Stage: Send + Sync {
    fn transform(
        &self,
        diagnostics: &Diagnostics<'_>,
        payload: Bytes,
        state: &mut PluginState,
    ) -> Transformed;
}

#[derive(Clone)]
struct NamedStage {
    name: String,
    stage: Arc<dyn Stage>,
}

/// Ordered chain of stages.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<NamedStage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    pub fn with_stage(mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(NamedStage {
            name: name.into(),
            stage,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    /// Runs every stage over the head of `batch`.
    pub fn filter(
        &self,
        origin: SocketAddr,
        mut batch: Vec<Bytes>,
        state: &mut PluginState,
    ) -> Vec<Bytes> {
        for named in &self.stages {
            if batch.is_empty() {
                break;
            }
            let head = batch.remove(0);
            let diagnostics = Diagnostics::new(&named.name, origin);
            named
                .stage
                .transform(&diagnostics, head, state)
                .splice_into(&mut batch);
        }
        batch
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Stages available by name.
#[derive(Clone, Default)]
pub struct StageCatalog {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageCatalog {
    /// Creates a catalog with no stages.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a catalog holding the built-in stages.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();
        catalog.register("log", Arc::new(LogStage));
        catalog.register("count", Arc::new(CountStage));
        catalog.register("fingerprint", Arc::new(FingerprintStage));
        catalog
    }

    /// Registers a stage, replacing any previous stage of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
    ) -> Option<Arc<dyn Stage>> {
        self.stages.insert(name.into(), stage)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolves `names` into a pipeline. Any unknown name fails the whole
    /// build.
    pub fn build<S: AsRef<str>>(&self, names: &[S]) -> Result<Pipeline, ServerError> {
        let mut pipeline = Pipeline::new();
        for name in names {
            let name = name.as_ref();
            let stage = self
                .stages
                .get(name)
                .ok_or_else(|| ServerError::UnknownStage(name.to_string()))?;
            pipeline = pipeline.with_stage(name, stage.clone());
            tracing::info!("Loaded stage {}", name);
        }
        Ok(pipeline)
    }
}

impl fmt::Debug for StageCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}
