//! Built-in pipeline stages.
//!
//! None of these change the payload; they exist to inspect traffic.

use crate::pipeline::{Diagnostics, PluginState, Stage, Transformed};
use bytes::Bytes;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Logs the length and hex dump of every payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStage;

impl Stage for LogStage {
    fn transform(
        &self,
        diagnostics: &Diagnostics<'_>,
        payload: Bytes,
        _state: &mut PluginState,
    ) -> Transformed {
        diagnostics.emit(format_args!(
            "{} bytes: {}",
            payload.len(),
            hex::encode(&payload)
        ));
        payload.into()
    }
}

/// Counts payloads per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountStage;

impl CountStage {
    pub const STATE_KEY: &'static str = "count";
}

impl Stage for CountStage {
    fn transform(
        &self,
        diagnostics: &Diagnostics<'_>,
        payload: Bytes,
        state: &mut PluginState,
    ) -> Transformed {
        let count = state
            .get(Self::STATE_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        state.insert(Self::STATE_KEY, count);
        diagnostics.emit(format_args!("payload #{}", count));
        payload.into()
    }
}

/// Logs a short SHA-256 prefix of every payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintStage;

impl FingerprintStage {
    pub fn fingerprint(payload: &[u8]) -> String {
        let digest = Sha256::digest(payload);
        hex::encode(&digest[..8])
    }
}

impl Stage for FingerprintStage {
    fn transform(
        &self,
        diagnostics: &Diagnostics<'_>,
        payload: Bytes,
        _state: &mut PluginState,
    ) -> Transformed {
        diagnostics.emit(format_args!("sha256:{}", Self::fingerprint(&payload)));
        payload.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageCatalog;
    use std::net::SocketAddr;

    fn origin() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_builtins_pass_payload_through() {
        let pipeline = StageCatalog::with_builtins()
            .build(&["log", "count", "fingerprint"])
            .unwrap();
        let mut state = PluginState::new();
        let batch = vec![Bytes::from_static(b"\x60\x00"), Bytes::from_static(b"tail")];

        assert_eq!(pipeline.filter(origin(), batch.clone(), &mut state), batch);
    }

    #[test]
    fn test_count_is_per_state() {
        let pipeline = StageCatalog::with_builtins().build(&["count"]).unwrap();
        let mut first = PluginState::new();
        let mut second = PluginState::new();

        for _ in 0..3 {
            pipeline.filter(origin(), vec![Bytes::from_static(b"x")], &mut first);
        }
        pipeline.filter(origin(), vec![Bytes::from_static(b"x")], &mut second);

        assert_eq!(
            first.get(CountStage::STATE_KEY).and_then(Value::as_u64),
            Some(3)
        );
        assert_eq!(
            second.get(CountStage::STATE_KEY).and_then(Value::as_u64),
            Some(1)
        );
    }

    #[test]
    fn test_fingerprint() {
        // sha256("") = e3b0c44298fc1c14...
        assert_eq!(FingerprintStage::fingerprint(b""), "e3b0c44298fc1c14");
        assert_eq!(FingerprintStage::fingerprint(b"abc"), "ba7816bf8f01cfea");
    }
}
