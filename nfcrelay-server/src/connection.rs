//! Per-connection state.

use crate::pipeline::PluginState;
use crate::registry::{ClientId, Member, SessionRegistry};
use bytes::Bytes;
use nfcrelay_protocol::SessionId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a dropped connection's writer may keep draining queued frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected client.
///
/// Outbound frames are queued to a writer task that owns the write half of
/// the transport. Dropping the connection removes it from its session,
/// whatever path led to the drop. The writer then flushes what is already
/// queued and closes the transport, or is aborted after [`DRAIN_TIMEOUT`].
pub struct Connection {
    member: Member,
    registry: Arc<SessionRegistry>,
    current_session: Option<SessionId>,
    plugin_state: PluginState,
    writer: Option<JoinHandle<()>>,
    connected_at: Instant,
}

impl Connection {
    /// Creates a connection and starts its writer task.
    pub fn open<W>(
        remote_addr: SocketAddr,
        writer: W,
        registry: Arc<SessionRegistry>,
        outbound_queue: usize,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(outbound_queue.max(1));
        Self {
            member: Member::new(ClientId::new(), remote_addr, tx),
            registry,
            current_session: None,
            plugin_state: PluginState::new(),
            writer: Some(tokio::spawn(write_loop(writer, rx, remote_addr))),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.member.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.member.remote_addr
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.current_session
    }

    pub fn plugin_state(&self) -> &PluginState {
        &self.plugin_state
    }

    pub fn plugin_state_mut(&mut self) -> &mut PluginState {
        &mut self.plugin_state
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Moves the connection to `session`, leaving the previous one first.
    ///
    /// Returns whether the association changed.
    pub fn associate(&mut self, session: SessionId) -> bool {
        if self.current_session == Some(session) {
            return false;
        }
        self.registry.leave(self.current_session, self.member.id);
        self.current_session = Some(session);
        self.registry.join(self.current_session, &self.member);
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.leave(self.current_session.take(), self.member.id);

        // The writer sees the queue close once `member` is dropped.
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let addr = self.member.remote_addr;
                runtime.spawn(async move {
                    if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                        tracing::debug!("[{}] Outbound drain timed out", addr);
                        writer.abort();
                    }
                });
            }
            Err(_) => writer.abort(),
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, addr: SocketAddr)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frames) = rx.recv().await {
        let result = async {
            writer.write_all(&frames).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!("[{}] Write error: {}", addr, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
