//! Per-connection relay loop.

use crate::connection::Connection;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::pipeline::{Diagnostics, Pipeline};
use crate::registry::SessionRegistry;
use nfcrelay_protocol::{Decoder, InboundFrame, MAX_PAYLOAD_SIZE};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;

const READ_BUF_SIZE: usize = 8192;

/// Default idle-read timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of queued outbound units per connection.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Why a connection ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The peer closed the connection between frames.
    PeerClosed,
    /// No data arrived within the idle timeout.
    IdleTimeout,
    /// A frame announced a zero-length payload.
    EmptyFrame,
    /// The first frame named session 0.
    NoSession,
    /// The server is shutting down.
    Shutdown,
}

impl Termination {
    /// Short label used for the terminations metric.
    pub fn label(&self) -> &'static str {
        match self {
            Termination::PeerClosed => "peer_closed",
            Termination::IdleTimeout => "idle_timeout",
            Termination::EmptyFrame => "empty_frame",
            Termination::NoSession => "no_session",
            Termination::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Termination::PeerClosed => "closed by peer",
            Termination::IdleTimeout => "idle timeout",
            Termination::EmptyFrame => "empty frame",
            Termination::NoSession => "no session",
            Termination::Shutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

/// Drives one client connection: decode, associate, filter, broadcast.
pub struct ConnectionHandler {
    registry: Arc<SessionRegistry>,
    pipeline: Arc<Pipeline>,
    idle_timeout: Duration,
    max_payload: u32,
    outbound_queue: usize,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionHandler {
    pub fn new(registry: Arc<SessionRegistry>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            registry,
            pipeline,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_payload: MAX_PAYLOAD_SIZE,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            metrics: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_outbound_queue(mut self, outbound_queue: usize) -> Self {
        self.outbound_queue = outbound_queue;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Runs the relay loop until the connection terminates.
    ///
    /// Session membership is released on every exit path, including errors
    /// and cancellation of the returned future.
    pub async fn run<S>(
        &self,
        stream: S,
        remote_addr: SocketAddr,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Termination, ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let mut conn = Connection::open(
            remote_addr,
            writer,
            self.registry.clone(),
            self.outbound_queue,
        );
        let result = self.relay(&mut reader, &mut conn, shutdown).await;

        tracing::debug!(
            "[{}] Closing after {:.1?} (session {:?})",
            remote_addr,
            conn.uptime(),
            conn.current_session()
        );
        drop(conn);
        self.update_sessions_gauge();
        result
    }

    async fn relay<R>(
        &self,
        reader: &mut R,
        conn: &mut Connection,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Termination, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = Decoder::with_max_payload(self.max_payload);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            while let Some(frame) = decoder.decode_inbound()? {
                if let Some(termination) = self.deliver(conn, frame, shutdown).await {
                    return Ok(termination);
                }
            }

            let read = tokio::select! {
                result = tokio::time::timeout(self.idle_timeout, reader.read(&mut buf)) => result,
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", conn.remote_addr());
                    return Ok(Termination::Shutdown);
                }
            };

            match read {
                Err(_) => return Ok(Termination::IdleTimeout),
                Ok(Ok(0)) => {
                    decoder.finish_inbound()?;
                    return Ok(Termination::PeerClosed);
                }
                Ok(Ok(n)) => {
                    tracing::trace!("[{}] Received {} bytes", conn.remote_addr(), n);
                    decoder.extend(&buf[..n]);
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Handles one decoded frame. Returns a termination when the frame ends
    /// the connection.
    async fn deliver(
        &self,
        conn: &mut Connection,
        frame: InboundFrame,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<Termination> {
        if let Some(ref metrics) = self.metrics {
            metrics.frames_received_total.inc();
            metrics.bytes_received_total.inc_by(frame.payload.len() as f64);
        }

        if frame.is_empty() {
            return Some(Termination::EmptyFrame);
        }
        if conn.current_session().is_none() && frame.session.is_zero() {
            return Some(Termination::NoSession);
        }

        if conn.associate(frame.session) {
            self.update_sessions_gauge();
        }

        let addr = conn.remote_addr();
        let batch = self
            .pipeline
            .filter(addr, vec![frame.payload], conn.plugin_state_mut());
        let reached = tokio::select! {
            reached = self.registry.broadcast(conn.current_session(), conn.id(), &batch) => reached,
            _ = shutdown.recv() => {
                tracing::debug!("[{}] Shutdown signal received during broadcast", addr);
                return Some(Termination::Shutdown);
            }
        };

        if let Some(ref metrics) = self.metrics {
            metrics
                .frames_relayed_total
                .inc_by((reached * batch.len()) as f64);
        }
        let diagnostics = Diagnostics::new("server", addr);
        diagnostics.emit(format_args!("Publish reached {} clients", reached));
        None
    }

    fn update_sessions_gauge(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .sessions_active
                .set(self.registry.session_count() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PluginState, Stage, StageCatalog, Transformed};
    use crate::registry::{create_registry, ClientId, Member};
    use bytes::Bytes;
    use nfcrelay_protocol::{Encoder, ProtocolError, SessionId};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    fn addr() -> SocketAddr {
        "127.0.0.1:40002".parse().unwrap()
    }

    struct Running {
        client: DuplexStream,
        task: JoinHandle<Result<Termination, ServerError>>,
        shutdown: broadcast::Sender<()>,
    }

    fn spawn(handler: ConnectionHandler) -> Running {
        let (client, server) = tokio::io::duplex(1024);
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            handler.run(server, addr(), &mut shutdown_rx).await
        });
        Running {
            client,
            task,
            shutdown,
        }
    }

    fn handler(registry: &Arc<SessionRegistry>) -> ConnectionHandler {
        ConnectionHandler::new(registry.clone(), Arc::new(Pipeline::new()))
    }

    /// Joins a passive member and returns its decoded-frame receiver.
    fn peer(registry: &SessionRegistry, session: u8) -> (ClientId, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let member = Member::new(ClientId::new(), "127.0.0.1:50000".parse().unwrap(), tx);
        registry.join(Some(SessionId(session)), &member);
        (member.id, rx)
    }

    async fn send(client: &mut DuplexStream, session: u8, payload: &[u8]) {
        let frame = Encoder::encode_inbound(SessionId(session), payload).unwrap();
        client.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_frame_session_zero_terminates() {
        let registry = create_registry();
        let (_, mut rx) = peer(&registry, 0);
        let mut running = spawn(handler(&registry));

        send(&mut running.client, 0, b"hello").await;

        assert_eq!(running.task.await.unwrap().unwrap(), Termination::NoSession);
        assert_eq!(registry.members(SessionId(0)).len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_frame_terminates() {
        let registry = create_registry();
        let mut running = spawn(handler(&registry));

        running.client.write_all(b"\x00\x00\x00\x00\x07").await.unwrap();

        assert_eq!(running.task.await.unwrap().unwrap(), Termination::EmptyFrame);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_first_frame_joins_and_broadcasts() {
        let registry = create_registry();
        let (peer_id, mut rx) = peer(&registry, 7);
        let mut running = spawn(handler(&registry));

        send(&mut running.client, 7, b"abc").await;

        assert_eq!(&rx.recv().await.unwrap()[..], b"\x00\x00\x00\x03abc");
        let members = registry.members(SessionId(7));
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], peer_id);

        drop(running.client);
        assert_eq!(running.task.await.unwrap().unwrap(), Termination::PeerClosed);
        assert_eq!(registry.members(SessionId(7)), vec![peer_id]);
    }

    #[tokio::test]
    async fn test_reassociation_leaves_then_joins() {
        let registry = create_registry();
        let (seven, mut rx7) = peer(&registry, 7);
        let (_, mut rx9) = peer(&registry, 9);
        let (_, mut rx0) = peer(&registry, 0);
        let mut running = spawn(handler(&registry));

        send(&mut running.client, 7, b"first").await;
        assert_eq!(&rx7.recv().await.unwrap()[4..], b"first");

        send(&mut running.client, 9, b"second").await;
        assert_eq!(&rx9.recv().await.unwrap()[4..], b"second");
        assert_eq!(registry.members(SessionId(7)), vec![seven]);
        assert_eq!(registry.members(SessionId(9)).len(), 2);

        // Session 0 is a valid target once associated.
        send(&mut running.client, 0, b"third").await;
        assert_eq!(&rx0.recv().await.unwrap()[4..], b"third");
        assert_eq!(registry.members(SessionId(9)).len(), 1);
        assert_eq!(registry.members(SessionId(0)).len(), 2);

        assert!(rx7.try_recv().is_err());
        running.client.write_all(b"\x00\x00\x00\x00\x00").await.unwrap();
        assert_eq!(running.task.await.unwrap().unwrap(), Termination::EmptyFrame);
        assert_eq!(registry.members(SessionId(0)).len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let registry = create_registry();
        let (_, _rx) = peer(&registry, 5);
        let mut running = spawn(handler(&registry));

        send(&mut running.client, 5, b"ok").await;
        running.client.write_all(b"\x00\x00\x00\x0a\x05abc").await.unwrap();
        drop(running.client);

        match running.task.await.unwrap() {
            Err(ServerError::Protocol(e)) => assert!(e.is_truncation()),
            other => panic!("expected truncation, got {:?}", other),
        }
        assert_eq!(registry.members(SessionId(5)).len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_error() {
        let registry = create_registry();
        let mut running = spawn(handler(&registry).with_max_payload(4));

        send(&mut running.client, 1, b"toolong").await;

        match running.task.await.unwrap() {
            Err(ServerError::Protocol(ProtocolError::FrameTooLarge { size, max })) => {
                assert_eq!((size, max), (7, 4));
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let registry = create_registry();
        let mut running =
            spawn(handler(&registry).with_idle_timeout(Duration::from_millis(50)));

        send(&mut running.client, 3, b"hi").await;

        assert_eq!(running.task.await.unwrap().unwrap(), Termination::IdleTimeout);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let registry = create_registry();
        let (_, mut rx) = peer(&registry, 2);
        let mut running = spawn(handler(&registry));

        send(&mut running.client, 2, b"x").await;
        rx.recv().await.unwrap();
        running.shutdown.send(()).unwrap();

        assert_eq!(running.task.await.unwrap().unwrap(), Termination::Shutdown);
        assert_eq!(registry.members(SessionId(2)).len(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_runs_before_broadcast() {
        let registry = create_registry();
        let (_, mut rx) = peer(&registry, 4);
        let pipeline = StageCatalog::with_builtins()
            .build(&["log", "count"])
            .unwrap();
        let handler = ConnectionHandler::new(registry.clone(), Arc::new(pipeline));
        let mut running = spawn(handler);

        send(&mut running.client, 4, b"\x60\x00").await;
        assert_eq!(&rx.recv().await.unwrap()[..], b"\x00\x00\x00\x02\x60\x00");
    }

    /// Emits a trailer frame after every payload.
    struct Trailer;

    impl Stage for Trailer {
        fn transform(
            &self,
            _diagnostics: &Diagnostics<'_>,
            payload: Bytes,
            _state: &mut PluginState,
        ) -> Transformed {
            Transformed::Many(vec![payload, Bytes::from_static(b"end")])
        }
    }

    #[tokio::test]
    async fn test_expanded_batch_arrives_as_one_unit() {
        let registry = create_registry();
        let (_, mut rx) = peer(&registry, 8);
        let pipeline = Pipeline::new().with_stage("trailer", Arc::new(Trailer));
        let handler = ConnectionHandler::new(registry.clone(), Arc::new(pipeline));
        let mut running = spawn(handler);

        send(&mut running.client, 8, b"ab").await;
        assert_eq!(
            &rx.recv().await.unwrap()[..],
            b"\x00\x00\x00\x02ab\x00\x00\x00\x03end"
        );
    }

    struct Panics;

    impl Stage for Panics {
        fn transform(
            &self,
            _diagnostics: &Diagnostics<'_>,
            _payload: Bytes,
            _state: &mut PluginState,
        ) -> Transformed {
            panic!("stage failure");
        }
    }

    #[tokio::test]
    async fn test_panicking_stage_still_leaves() {
        let registry = create_registry();
        let (_, _rx) = peer(&registry, 6);
        let pipeline = Pipeline::new().with_stage("panics", Arc::new(Panics));
        let handler = ConnectionHandler::new(registry.clone(), Arc::new(pipeline));
        let mut running = spawn(handler);

        send(&mut running.client, 6, b"boom").await;

        assert!(running.task.await.unwrap_err().is_panic());
        assert_eq!(registry.members(SessionId(6)).len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_updated() {
        let registry = create_registry();
        let metrics = Arc::new(Metrics::new().unwrap());
        let (_, mut rx) = peer(&registry, 1);
        let mut running = spawn(handler(&registry).with_metrics(metrics.clone()));

        send(&mut running.client, 1, b"abc").await;
        rx.recv().await.unwrap();
        drop(running.client);
        running.task.await.unwrap().unwrap();

        assert_eq!(metrics.frames_received_total.get(), 1.0);
        assert_eq!(metrics.bytes_received_total.get(), 3.0);
        assert_eq!(metrics.frames_relayed_total.get(), 1.0);
        assert_eq!(metrics.sessions_active.get(), 1.0);
    }

    #[tokio::test]
    async fn test_mock_stream_lone_sender() {
        let registry = create_registry();
        let mock = tokio_test::io::Builder::new()
            .read(b"\x00\x00\x00\x03\x07")
            .read(b"cat")
            .read(b"\x00\x00\x00\x00\x07")
            .build();
        let (_shutdown, mut shutdown_rx) = broadcast::channel(1);

        let termination = handler(&registry)
            .run(mock, addr(), &mut shutdown_rx)
            .await
            .unwrap();

        assert_eq!(termination, Termination::EmptyFrame);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_while_broadcast_stalled() {
        let registry = create_registry();
        let a = spawn(handler(&registry).with_outbound_queue(1));
        let b = spawn(handler(&registry).with_outbound_queue(1));

        // Both clients publish without ever reading, so each handler ends up
        // waiting on the other's full queue.
        let flood = |mut client: DuplexStream| {
            tokio::spawn(async move {
                let frame = Encoder::encode_inbound(SessionId(1), &[0x5a; 512]).unwrap();
                for _ in 0..500 {
                    if client.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                client
            })
        };
        let flood_a = flood(a.client);
        let flood_b = flood(b.client);

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.members(SessionId(1)).len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        a.shutdown.send(()).unwrap();
        b.shutdown.send(()).unwrap();
        for task in [a.task, b.task] {
            let termination = tokio::time::timeout(Duration::from_secs(3), task)
                .await
                .expect("handler ignored shutdown")
                .unwrap()
                .unwrap();
            assert_eq!(termination, Termination::Shutdown);
        }
        assert_eq!(registry.session_count(), 0);

        flood_a.abort();
        flood_b.abort();
    }

    #[test]
    fn test_termination_labels() {
        assert_eq!(Termination::PeerClosed.label(), "peer_closed");
        assert_eq!(Termination::NoSession.to_string(), "no session");
    }
}
