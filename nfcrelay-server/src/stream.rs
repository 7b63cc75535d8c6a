//! Transport for accepted connections: plain TCP or server-side TLS.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

pin_project! {
    /// An accepted client transport.
    #[project = RelayStreamProj]
    pub enum RelayStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl RelayStream {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, RelayStream::Tls { .. })
    }

    /// Returns whether the peer presented a certificate chain during the
    /// handshake (always false for plain TCP).
    pub fn has_peer_certificate(&self) -> bool {
        match self {
            RelayStream::Plain { .. } => false,
            RelayStream::Tls { stream } => stream
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|chain| !chain.is_empty()),
        }
    }

    /// Short transport description for connection diagnostics.
    pub fn describe(&self) -> &'static str {
        match (self.is_tls(), self.has_peer_certificate()) {
            (false, _) => "plain",
            (true, false) => "TLS",
            (true, true) => "mTLS",
        }
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            RelayStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            RelayStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            RelayStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            RelayStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            RelayStreamProj::Plain { stream } => stream.poll_flush(cx),
            RelayStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            RelayStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            RelayStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
