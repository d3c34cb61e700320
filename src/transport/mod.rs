//! Byte transports the connection can run over.
//!
//! Every variant yields the same thing: a bidirectional, non-blocking byte
//! pipe. The dispatcher never cares which one it got; only connection setup
//! and the `is_secure` policy bit differ.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::client::TlsStream;

use crate::error::Result;
use crate::uri::{RemoteUri, TransportKind};

pub mod external;
pub mod tcp;
pub mod unix;

pub use external::{ExternalProcess, StderrTail};

/// Registered port for TLS-wrapped connections.
pub const TLS_PORT: u16 = 16514;
/// Registered port for cleartext TCP connections.
pub const TCP_PORT: u16 = 16509;

/// Options influencing how a transport is established.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Connect to the read-only system socket.
    pub read_only: bool,
    /// Use the per-user session socket instead of the system one.
    pub user_session: bool,
    /// Spawn the local daemon when the session socket refuses.
    pub autostart: bool,
}

/// A connected byte pipe to the daemon.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
    External(ExternalProcess),
}

impl Transport {
    /// Establish the transport selected by the URI.
    pub async fn connect(uri: &RemoteUri, opts: &DialOptions) -> Result<Transport> {
        match uri.transport {
            TransportKind::Tcp => {
                let stream =
                    tcp::connect(uri.hostname(), uri.port.unwrap_or(TCP_PORT)).await?;
                Ok(Transport::Tcp(stream))
            }
            TransportKind::Tls => {
                let stream =
                    tcp::connect(uri.hostname(), uri.port.unwrap_or(TLS_PORT)).await?;
                let tls = crate::tls::handshake(
                    stream,
                    uri.hostname(),
                    uri.params.pkipath.as_deref(),
                    uri.params.no_verify,
                )
                .await?;
                Ok(Transport::Tls(Box::new(tls)))
            }
            TransportKind::Unix => {
                let path = unix::socket_path(uri.params.socket.as_deref(), opts)?;
                let stream = unix::connect(&path, opts).await?;
                Ok(Transport::Unix(stream))
            }
            TransportKind::Ssh => {
                let proc = external::connect_ssh(uri, opts).await?;
                Ok(Transport::External(proc))
            }
            TransportKind::External => {
                let proc = external::connect_command(uri).await?;
                Ok(Transport::External(proc))
            }
        }
    }

    /// Whether bytes on this pipe are protected from snooping. External
    /// commands report false regardless of what they tunnel through.
    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Tls(_) | Transport::Unix(_))
    }

    /// Short label for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Transport::Tcp(_) => "tcp",
            Transport::Tls(_) => "tls",
            Transport::Unix(_) => "unix",
            Transport::External(_) => "external",
        }
    }

    /// Handle onto the child's collected stderr, when the transport owns a
    /// tunnel process. Cloned out before the transport is split so EOF
    /// errors can be enriched later.
    pub fn stderr_tail(&self) -> Option<StderrTail> {
        match self {
            Transport::External(proc) => Some(proc.stderr_tail()),
            _ => None,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Transport::External(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, data),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            Transport::Unix(s) => Pin::new(s).poll_write(cx, data),
            Transport::External(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
            Transport::External(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Transport::External(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind_name())
            .field("secure", &self.is_secure())
            .finish()
    }
}
