//! Client-side RPC core for a remote hypervisor-management daemon.
//!
//! One connection carries three kinds of traffic over a single
//! length-framed byte stream: synchronous call/reply pairs issued by many
//! tasks, asynchronous events pushed by the server, and long-lived data
//! streams. There is no dedicated I/O task; whichever caller is first in
//! line dispatches for everyone and hands the socket on when its own reply
//! arrives.
//!
//! ```no_run
//! use virtlink::Connection;
//!
//! # async fn demo() -> virtlink::Result<()> {
//! let conn = Connection::open("qemu+tls://virt-host/system").await?;
//! let (major, minor, micro) = conn.version().await?;
//! println!("daemon {major}.{minor}.{micro}");
//! let domains = conn.list_domains(1024).await?;
//! println!("{} domains running", domains.len());
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
pub mod connection;
pub mod error;
pub mod events;
pub mod proto;
pub mod sasl;
pub mod stream;
mod tls;
pub mod transport;
pub mod uri;
pub mod wire;
pub mod xdr;

pub use connection::{ConnectConfig, Connection};
pub use error::{Error, Result};
pub use events::{CallbackId, DomainEvent};
pub use proto::{DomainRef, VolumeRef, WireError};
pub use sasl::{
    CredentialKind, CredentialPrompt, CredentialProvider, SecurityLayer, StaticCredentials,
};
pub use stream::{
    RemoteStream, STREAM_EVENT_ERROR, STREAM_EVENT_HANGUP, STREAM_EVENT_READABLE,
    STREAM_EVENT_WRITABLE,
};
pub use transport::Transport;
pub use uri::{RemoteUri, TransportKind};
