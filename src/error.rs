use thiserror::Error;

use crate::proto::WireError;

/// Errors surfaced by the RPC core.
///
/// `Remote` and `Stream` are scoped to a single operation. Every other kind
/// is fatal to the connection that produced it: the dispatcher fails all
/// in-flight calls with a clone of the error and later calls keep returning
/// the same kind.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection to {endpoint} failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("packet too large: {len} bytes (max {max})")]
    PacketTooLarge { len: usize, max: usize },

    #[error("packet too small: {len} bytes")]
    PacketTooSmall { len: usize },

    #[error("remote error: {0}")]
    Remote(WireError),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("resource error: {0}")]
    Resource(String),

    /// The server predates the requested procedure. Produced by translating
    /// an "unknown procedure" remote error; callers probing optional RPCs
    /// match on this instead of parsing message text.
    #[error("operation not supported by server: {0}")]
    NotSupported(String),
}

impl Error {
    /// Whether this error poisons the whole connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Remote(_) | Error::Stream(_) | Error::NotSupported(_)
        )
    }

    pub(crate) fn io(context: &str, err: &std::io::Error) -> Self {
        Error::Transport(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
