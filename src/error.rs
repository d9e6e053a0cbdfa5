//! Error kinds for the synchronization engine (spec §7).
//!
//! Each layer classifies its own failures and wraps them with context as they
//! propagate, the way the teacher's modules build `anyhow::Result` chains
//! with `.context(...)` at each call site -- except here the leaf types are
//! concrete `thiserror` enums so the pipeline can pattern-match on
//! recoverability instead of string-matching an error message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {0}")]
    Connect(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// All transport errors are recoverable (eligible for reconnection)
    /// except cancellation, which propagates immediately (spec §7).
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected bytes in response: {0}")]
    UnexpectedBytes(String),
    #[error("malformed literal: {0}")]
    MalformedLiteral(String),
    #[error("unknown response: {0}")]
    UnknownResponse(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("server rejected authentication: {0}")]
    Rejected(String),
    #[error("required SASL capability missing: {0}")]
    CapabilityMissing(String),
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),
    #[error("server closed the connection during greeting: {0}")]
    Bye(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    #[error("NO {0}")]
    No(String),
    #[error("BAD {0}")]
    Bad(String),
}

impl ServerStatus {
    pub fn text(&self) -> &str {
        match self {
            Self::No(s) | Self::Bad(s) => s,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors a client session operation can fail with. The pipeline inspects
/// `is_recoverable` to decide whether to attempt a reconnect (spec §4.3).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("server status: {0}")]
    Server(#[from] ServerStatus),
    #[error("operation cancelled")]
    Cancelled,
}

impl SessionError {
    /// Whether this error is eligible for the reconnect-and-retry-once
    /// policy in spec §4.3: transport IO, not-connected, and timeouts.
    /// Authentication failures and non-throttle `NO`/`BAD` are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(t) => t.recoverable(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(TransportError::Io(e))
    }
}
