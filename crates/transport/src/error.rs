use thiserror::Error;

/// Errors produced by transports, listeners and sockets.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// Dialing the remote address failed (unreachable, refused, or no listener).
    #[error("connect to {address} failed: {reason}")]
    Connect {
        /// The address that was dialed.
        address: String,
        /// Why the dial failed.
        reason: String,
    },

    /// Binding a listener failed.
    #[error("bind to {address} failed: {reason}")]
    Bind {
        /// The address that was requested.
        address: String,
        /// Why the bind failed.
        reason: String,
    },

    /// The socket or listener is closed.
    #[error("closed")]
    Closed,

    /// The operation did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A frame could not be decoded or exceeded the size limit.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Shorthand for [`TransportError::Connect`].
    pub fn connect(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`TransportError::Bind`].
    pub fn bind(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`TransportError::InvalidMessage`].
    pub fn invalid_message(reason: impl ToString) -> Self {
        Self::InvalidMessage(reason.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => Self::Closed,
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}
