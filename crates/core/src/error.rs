use std::fmt;
use std::str::FromStr;

use plexus_transport::TransportError;
use thiserror::Error;

/// Result alias used throughout plexus.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure of a call, stream, publish or handler.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Dialing the remote failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// Operation on a closed or closing socket or listener.
    #[error("closed: {0}")]
    Closed(String),

    /// A deadline, dial timeout or drain timeout elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The call's context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Nothing to route to, or the requested item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A handler failed or panicked.
    #[error("internal server error: {0}")]
    InternalServer(String),

    /// The server is draining and refused the request.
    #[error("server stopping")]
    ServerStopping,

    /// A listener could not be bound.
    #[error("bind error: {0}")]
    Bind(String),

    /// Encoding or decoding a body failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The request was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The discovery backend failed.
    #[error("discovery error: {0}")]
    Discovery(String),
}

/// Discriminant of [`Error`], as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Connect`].
    Connect,
    /// See [`Error::Closed`].
    Closed,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::InternalServer`].
    InternalServer,
    /// See [`Error::ServerStopping`].
    ServerStopping,
    /// See [`Error::Bind`].
    Bind,
    /// See [`Error::Codec`].
    Codec,
    /// See [`Error::BadRequest`].
    BadRequest,
    /// See [`Error::Discovery`].
    Discovery,
}

impl ErrorKind {
    /// Wire spelling of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Closed => "closed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::InternalServer => "internal_server",
            Self::ServerStopping => "server_stopping",
            Self::Bind => "bind",
            Self::Codec => "codec",
            Self::BadRequest => "bad_request",
            Self::Discovery => "discovery",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "connect" => Self::Connect,
            "closed" => Self::Closed,
            "timeout" => Self::Timeout,
            "cancelled" => Self::Cancelled,
            "not_found" => Self::NotFound,
            "internal_server" => Self::InternalServer,
            "server_stopping" => Self::ServerStopping,
            "bind" => Self::Bind,
            "codec" => Self::Codec,
            "bad_request" => Self::BadRequest,
            "discovery" => Self::Discovery,
            other => return Err(Error::Codec(format!("unknown error kind {other}"))),
        })
    }
}

impl Error {
    /// The kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) => ErrorKind::Connect,
            Self::Closed(_) => ErrorKind::Closed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InternalServer(_) => ErrorKind::InternalServer,
            Self::ServerStopping => ErrorKind::ServerStopping,
            Self::Bind(_) => ErrorKind::Bind,
            Self::Codec(_) => ErrorKind::Codec,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Discovery(_) => ErrorKind::Discovery,
        }
    }

    /// The detail message, without the kind prefix.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::Connect(m)
            | Self::Closed(m)
            | Self::Timeout(m)
            | Self::NotFound(m)
            | Self::InternalServer(m)
            | Self::Bind(m)
            | Self::Codec(m)
            | Self::BadRequest(m)
            | Self::Discovery(m) => m,
            Self::Cancelled | Self::ServerStopping => "",
        }
    }

    /// Rebuilds an error from its wire kind and detail.
    #[must_use]
    pub fn from_wire(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::Connect => Self::Connect(detail),
            ErrorKind::Closed => Self::Closed(detail),
            ErrorKind::Timeout => Self::Timeout(detail),
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::NotFound => Self::NotFound(detail),
            ErrorKind::InternalServer => Self::InternalServer(detail),
            ErrorKind::ServerStopping => Self::ServerStopping,
            ErrorKind::Bind => Self::Bind(detail),
            ErrorKind::Codec => Self::Codec(detail),
            ErrorKind::BadRequest => Self::BadRequest(detail),
            ErrorKind::Discovery => Self::Discovery(detail),
        }
    }

    /// Whether the failure happened before or during the exchange on a
    /// socket, as opposed to being reported by the remote handler.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connect | ErrorKind::Timeout | ErrorKind::Closed
        )
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect { .. } => Self::Connect(err.to_string()),
            TransportError::Bind { .. } => Self::Bind(err.to_string()),
            TransportError::Timeout(reason) => Self::Timeout(reason),
            TransportError::Closed => Self::Closed("socket closed".to_string()),
            TransportError::InvalidMessage(_) | TransportError::Io(_) => {
                Self::Closed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_wire_spelling() {
        let err = Error::BadRequest("missing field".to_string());

        let kind: ErrorKind = err.kind().as_str().parse().unwrap();
        let rebuilt = Error::from_wire(kind, err.detail());

        assert_eq!(rebuilt, err);
        assert_eq!(
            Error::from_wire(ErrorKind::ServerStopping, "ignored"),
            Error::ServerStopping
        );
    }

    #[test]
    fn test_unknown_kind_is_codec_error() {
        assert!(matches!(
            "teapot".parse::<ErrorKind>(),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_transport_errors_map_into_taxonomy() {
        let connect: Error = TransportError::connect("svc", "refused").into();
        let invalid: Error = TransportError::invalid_message("bad frame").into();
        let timeout: Error = TransportError::Timeout("dial svc".to_string()).into();

        assert_eq!(connect.kind(), ErrorKind::Connect);
        assert_eq!(invalid.kind(), ErrorKind::Closed);
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(connect.is_transient());
        assert!(!Error::NotFound("svc".to_string()).is_transient());
    }
}
