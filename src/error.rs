use std::io;
use std::sync::Arc;

use crate::frame::{Reason, StreamId};

/// Errors surfaced to callers and used to resolve in-flight streams.
///
/// The taxonomy matters more than the payloads: connection-scoped errors
/// fail every live stream with the same cause, stream-scoped errors fail
/// one stream and leave the connection usable, and
/// [`is_retryable`](Error::is_retryable) marks failures that are safe to
/// replay on a different connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A connection-level protocol error. The connection is dead.
    #[error("connection protocol error: {0}")]
    Connection(Reason),

    /// A stream-level error; only the affected stream is torn down.
    #[error("stream error: {0}")]
    Stream(Reason),

    /// The exchange was canceled locally, by deadline or by explicit
    /// cancellation. An RST_STREAM(CANCEL) was emitted for the stream.
    #[error("request canceled")]
    Canceled,

    /// The peer sent GOAWAY before this stream was processed. Safe to
    /// retry on another connection.
    #[error("connection is going away; request was not processed")]
    GoAway {
        last_stream_id: StreamId,
        reason: Reason,
    },

    /// This connection has allocated all odd stream identifiers. Safe to
    /// retry on a fresh connection.
    #[error("stream identifier space exhausted")]
    StreamIdExhausted,

    /// The underlying byte-stream failed. Connection-fatal.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// The application-supplied request body reader failed. The stream is
    /// reset; the connection survives.
    #[error("request body error: {0}")]
    Body(Arc<io::Error>),

    /// A keepalive PING went unanswered. Connection-fatal.
    #[error("keepalive ping timed out")]
    KeepaliveTimeout,

    /// The connection was closed locally.
    #[error("connection closed locally")]
    Closed,

    /// The request could not be mapped onto HTTP/2 semantics.
    #[error("malformed request: {0}")]
    InvalidRequest(&'static str),

    /// The peer's response violated HTTP semantics (for example a missing
    /// or malformed `:status`).
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
}

impl Error {
    pub(crate) fn from_io(err: io::Error) -> Error {
        Error::Io(Arc::new(err))
    }

    pub(crate) fn from_body_io(err: io::Error) -> Error {
        Error::Body(Arc::new(err))
    }

    /// The error code associated with this error, if any.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Error::Connection(reason) | Error::Stream(reason) => Some(*reason),
            Error::GoAway { reason, .. } => Some(*reason),
            Error::Canceled => Some(Reason::CANCEL),
            _ => None,
        }
    }

    /// Whether the request is known not to have been processed by the
    /// server, making it safe to retry elsewhere. The engine itself never
    /// retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::GoAway { .. } | Error::StreamIdExhausted)
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(..))
    }

    pub fn get_io(&self) -> Option<&io::Error> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Reason> for Error {
    fn from(src: Reason) -> Error {
        Error::Connection(src)
    }
}

impl From<Error> for io::Error {
    fn from(src: Error) -> io::Error {
        match src {
            Error::Io(e) => io::Error::new(e.kind(), e.to_string()),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
