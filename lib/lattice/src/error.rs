use std::fmt;
use std::io;
use std::result;
use std::sync::Arc;

pub type Result<T> = result::Result<T, Error>;

/// Failure taxonomy for the whole client. Variants are kinds, not layers:
/// every component reports through this one enum so callers can match on the
/// kind without knowing which subsystem produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed frame, unknown type or channel, duplicate request id.
    /// Fatal at connection scope.
    Protocol(String),
    /// The channel left the open state while the operation was pending.
    ChannelClosed(Option<Arc<Error>>),
    /// The connection left the open state while the operation was pending.
    ConnectionClosed(Option<Arc<Error>>),
    /// A deadline elapsed. The core never re-issues timed-out work.
    Timeout,
    /// The peer rejected the identity token during the open handshake.
    AuthFailed(String),
    /// The operation is not valid for this implementation.
    Unsupported(&'static str),
    /// The service is not yet accepting clients.
    NotReady,
    /// Transport failure, fatal at connection scope.
    Io(io::ErrorKind),
    /// Value could not be encoded or decoded by the serializer.
    Serialization(String),
    /// Invalid or unparsable configuration.
    Config(String),
    /// The service thread failed to start; carries the recorded cause.
    ServiceFailed(Arc<Error>),
}

impl Error {
    #[inline]
    pub fn protocol<S: Into<String>>(detail: S) -> Error {
        Error::Protocol(detail.into())
    }

    #[inline]
    pub fn channel_closed(cause: Option<Error>) -> Error {
        Error::ChannelClosed(cause.map(Arc::new))
    }

    #[inline]
    pub fn connection_closed(cause: Option<Error>) -> Error {
        Error::ConnectionClosed(cause.map(Arc::new))
    }

    /// Short tag for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "protocol",
            Error::ChannelClosed(_) => "channel_closed",
            Error::ConnectionClosed(_) => "connection_closed",
            Error::Timeout => "timeout",
            Error::AuthFailed(_) => "auth_failed",
            Error::Unsupported(_) => "unsupported",
            Error::NotReady => "not_ready",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::ServiceFailed(_) => "service_failed",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Protocol(detail) => write!(f, "protocol error: {}", detail),
            Error::ChannelClosed(Some(cause)) => write!(f, "channel closed: {}", cause),
            Error::ChannelClosed(None) => write!(f, "channel closed"),
            Error::ConnectionClosed(Some(cause)) => write!(f, "connection closed: {}", cause),
            Error::ConnectionClosed(None) => write!(f, "connection closed"),
            Error::Timeout => write!(f, "request timed out"),
            Error::AuthFailed(detail) => write!(f, "authentication failed: {}", detail),
            Error::Unsupported(op) => write!(f, "operation not supported: {}", op),
            Error::NotReady => write!(f, "service is not accepting clients"),
            Error::Io(kind) => write!(f, "i/o failure: {:?}", kind),
            Error::Serialization(detail) => write!(f, "serialization error: {}", detail),
            Error::Config(detail) => write!(f, "configuration error: {}", detail),
            Error::ServiceFailed(cause) => write!(f, "service start failed: {}", cause),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Error {
        Error::Io(err.kind())
    }
}
