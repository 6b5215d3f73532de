//! Error types for the pipeline engine.
//!
//! Contract violations (sending on a closed stream, closing a stream twice)
//! are not represented here: they panic at the call site.

use std::fmt;
use std::sync::Arc;

/// The main error type for the pipeline engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The owning scope was cancelled
    #[error("scope was cancelled")]
    Cancelled,

    /// The owning scope's deadline elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A stage transform failed on an item
    #[error("transform failed: {0}")]
    Transform(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A generator's producer function failed
    #[error("producer failed: {0}")]
    Producer(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// Every receiver of a stream was dropped
    #[error("all receivers were dropped")]
    Disconnected,

    /// A task spawned into a scope panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a transform error from any error type
    pub fn transform<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Transform(Arc::new(error))
    }

    /// Create a producer error from any error type
    pub fn producer<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Producer(Arc::new(error))
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Whether this error is a cancellation sentinel rather than a business error.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// Error returned by [`Sender::send`](crate::stream::Sender::send).
///
/// The rejected value is handed back to the caller.
pub enum SendError<T> {
    /// The stream's scope was cancelled while the send was pending
    Cancelled(T),
    /// Every receiver is gone; the value can never be delivered
    Disconnected(T),
}

impl<T> SendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Cancelled(v) | SendError::Disconnected(v) => v,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Cancelled(_) => f.write_str("Cancelled(..)"),
            SendError::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Cancelled(_) => write!(f, "send cancelled"),
            SendError::Disconnected(_) => write!(f, "send on a stream with no receivers"),
        }
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Error returned by [`Sender::try_send`](crate::stream::Sender::try_send).
pub enum TrySendError<T> {
    /// No buffer slot (or waiting receiver) is available right now
    Full(T),
    /// The stream's scope is cancelled
    Cancelled(T),
    /// Every receiver is gone
    Disconnected(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Cancelled(v) | TrySendError::Disconnected(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Cancelled(_) => f.write_str("Cancelled(..)"),
            TrySendError::Disconnected(_) => f.write_str("Disconnected(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "stream is full"),
            TrySendError::Cancelled(_) => write!(f, "send cancelled"),
            TrySendError::Disconnected(_) => write!(f, "send on a stream with no receivers"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Error returned by [`Receiver::try_recv`](crate::stream::Receiver::try_recv).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// No value is buffered and the stream is still open
    #[error("stream is empty")]
    Empty,
    /// The stream's scope is cancelled
    #[error("receive cancelled")]
    Cancelled,
}

// Common conversions
impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        match err {
            SendError::Cancelled(_) => Error::Cancelled,
            SendError::Disconnected(_) => Error::Disconnected,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Panicked(err.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting foreign errors into our Error type
pub trait IntoError<T> {
    fn into_transform_error(self) -> Result<T>;
    fn into_producer_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transform_error(self) -> Result<T> {
        self.map_err(Error::transform)
    }

    fn into_producer_error(self) -> Result<T> {
        self.map_err(Error::producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("bad input {0}")]
    struct BadInput(u32);

    #[test]
    fn test_transform_error_keeps_source() {
        let err: Result<()> = Err(BadInput(7)).into_transform_error();
        let err = err.unwrap_err();
        assert_eq!(err.to_string(), "transform failed: bad input 7");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "bad input 7");
    }

    #[test]
    fn test_cancellation_predicate() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::DeadlineExceeded.is_cancellation());
        assert!(!Error::custom("boom").is_cancellation());
        assert!(!Error::Disconnected.is_cancellation());
    }

    #[test]
    fn test_send_error_returns_value() {
        let err = SendError::Cancelled(42);
        assert_eq!(err.to_string(), "send cancelled");
        assert_eq!(err.into_inner(), 42);

        let err: Error = SendError::Disconnected("x").into();
        assert!(matches!(err, Error::Disconnected));
    }
}
