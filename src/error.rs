//! Error types for every layer of the handle.
//!
//! Each layer reports its own enum; [`Error`] composes them so that every
//! public operation can return a single [`Result`].

use thiserror::Error;

/// Failure to establish a connection to the broker.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The endpoint was well formed but nothing answered on it.
    #[error("broker unreachable at {uri}: {reason}")]
    Unreachable { uri: String, reason: String },

    /// The endpoint string could not be parsed.
    #[error("invalid broker uri {0:?}")]
    InvalidUri(String),
}

/// Failure to put a message on the wire.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to encode message: {0}")]
    EncodeFailure(String),
}

#[derive(Debug, Error)]
pub enum ReactorError {
    /// The reactor is already nested as deep as the handle allows.
    #[error("reactor already running at depth {depth}")]
    AlreadyRunning { depth: usize },
}

/// Failure completing a [`Future`](crate::Future).
///
/// Cloneable because a completed future hands the same outcome to every
/// `wait` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FutureError {
    /// `wait` gave up before a response arrived. The future is still pending.
    #[error("timed out waiting for response")]
    Timeout,

    /// The connection failed while the request was outstanding.
    #[error("connection lost while request was outstanding")]
    ConnectionLost,

    /// The broker answered with an error response.
    #[error("broker error {errnum}: {message}")]
    Broker { errnum: u32, message: String },
}

impl FutureError {
    /// True when a streaming response ended normally (errnum `ENODATA`).
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, FutureError::Broker { errnum, .. } if *errnum == libc::ENODATA as u32)
    }
}

#[derive(Debug, Error)]
pub enum WatcherError {
    /// `start` was called on a watcher that is already started.
    #[error("watcher {0} is already registered")]
    DuplicateRegistration(u64),

    /// The watcher (or the handle owning it) no longer exists.
    #[error("watcher {0} has been destroyed")]
    Destroyed(u64),
}

/// Main error type for all handle operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Future(#[from] FutureError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    /// `close` was called on a handle whose connection is already closed.
    #[error("handle is already closed")]
    DoubleClose,

    /// Attribute (or service) lookup found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A service with this name is pending or active on the handle.
    #[error("service {0:?} is already registered")]
    ServiceExists(String),

    /// Topic glob could not be compiled.
    #[error("invalid topic pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Malformed frame or message received from the broker.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error from the poller, signal pipe or socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure raised by a user callback.
    #[error("callback failed: {0}")]
    Callback(String),
}

impl Error {
    /// Builds the error a callback returns to make `run_reactor` fail.
    pub fn callback(message: impl Into<String>) -> Self {
        Error::Callback(message.into())
    }

    /// True if this is a future timeout, after which `wait` may be retried.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Future(FutureError::Timeout))
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
