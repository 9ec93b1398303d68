//! Error types used throughout the crate.
//!
//! Built on `failure` so that a single `Error` can carry any `ErrorKind` while
//! still supporting `#[fail(cause)]` chains back to the broker transport.

use std::fmt;

use failure::{Backtrace, Context, Fail};

/// The kind of error that occurred.
///
/// This is deliberately flat rather than nested: the supervisory loop and the
/// dispatch path both need to pattern-match on it directly (`e.kind()`), and a
/// nested enum would just push that match one level deeper everywhere it's used.
#[derive(Debug, Fail)]
pub enum ErrorKind {
    /// The broker connection was lost or could not be established, and the
    /// configured retry budget was exhausted. Recoverable: triggers a restart.
    #[fail(display = "broker connection error: {}", _0)]
    ConnectionError(String),

    /// A broker channel-level error (as opposed to the whole connection).
    /// Recoverable: triggers a restart.
    #[fail(display = "broker channel error: {}", _0)]
    ChannelError(String),

    /// A message body could not be decoded with the configured codec.
    #[fail(display = "could not decode message body: {}", _0)]
    DecodeError(String),

    /// A message decoded fine but named a task that isn't registered.
    #[fail(display = "received unregistered task of type {}", _0)]
    UnknownTaskError(String),

    /// A message decoded fine but its structure doesn't match the task
    /// message protocol.
    #[fail(display = "received invalid task message: {}", _0)]
    InvalidTaskError(String),

    /// A message is not recognizable as a task message at all.
    #[fail(display = "received unknown message format")]
    UnknownMessageError,

    /// A task's `eta` could not be converted to an absolute timestamp.
    #[fail(display = "could not convert eta {} to timestamp", _0)]
    EtaOverflowError(String),

    /// `register_task` was called twice for the same task name.
    #[fail(display = "task {} already registered", _0)]
    TaskAlreadyExists(String),

    /// A task lookup failed because no task of that name was registered.
    #[fail(display = "no task registered with name {}", _0)]
    UnregisteredTaskError(String),

    /// A `RwLock`/`Mutex` guarding shared state was poisoned.
    #[fail(display = "a shared data structure lock was poisoned")]
    SyncError,

    /// The task asked to be retried; carries no message of its own, the
    /// tracer attaches the retry ETA separately.
    #[fail(display = "task requested a retry")]
    Retry,

    /// The consumer has no live connection to operate on (e.g. called between
    /// a restart's stop and start phases).
    #[fail(display = "consumer has no active broker connection")]
    NotConnected,

    /// A second shutdown signal arrived while already waiting on a warm
    /// shutdown; the caller should terminate immediately rather than drain.
    #[fail(display = "shutdown forced before pending tasks finished")]
    ForcedShutdown,

    /// Any I/O error not otherwise classified above.
    #[fail(display = "I/O error: {}", _0)]
    IoError(String),

    /// Catch-all for errors from `lapin`/`amq-protocol-types` that don't fit
    /// the categories above.
    #[fail(display = "protocol error: {}", _0)]
    ProtocolError(String),
}

/// The crate's error type. Wraps an [`ErrorKind`] with an attached backtrace,
/// matching the shape already assumed by `app::Celery` (`Error::from(ErrorKind::...)`).
#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    /// Get the specific [`ErrorKind`] this error carries.
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }

    /// True if this error is one the supervisory loop treats as a recoverable
    /// broker fault (§7: `connection_errors ∪ channel_errors`).
    pub fn is_broker_error(&self) -> bool {
        self.is_connection_error() || self.is_channel_error()
    }

    /// True if this is a `connection_errors`-class fault.
    pub fn is_connection_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConnectionError(_))
    }

    /// True if this is a `channel_errors`-class fault.
    pub fn is_channel_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::ChannelError(_))
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { inner: Context::new(kind) }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::from(ErrorKind::IoError(e.to_string()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::from(ErrorKind::DecodeError(e.to_string()))
    }
}

impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Error {
        Error::from(ErrorKind::ProtocolError(e.to_string()))
    }
}
