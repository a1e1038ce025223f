//! Error taxonomy for clamd client operations.

use std::io;
use std::time::Duration;

use crate::Endpoint;

/// Application-level result (config loading, CLI plumbing).
pub type Result<T> = eyre::Result<T>;

/// How an I/O failure on a daemon connection is treated by the retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Write side closed by the peer. Recoverable by reconnecting.
    BrokenPipe,
    /// Peer reset or aborted the connection. Recoverable by reconnecting.
    ConnectionReset,
    /// Anything else. Surfaced as-is.
    Other,
}

impl Failure {
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::BrokenPipe | Self::ConnectionReset)
    }
}

/// Classify an I/O error by kind, falling back to its message text for
/// errors whose kind is generic.
#[must_use]
pub fn classify(err: &io::Error) -> Failure {
    match err.kind() {
        io::ErrorKind::BrokenPipe => return Failure::BrokenPipe,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            return Failure::ConnectionReset;
        }
        _ => {}
    }

    let message = err.to_string().to_ascii_lowercase();
    if message.contains("broken pipe") {
        Failure::BrokenPipe
    } else if message.contains("connection reset") {
        Failure::ConnectionReset
    } else {
        Failure::Other
    }
}

/// Exhaustion and invariant violations reported by the connection pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no pooled connection became available within {0:?}")]
    Exhausted(Duration),
    #[error("wait for a pooled connection was interrupted")]
    Interrupted,
    #[error("pool item factory produced no item")]
    EmptyItem,
    #[error("pool already holds all {max_size} items (returned twice or never checked out)")]
    Overflow { max_size: usize },
    #[error("item was checked out from a different pool")]
    ForeignItem,
}

/// Every way a clamd command can fail.
#[derive(Debug, thiserror::Error)]
pub enum ClamdError {
    #[error("no connection available to {endpoint}")]
    ConnectionUnavailable {
        endpoint: Endpoint,
        #[source]
        source: PoolError,
    },

    #[error("broken pipe talking to daemon")]
    BrokenPipe(#[source] io::Error),

    #[error("connection reset by daemon")]
    ConnectionReset(#[source] io::Error),

    #[error("daemon I/O failed")]
    Io(#[source] io::Error),

    #[error("daemon timed out waiting for the command")]
    CommandReadTimeout,

    #[error("payload rejected by daemon: {message}")]
    SizeLimitExceeded { message: String },

    #[error("daemon reported an error: {message}")]
    Scan { message: String },

    #[error("malformed daemon response ({reason}) after reading {consumed:?}")]
    ResponseParse { reason: String, consumed: String },

    #[error("unexpected reply to {operation}: {reply:?}")]
    UnexpectedReply {
        operation: &'static str,
        reply: String,
    },

    #[error("payload source cannot be rewound for a retry")]
    ReplayNotSupported,

    #[error("{operation} failed after {attempts} attempt(s)")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<ClamdError>,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("session could not be started on {endpoint}")]
    SessionStartFailed { endpoint: Endpoint },

    #[error("cannot start a session on a terminated session")]
    SessionRestart,

    #[error("session is terminated; {operation} was not sent")]
    SessionTerminated { operation: &'static str },

    #[error("connection state unknown after a failed close")]
    SocketState(#[source] io::Error),

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<io::Error> for ClamdError {
    fn from(err: io::Error) -> Self {
        match classify(&err) {
            Failure::BrokenPipe => Self::BrokenPipe(err),
            Failure::ConnectionReset => Self::ConnectionReset(err),
            Failure::Other => Self::Io(err),
        }
    }
}

impl ClamdError {
    /// Retry class of this error.
    #[must_use]
    pub const fn failure(&self) -> Failure {
        match self {
            Self::BrokenPipe(_) => Failure::BrokenPipe,
            Self::ConnectionReset(_) => Failure::ConnectionReset,
            _ => Failure::Other,
        }
    }

    /// Whether a session may reconnect and resend after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.failure().is_recoverable()
    }

    /// Whether the daemon has dropped the connection this error came from.
    #[must_use]
    pub const fn kills_connection(&self) -> bool {
        matches!(
            self,
            Self::CommandReadTimeout | Self::SizeLimitExceeded { .. }
        )
    }

    /// Build a parse error for `reason` given the text read so far.
    pub fn parse(reason: impl Into<String>, consumed: impl Into<String>) -> Self {
        Self::ResponseParse {
            reason: reason.into(),
            consumed: consumed.into(),
        }
    }
}
