use thiserror::Error;

/// Protocol-level failure. Every variant except `Timeout` and `Io` is
/// client-visible and rendered into an `ERR` frame by the error adapter;
/// `Internal` deliberately carries no detail across the wire.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid message format")]
    MalformedFrame,

    #[error("invalid header format")]
    InvalidFormat,

    #[error("challenge expired")]
    Expired,

    #[error("subject mismatch")]
    SubjectMismatch,

    #[error("difficulty mismatch")]
    DifficultyMismatch,

    #[error("challenge not found")]
    UnknownChallenge,

    #[error("challenge already used")]
    Replay,

    #[error("insufficient proof of work")]
    InsufficientWork,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("unknown client command: {0}")]
    UnknownCommand(String),

    #[error("request timed out")]
    Timeout,

    #[error("internal error")]
    Internal(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GateError {
    pub fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        GateError::Internal(err.into())
    }

    /// True for errors after which the connection cannot be trusted to
    /// stay in sync and must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GateError::Io(_) | GateError::Timeout)
    }
}
