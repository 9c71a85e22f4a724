use gantry_middleware::MiddlewareError;
use thiserror::Error;

/// Errors surfaced by the managed layer.
///
/// Destroy paths accumulate: every sub-destroy is attempted and the first
/// non-OK result observed is the one returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An OS primitive or the underlying middleware failed.
    #[error("platform failure: {0}")]
    Platform(#[from] MiddlewareError),

    #[error("timed out")]
    Timeout,

    #[error("object not found")]
    NotFound,

    /// The queue still has pending events or open objects; the session
    /// cannot be finalized yet.
    #[error("queue has pending events or open objects")]
    QueueOpenObjects,

    /// Contract misuse the type system cannot rule out, e.g. creating an
    /// object on a session that is already draining.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
