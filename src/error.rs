use thiserror::Error;

/// Failures surfaced by the settings store, the violation counters and the
/// streak storage.
///
/// Nothing retries past these: the calling feature decides whether to tell the user
/// something went wrong or let it bubble up to the framework's error handler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("settings storage failed: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("gave up after concurrent updates to {0}")]
    Contended(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
