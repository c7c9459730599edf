//! Error types for holdback-core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for holdback-core
///
/// Ordinary state conflicts (pausing twice, resuming while active, using a
/// killed handler) are never errors; they are silent no-ops. Only contract
/// violations and setup failures surface here.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested delay pushes the deadline past what the monotonic
    /// clock can represent.
    #[error("delay of {delay:?} overflows the monotonic clock")]
    DeadlineOverflow { delay: Duration },

    /// Configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The dispatch loop could not be started.
    #[error(transparent)]
    Looper(#[from] looper::LooperError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error is a caller bug rather than an environment failure.
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::DeadlineOverflow { .. })
    }
}
