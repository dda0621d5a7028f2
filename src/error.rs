use std::any::Any;
use std::fmt::Display;

use thiserror::Error;

/// Error type for query operations.
///
/// Every failure raised by a fetcher is normalized into this type before it is
/// stored in the query state and handed to callers, so it only carries a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    /// Creates an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Normalizes any displayable fetch failure.
    pub fn fetch(err: impl Display) -> Self {
        Self::new(err.to_string())
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::new(format!("fetch panicked: {detail}"))
    }

    pub(crate) fn abandoned() -> Self {
        Self::new("fetch was abandoned before completing")
    }
}

impl From<String> for QueryError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for QueryError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
