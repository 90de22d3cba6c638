//! Typed error types for the postrun persistence seam.
//!
//! Provides [`StoreError`], the canonical error type returned by
//! `EnvironmentStore` implementations when the merged variable mapping
//! produced by a successful script run cannot be written back.

use thiserror::Error;

/// Canonical error type for environment write-back operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The environment no longer exists in the backing store.
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    /// A concurrent writer updated the environment first.
    #[error("write conflict on environment '{environment_id}': {reason}")]
    Conflict {
        /// The environment being written.
        environment_id: String,
        /// Why the store refused the write.
        reason: String,
    },

    /// The backing store could not be reached or refused the write.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EnvironmentNotFound(_) => "ENVIRONMENT_NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the write may succeed if the caller retries it.
    ///
    /// Only the write-back is retryable; the script itself is never re-run.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Unavailable(_) => true,
            Self::EnvironmentNotFound(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error for run history or API responses.
    pub fn to_structured_error(&self) -> serde_json::Value {
        serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        })
    }
}

// Compile-time assertion: StoreError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<StoreError>();
};
