//! Error types for the `linkage` crate.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur while blocking, scoring, writing edges or clustering.
#[derive(Debug, Error)]
pub enum LinkageError {
    /// Invalid parameter values, detected before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A referenced collection, index, relation or view does not exist.
    #[error("{kind} '{name}' not found")]
    ResourceNotFound {
        /// The kind of resource (collection, text index, relation, ...).
        kind: &'static str,
        /// The name the caller referenced.
        name: String,
    },

    /// A caller-supplied batch is larger than the configured cap.
    #[error("Batch of {size} items exceeds the cap of {cap}; re-chunk the input")]
    BatchSizeExceeded {
        /// Size of the rejected batch.
        size: usize,
        /// Configured maximum.
        cap: usize,
    },

    /// A similarity function could not compare the inputs of one pair.
    #[error("Computation error for pair ({}, {}): {message}", pair.0, pair.1)]
    Computation {
        /// The pair being scored.
        pair: (String, String),
        /// A description of the failure.
        message: String,
    },

    /// An error reported by the backing store.
    #[error("Store error ({backend}): {message}")]
    Store {
        /// The store backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
        /// Whether the failure is a transient connectivity error worth retrying.
        transient: bool,
    },

    /// A bulk operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The configured deadline.
        after: Duration,
    },

    /// The caller cancelled the run at a batch boundary.
    #[error("Cancelled during {stage}")]
    Cancelled {
        /// The stage that observed the cancellation.
        stage: &'static str,
    },

    /// An error in the resolution pipeline orchestration.
    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl LinkageError {
    /// Shorthand for a missing resource.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::ResourceNotFound { kind, name: name.into() }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Only store connectivity errors qualify; timeouts abort the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { transient: true, .. })
    }
}

/// A convenience result type for linkage operations.
pub type Result<T> = std::result::Result<T, LinkageError>;

/// Fail with [`LinkageError::Cancelled`] if `cancel` has fired.
pub(crate) fn ensure_active(cancel: &CancellationToken, stage: &'static str) -> Result<()> {
    if cancel.is_cancelled() { Err(LinkageError::Cancelled { stage }) } else { Ok(()) }
}
