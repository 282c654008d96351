//! Error types for the reconciler crate.

use stepwise_core::RunKey;
use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pass-level reconciler errors. Any of these requeues the key with backoff.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A collaborator store call failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A pass did not finish within the configured deadline.
    #[error("reconcile of '{key}' exceeded the pass deadline")]
    PassTimedOut { key: RunKey },

    /// The loop was stopped.
    #[error("reconciliation loop stopped")]
    LoopStopped,

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a pass timeout error.
    #[must_use]
    pub const fn pass_timed_out(key: RunKey) -> Self {
        Self::PassTimedOut { key }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
