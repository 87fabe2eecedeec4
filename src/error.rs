//! Crate-wide error kinds for the sync core.
//!
//! Storage-level failures (`storage::StoreError`) bubble up typed and are
//! folded into [`SyncError`] at the engine boundary. The binary maps each
//! kind to a process exit code.

use crate::storage::StoreError;

/// Error kinds surfaced by the backup and sync engines.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Token acquisition or refresh failed. Surfaced to the user; never
    /// retried automatically more than once.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network, rate-limit or quota trouble. Retried with backoff.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Server-suggested wait before the next attempt, if any.
        retry_after_secs: Option<u64>,
    },

    /// The remote service refused the write for lack of space.
    #[error("remote quota exceeded")]
    QuotaExceeded,

    /// Wrong passphrase or tampered envelope. Never retried.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A delta referenced nodes the target tree does not contain.
    #[error("inconsistent delta: {0}")]
    InconsistentDelta(String),

    /// The resource monitor denied the work. Not a failure; the work is
    /// deferred.
    #[error("resource denied: {0}")]
    ResourceDenied(String),

    /// Another transaction is already in flight on this device.
    #[error("a transaction is already in progress")]
    Busy,

    /// Anything else. Surfaced; not retried.
    #[error("{0}")]
    Fatal(String),
}

impl SyncError {
    /// Whether the retry state machine should pick this failure up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::QuotaExceeded | Self::ResourceDenied(_)
        )
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Auth(_) => 3,
            Self::Transient { .. } | Self::QuotaExceeded | Self::ResourceDenied(_) | Self::Busy => {
                4
            }
            Self::Crypto(_) | Self::InconsistentDelta(_) | Self::Fatal(_) => 5,
        }
    }

    /// One-line description stored on a failed `BackupRecord`.
    pub fn record_message(&self) -> String {
        match self {
            Self::Transient {
                message,
                retry_after_secs: Some(secs),
            } => format!("transient: {message} (retry after {secs}s)"),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unauthorized => Self::Auth("remote store rejected the token".into()),
            StoreError::RateLimited(secs) => Self::Transient {
                message: "remote store rate limit".into(),
                retry_after_secs: Some(secs),
            },
            StoreError::QuotaExceeded => Self::QuotaExceeded,
            StoreError::Transient(msg) => Self::Transient {
                message: msg,
                retry_after_secs: None,
            },
            StoreError::Fatal(msg) => Self::Fatal(msg),
        }
    }
}
