//! Error types for Flake Triage.
//!
//! Every error carries a category (for grouping in logs and counters)
//! and a retriability hint consumed by the ingestion pipeline and its
//! callers.
//!
//! Filtered-out inputs are not errors: verdicts the pipeline skips are
//! counted against labeled counters and dropped, and out-of-order
//! verdicts are discarded silently. Errors are reserved for conditions
//! that stop a batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Flake Triage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid analysis configuration.
    Config,
    /// Malformed or contract-violating ingestion input.
    Ingestion,
    /// Branch store failures, including commit conflicts.
    Store,
    /// Reporting sink failures.
    Export,
    /// Serialization of persisted state.
    Serialization,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Ingestion => write!(f, "ingestion"),
            ErrorCategory::Store => write!(f, "store"),
            ErrorCategory::Export => write!(f, "export"),
            ErrorCategory::Serialization => write!(f, "serialization"),
        }
    }
}

/// Unified error type for Flake Triage.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration
    #[error("configuration error: {0}")]
    Config(String),

    // Ingestion input and model invariants
    #[error("malformed test result name: {name}")]
    MalformedResultName { name: String },

    #[error("duplicate commit position {position} in hot buffer")]
    DuplicatePosition { position: i64 },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // Store
    #[error("store commit conflicted with a concurrent writer")]
    StoreConflict,

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    // Serialization of persisted state
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Reporting sink
    #[error("export failed: {0}")]
    Export(String),
}

impl Error {
    /// Category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Config,

            Error::MalformedResultName { .. }
            | Error::DuplicatePosition { .. }
            | Error::InvariantViolation(_) => ErrorCategory::Ingestion,

            Error::StoreConflict | Error::Store(_) | Error::RetryBudgetExhausted { .. } => {
                ErrorCategory::Store
            }

            Error::Serialization(_) => ErrorCategory::Serialization,

            Error::Export(_) => ErrorCategory::Export,
        }
    }

    /// Returns whether retrying the failed batch can succeed.
    ///
    /// Retriable failures leave no partial state behind: the batch
    /// checkpoint is only written with the mutations it covers, so a
    /// caller may redeliver the batch verbatim.
    pub fn is_retriable(&self) -> bool {
        match self {
            // Config is wrong until someone changes it.
            Error::Config(_) => false,

            // Contract violations will reproduce on replay.
            Error::MalformedResultName { .. } => false,
            Error::DuplicatePosition { .. } => false,
            Error::InvariantViolation(_) => false,

            // Conflicts are consumed by the pipeline's own retry loop;
            // if one escapes, the batch can still be redelivered.
            Error::StoreConflict => true,
            Error::Store(_) => true,
            Error::RetryBudgetExhausted { .. } => true,

            // Persisted state is corrupt; replaying reads it again.
            Error::Serialization(_) => false,

            Error::Export(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_group_variants() {
        assert_eq!(
            Error::Config("bad".into()).category(),
            ErrorCategory::Config
        );
        assert_eq!(
            Error::DuplicatePosition { position: 7 }.category(),
            ErrorCategory::Ingestion
        );
        assert_eq!(Error::StoreConflict.category(), ErrorCategory::Store);
        assert_eq!(
            Error::RetryBudgetExhausted { attempts: 4 }.category(),
            ErrorCategory::Store
        );
        assert_eq!(
            Error::Export("sink down".into()).category(),
            ErrorCategory::Export
        );
    }

    #[test]
    fn conflicts_are_retriable_invariants_are_not() {
        assert!(Error::StoreConflict.is_retriable());
        assert!(Error::Store("unavailable".into()).is_retriable());
        assert!(!Error::DuplicatePosition { position: 1 }.is_retriable());
        assert!(!Error::InvariantViolation("compact without full cold".into()).is_retriable());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::MalformedResultName {
            name: "bogus".into(),
        };
        assert!(err.to_string().contains("bogus"));

        let err = Error::RetryBudgetExhausted { attempts: 4 };
        assert!(err.to_string().contains('4'));
    }

    #[test]
    fn category_display_is_snake_case() {
        assert_eq!(ErrorCategory::Serialization.to_string(), "serialization");
        assert_eq!(ErrorCategory::Ingestion.to_string(), "ingestion");
    }
}
