//! Error taxonomy of the mutation engine.

use thiserror::Error;

use tessera_core::CoreError;
use tessera_store::StoreError;
use tessera_stream::StreamError;

use crate::locks::LockError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid or inconsistent input.
    #[error("Functional error: {0}")]
    Functional(String),

    /// A referenced id could not be resolved.
    #[error("Missing reference: {}", .unresolved.join(", "))]
    MissingReference { unresolved: Vec<String> },

    /// The participant lock could not be acquired in time.
    #[error("Lock timeout on participants: {}", .participant_ids.join(", "))]
    LockTimeout { participant_ids: Vec<String> },

    /// Operation not permitted by policy.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Stored-data invariant violation.
    #[error("Database error: {0}")]
    Database(String),

    #[error("Lock service error: {0}")]
    Lock(#[from] LockError),

    #[error("Index error: {0}")]
    Store(#[from] StoreError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Classification used by callers to decide on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Functional,
    MissingReference,
    LockTimeout,
    Unsupported,
    Database,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Functional(_) => ErrorKind::Functional,
            Self::MissingReference { .. } => ErrorKind::MissingReference,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Database(_) => ErrorKind::Database,
            Self::Lock(_) | Self::Store(_) | Self::Stream(_) | Self::Core(_) => ErrorKind::Internal,
        }
    }

    /// Missing references and lock contention may succeed when retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MissingReference | ErrorKind::LockTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let missing = EngineError::MissingReference {
            unresolved: vec!["marking-definition--x".into()],
        };
        assert!(missing.is_retryable());
        assert_eq!(
            missing.to_string(),
            "Missing reference: marking-definition--x"
        );

        let timeout = EngineError::LockTimeout {
            participant_ids: vec!["a".into(), "b".into()],
        };
        assert!(timeout.is_retryable());
        assert!(!EngineError::Functional("x".into()).is_retryable());
        assert!(!EngineError::Database("x".into()).is_retryable());
    }
}
