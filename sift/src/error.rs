//! Error types for Sift.
//!
//! The taxonomy is a closed set: every failure that crosses the broker
//! boundary maps onto one [`ErrorKind`], carries the underlying engine code
//! where one exists, and declares whether a retry is worthwhile.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sift error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation issued before `open`.
    #[error("database is not open")]
    NotOpen,

    /// Imported database carries an unknown schema version.
    #[error("unsupported schema version {found} (engine supports up to {supported})")]
    SchemaMismatch { found: i64, supported: i64 },

    /// The underlying engine rejected a statement.
    #[error("sql error: {message}")]
    Sql {
        message: String,
        /// SQLite result code, preserved for diagnostics.
        engine_code: Option<i32>,
    },

    /// Primary key / not-null / check failure.
    #[error("constraint violation: {message}")]
    ConstraintViolation {
        message: String,
        /// Index of the offending document within a batch, when known.
        document_index: Option<usize>,
    },

    /// Storage layer refused the write.
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Vector support is unavailable in the loaded engine.
    #[error("vector support unavailable: {0}")]
    VectorMissing(String),

    /// Vector length does not match the collection's dimensions.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Embedding provider returned a failure.
    #[error("provider error: {message}")]
    Provider {
        message: String,
        retryable: bool,
        retry_after_ms: Option<u64>,
    },

    /// Embedding call exceeded its budget.
    #[error("provider timed out after {budget_ms} ms")]
    ProviderTimeout { budget_ms: u64 },

    /// Broker queue saturated.
    #[error("request queue saturated")]
    Overloaded,

    /// Request cancelled (explicitly or by request timeout).
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// Validation failed before any work was done.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Local storage failure outside the SQL engine (files, KV tier).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias for Sift operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error discriminant, serialized into every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotOpen,
    SchemaMismatch,
    SqlError,
    ConstraintViolation,
    QuotaExceeded,
    VectorMissing,
    DimensionMismatch,
    ProviderError,
    ProviderTimeout,
    Overloaded,
    Cancelled,
    InvalidRequest,
    StorageError,
}

impl Error {
    /// The wire discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotOpen => ErrorKind::NotOpen,
            Error::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Error::Sql { .. } => ErrorKind::SqlError,
            Error::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            Error::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Error::VectorMissing(_) => ErrorKind::VectorMissing,
            Error::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Error::Provider { .. } => ErrorKind::ProviderError,
            Error::ProviderTimeout { .. } => ErrorKind::ProviderTimeout,
            Error::Overloaded => ErrorKind::Overloaded,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Storage(_) => ErrorKind::StorageError,
        }
    }

    /// Whether retrying the operation is worthwhile.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Provider { retryable, .. } => *retryable,
            Error::ProviderTimeout { .. } | Error::Overloaded => true,
            // SQL busy/locked conditions are transient; everything else is not.
            Error::Sql { engine_code, .. } => {
                matches!(engine_code.map(|c| c & 0xff), Some(5) | Some(6))
            }
            _ => false,
        }
    }

    /// Structured details for the wire envelope (engine codes, indices).
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::Sql { engine_code, .. } => {
                engine_code.map(|code| serde_json::json!({ "engine_code": code }))
            }
            Error::ConstraintViolation { document_index, .. } => document_index
                .map(|index| serde_json::json!({ "document_index": index })),
            Error::SchemaMismatch { found, supported } => {
                Some(serde_json::json!({ "found": found, "supported": supported }))
            }
            Error::DimensionMismatch { expected, actual } => {
                Some(serde_json::json!({ "expected": expected, "actual": actual }))
            }
            Error::Provider { retry_after_ms, .. } => {
                retry_after_ms.map(|ms| serde_json::json!({ "retry_after_ms": ms }))
            }
            Error::ProviderTimeout { budget_ms } => {
                Some(serde_json::json!({ "budget_ms": budget_ms }))
            }
            _ => None,
        }
    }

    /// Attach a batch document index to a constraint violation; other
    /// variants pass through unchanged.
    pub(crate) fn with_document_index(self, index: usize) -> Self {
        match self {
            Error::ConstraintViolation { message, .. } => Error::ConstraintViolation {
                message,
                document_index: Some(index),
            },
            other => other,
        }
    }
}

// SQLite primary result codes that get dedicated variants.
const SQLITE_CONSTRAINT: i32 = 19;
const SQLITE_FULL: i32 = 13;

impl From<libsql::Error> for Error {
    fn from(err: libsql::Error) -> Self {
        match err {
            libsql::Error::SqliteFailure(code, message) => {
                match code & 0xff {
                    SQLITE_CONSTRAINT => Error::ConstraintViolation {
                        message,
                        document_index: None,
                    },
                    SQLITE_FULL => Error::QuotaExceeded(message),
                    _ => Error::Sql {
                        message,
                        engine_code: Some(code),
                    },
                }
            }
            other => Error::Sql {
                message: other.to_string(),
                engine_code: None,
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidRequest(format!("serialization error: {}", err))
    }
}

impl From<sift_embed::ProviderError> for Error {
    fn from(err: sift_embed::ProviderError) -> Self {
        match &err {
            sift_embed::ProviderError::DimensionMismatch { expected, actual } => {
                Error::DimensionMismatch {
                    expected: *expected,
                    actual: *actual,
                }
            }
            _ => Error::Provider {
                message: err.to_string(),
                retryable: err.is_retryable(),
                retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_code_maps_to_constraint_violation() {
        let err = Error::from(libsql::Error::SqliteFailure(
            19,
            "UNIQUE constraint failed: documents.doc_id".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
        assert!(!err.retryable());
    }

    #[test]
    fn test_extended_constraint_code_maps_too() {
        // SQLITE_CONSTRAINT_UNIQUE = 2067 = 19 | (8 << 8)
        let err = Error::from(libsql::Error::SqliteFailure(2067, "unique".to_string()));
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }

    #[test]
    fn test_full_maps_to_quota() {
        let err = Error::from(libsql::Error::SqliteFailure(
            13,
            "database or disk is full".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_engine_code_preserved() {
        let err = Error::from(libsql::Error::SqliteFailure(1, "syntax error".to_string()));
        assert_eq!(
            err.details(),
            Some(serde_json::json!({ "engine_code": 1 }))
        );
    }

    #[test]
    fn test_busy_is_retryable() {
        let err = Error::from(libsql::Error::SqliteFailure(5, "busy".to_string()));
        assert!(err.retryable());
    }

    #[test]
    fn test_document_index_attachment() {
        let err = Error::ConstraintViolation {
            message: "duplicate id".to_string(),
            document_index: None,
        }
        .with_document_index(7);
        assert_eq!(
            err.details(),
            Some(serde_json::json!({ "document_index": 7 }))
        );
    }

    #[test]
    fn test_retryability_table() {
        assert!(Error::Overloaded.retryable());
        assert!(Error::ProviderTimeout { budget_ms: 100 }.retryable());
        assert!(!Error::NotOpen.retryable());
        assert!(!Error::Cancelled("by caller".to_string()).retryable());
        assert!(!Error::InvalidRequest("empty id".to_string()).retryable());
    }
}
