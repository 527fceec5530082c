// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cadence-core.
//!
//! Provides a unified error type for state store operations. Every variant
//! carries a stable machine-readable code (see [`CoreError::error_code`]).

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while reading or writing the state store.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found in the database.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// A record with the same identifier already exists.
    #[error("{entity} '{id}' already exists")]
    AlreadyExists {
        /// Kind of record (run, schedule, trigger, action).
        entity: &'static str,
        /// The duplicate identifier.
        id: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::RunNotFound {
                    run_id: "r-1".to_string(),
                },
                "RUN_NOT_FOUND",
            ),
            (
                CoreError::AlreadyExists {
                    entity: "schedule",
                    id: "s-1".to_string(),
                },
                "ALREADY_EXISTS",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "disk I/O error".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::RunNotFound {
            run_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Run 'abc' not found");

        let err = CoreError::AlreadyExists {
            entity: "trigger",
            id: "t-9".to_string(),
        };
        assert_eq!(err.to_string(), "trigger 't-9' already exists");
    }

    #[test]
    fn test_sqlx_error_maps_to_database_error() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::DatabaseError { .. }));
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
