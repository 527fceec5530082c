// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cadence-engine.

use cadence_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// State store operation failed.
    #[error("Store error: {0}")]
    Core(#[from] CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request rejected before any run was created.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record kind (action, run, schedule, trigger).
        entity: &'static str,
        /// The missing identifier.
        id: String,
    },

    /// Record exists but cannot take the operation right now.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Error category used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Core(err) => match err {
                CoreError::RunNotFound { .. } => "not_found",
                CoreError::AlreadyExists { .. } => "conflict",
                _ => "store_error",
            },
            Self::Io(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Structured `{kind, message}` payload for the HTTP layer.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Structured error returned to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error category (`validation_error`, `not_found`, `store_error`, ...).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}
