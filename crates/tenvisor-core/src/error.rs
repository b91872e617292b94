// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tenvisor-core.

use thiserror::Error;

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Tenant store errors.
///
/// Cloneable so callers can fan the same failure out to several waiters.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A stored tenant record could not be decoded.
    #[error("Invalid tenant record '{id}': {reason}")]
    InvalidRecord {
        /// Tenant id of the broken record.
        id: String,
        /// Why decoding failed.
        reason: String,
    },

    /// Tenant does not exist.
    #[error("Tenant '{0}' not found")]
    NotFound(String),
}

impl StoreError {
    /// Stable error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Database { .. } => "DATABASE_ERROR",
            Self::InvalidRecord { .. } => "INVALID_RECORD",
            Self::NotFound(_) => "TENANT_NOT_FOUND",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
