// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tenvisor-environment.

use thiserror::Error;

use crate::unit::UnitStatus;

/// Supervisor errors.
///
/// Cloneable so a shared in-flight spawn can hand the same failure to every
/// caller awaiting it.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// No tenant matches the id or subdomain.
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    /// The unit did not report ready in time.
    #[error("Tenant {app_id} did not become ready within {timeout_ms}ms")]
    SpawnTimeout {
        /// Canonical tenant id.
        app_id: String,
        /// Spawn bound that elapsed.
        timeout_ms: u64,
    },

    /// The tenant artifact could not be compiled or loaded.
    #[error("Failed to compile tenant {app_id}: {message}")]
    CompileFailure {
        /// Canonical tenant id.
        app_id: String,
        /// Bundler or loader message.
        message: String,
    },

    /// The tenant handler failed a single request.
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// The tenant's unit cannot serve requests in its current state.
    #[error("Unit for tenant {app_id} is not running (status: {status})")]
    UnitNotRunning {
        /// Canonical tenant id.
        app_id: String,
        /// Status observed.
        status: UnitStatus,
    },

    /// The unit exited while the request was outstanding.
    #[error("Unit for tenant {0} exited")]
    UnitExited(String),

    /// No reply arrived within the request bound.
    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Correlation id of the abandoned request.
        correlation_id: String,
        /// Request bound that elapsed.
        timeout_ms: u64,
    },

    /// Tenant store failure.
    #[error("Tenant store error: {0}")]
    Store(String),

    /// Operation not available under the active execution strategy.
    #[error("{operation} is not supported in {mode} mode")]
    Unsupported {
        /// Operation name.
        operation: &'static str,
        /// Active strategy.
        mode: &'static str,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::TenantNotFound(_) => "TENANT_NOT_FOUND",
            Error::SpawnTimeout { .. } => "SPAWN_TIMEOUT",
            Error::CompileFailure { .. } => "COMPILE_FAILURE",
            Error::HandlerFault(_) => "HANDLER_FAULT",
            Error::UnitNotRunning { .. } => "UNIT_NOT_RUNNING",
            Error::UnitExited(_) => "UNIT_EXITED",
            Error::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Error::Store(_) => "STORE_ERROR",
            Error::Unsupported { .. } => "UNSUPPORTED",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the tenant cannot currently serve requests.
    pub fn is_unit_not_running(&self) -> bool {
        matches!(
            self,
            Error::CompileFailure { .. } | Error::UnitNotRunning { .. } | Error::UnitExited(_)
        )
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::TenantNotFound(_) => 404,
            Error::SpawnTimeout { .. } => 503,
            Error::CompileFailure { .. } | Error::UnitNotRunning { .. } | Error::UnitExited(_) => {
                502
            }
            Error::HandlerFault(_) => 500,
            Error::RequestTimeout { .. } => 504,
            Error::Store(_) | Error::Other(_) => 500,
            Error::Unsupported { .. } => 409,
            Error::InvalidRequest(_) => 400,
        }
    }
}

impl From<tenvisor_core::StoreError> for Error {
    fn from(err: tenvisor_core::StoreError) -> Self {
        Error::Store(err.to_string())
    }
}

/// Result type using the supervisor Error.
pub type Result<T> = std::result::Result<T, Error>;
