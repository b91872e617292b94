// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution strategies and the startup choice between them.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tenvisor_protocol::{RequestPayload, ResponsePayload};

use crate::error::{Error, Result};
use crate::pool::UnitPool;
use crate::unit::{ExecutionUnit, ResourceLimits, UnitStats};

/// Platform markers whose presence means background tasks may not outlive
/// a request.
const SERVERLESS_MARKERS: &[&str] = &[
    "AWS_LAMBDA_FUNCTION_NAME",
    "VERCEL",
    "NETLIFY",
    "FUNCTIONS_WORKER_RUNTIME",
];

/// How tenant requests are executed. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Long-lived execution units, one per active tenant.
    Pooled,
    /// Fresh tenant context per request, no background units.
    Stateless,
}

impl ExecutionMode {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Pooled => "pooled",
            ExecutionMode::Stateless => "stateless",
        }
    }

    /// Detect the mode from the process environment.
    pub fn detect() -> Self {
        Self::detect_with(|key| env::var(key).ok())
    }

    /// Detect the mode from an arbitrary variable lookup.
    ///
    /// An explicit `TENVISOR_EXECUTION_MODE` wins; `auto` (or an unknown
    /// value) falls through to platform detection.
    pub fn detect_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(mode) = lookup("TENVISOR_EXECUTION_MODE").and_then(|v| v.parse().ok()) {
            return mode;
        }
        let serverless = SERVERLESS_MARKERS
            .iter()
            .any(|marker| lookup(marker).is_some_and(|v| !v.is_empty()));
        if serverless {
            ExecutionMode::Stateless
        } else {
            ExecutionMode::Pooled
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pooled" | "threaded" => Ok(ExecutionMode::Pooled),
            "stateless" => Ok(ExecutionMode::Stateless),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// A way of executing tenant requests.
///
/// Admin operations default to [`Error::Unsupported`]; only strategies with
/// persistent units implement them.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// The mode this strategy implements.
    fn mode(&self) -> ExecutionMode;

    /// Execute one request for the tenant identified by `key`.
    async fn request(&self, key: &str, payload: RequestPayload) -> Result<ResponsePayload>;

    /// Stop the tenant's unit.
    async fn stop(&self, _key: &str) -> Result<ExecutionUnit> {
        Err(self.unsupported("stop"))
    }

    /// Terminate and respawn the tenant's unit.
    async fn restart(&self, _key: &str) -> Result<ExecutionUnit> {
        Err(self.unsupported("restart"))
    }

    /// Statistics for the tenant's unit.
    async fn stats(&self, _key: &str) -> Result<UnitStats> {
        Err(self.unsupported("stats"))
    }

    /// Replace the tenant's resource limits.
    async fn update_resources(&self, _key: &str, _limits: ResourceLimits) -> Result<ResourceLimits> {
        Err(self.unsupported("update_resources"))
    }

    /// Every registered unit. Empty when there are no persistent units.
    async fn list_units(&self) -> Vec<ExecutionUnit> {
        Vec::new()
    }

    /// Release everything the strategy holds.
    async fn shutdown(&self) {}

    /// Error for an admin operation this strategy cannot perform.
    fn unsupported(&self, operation: &'static str) -> Error {
        Error::Unsupported {
            operation,
            mode: self.mode().as_str(),
        }
    }
}

/// Pooled strategy: requests go to long-lived units in a [`UnitPool`].
pub struct PooledStrategy {
    pool: Arc<UnitPool>,
}

impl PooledStrategy {
    /// Wrap a pool.
    pub fn new(pool: Arc<UnitPool>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<UnitPool> {
        &self.pool
    }
}

#[async_trait]
impl ExecutionStrategy for PooledStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Pooled
    }

    async fn request(&self, key: &str, payload: RequestPayload) -> Result<ResponsePayload> {
        self.pool.request(key, payload).await
    }

    async fn stop(&self, key: &str) -> Result<ExecutionUnit> {
        self.pool.stop(key)
    }

    async fn restart(&self, key: &str) -> Result<ExecutionUnit> {
        let handle = self.pool.restart(key).await?;
        self.pool
            .unit(handle.app_id())
            .ok_or_else(|| Error::UnitExited(handle.app_id().to_string()))
    }

    async fn stats(&self, key: &str) -> Result<UnitStats> {
        self.pool.stats(key)
    }

    async fn update_resources(&self, key: &str, limits: ResourceLimits) -> Result<ResourceLimits> {
        self.pool.update_resources(key, limits)
    }

    async fn list_units(&self) -> Vec<ExecutionUnit> {
        self.pool.list_units()
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
