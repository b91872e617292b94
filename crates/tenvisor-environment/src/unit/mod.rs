// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution units.
//!
//! An execution unit is a tokio task hosting exactly one tenant's module. It
//! talks to the supervisor only through [`Message`](tenvisor_protocol::Message)s
//! on bounded channels: one inbox it reads, one outbox the supervisor routes.
//!
//! # Lifecycle
//!
//! ```text
//! starting ──ready──▶ running ──idle──▶ sleeping
//!    │                   │ ├────stop──▶ terminated
//!    │                   │ └───fault──▶ error
//!    └──fault/timeout──▶ error
//! ```
//!
//! Nothing leaves `error`, `sleeping` or `terminated`; the next request for
//! the tenant spawns a fresh unit with a new `unit_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenvisor_protocol::StatusReport;
use uuid::Uuid;

pub mod db;
pub mod handler;
pub mod loader;
pub(crate) mod worker;

pub use db::{BrokerExecutor, ChannelExecutor, QueryExecutor};
pub use handler::{DefaultHandler, EchoHandler, HandlerContext, HandlerError, TenantHandler};
pub use loader::{BundleLoader, HandlerFactory, HandlerRegistry, ModuleLoader};

/// Lifecycle status of an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Bootstrapping; not yet accepting requests.
    Starting,
    /// Accepting requests.
    Running,
    /// Suspended for inactivity.
    Sleeping,
    /// Bootstrap or runtime fault.
    Error,
    /// Stopped explicitly.
    Terminated,
}

impl UnitStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Starting => "starting",
            UnitStatus::Running => "running",
            UnitStatus::Sleeping => "sleeping",
            UnitStatus::Error => "error",
            UnitStatus::Terminated => "terminated",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Error)
                | (Starting, Terminated)
                | (Running, Sleeping)
                | (Running, Error)
                | (Running, Terminated)
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage last reported by a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Cumulative handler busy time.
    pub cpu_ms: u64,
    /// Approximate module footprint.
    pub memory_bytes: u64,
}

impl From<&StatusReport> for ResourceUsage {
    fn from(report: &StatusReport) -> Self {
        Self {
            cpu_ms: report.cpu_ms,
            memory_bytes: report.memory_bytes,
        }
    }
}

/// Admin-visible snapshot of an execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUnit {
    /// Canonical tenant id.
    pub app_id: String,
    /// Public alias.
    pub subdomain: Option<String>,
    /// Generation id, fresh for every spawn.
    pub unit_id: Uuid,
    /// Lifecycle status.
    pub status: UnitStatus,
    /// When the spawn began.
    pub started_at: DateTime<Utc>,
    /// Last request or inbound message.
    pub last_activity: DateTime<Utc>,
    /// Last fault, if any.
    pub error: Option<String>,
    /// Last usage report, if any.
    pub resource_usage: Option<ResourceUsage>,
}

/// Per-unit limits, adjustable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Requests allowed in flight at once.
    pub max_concurrent_requests: u32,
    /// Per-tenant override of the request timeout, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 32,
            request_timeout_ms: None,
        }
    }
}

impl ResourceLimits {
    /// Reject limits that would make the unit unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_requests == 0 {
            return Err("maxConcurrentRequests must be at least 1".to_string());
        }
        if self.request_timeout_ms == Some(0) {
            return Err("requestTimeoutMs must be positive".to_string());
        }
        Ok(())
    }
}

/// Detailed statistics for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStats {
    /// Unit snapshot.
    pub unit: ExecutionUnit,
    /// Counters from the last usage report.
    pub usage: StatusReport,
    /// Active limits.
    pub limits: ResourceLimits,
    /// Requests currently holding a concurrency permit.
    pub in_flight: usize,
    /// Requests awaiting a reply.
    pub pending: usize,
}
