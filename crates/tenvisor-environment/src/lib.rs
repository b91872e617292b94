// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenvisor Environment - Multi-Tenant Runtime Supervisor
//!
//! This crate hosts many independently generated tenant applications inside
//! one process. It creates, addresses, monitors and tears down per-tenant
//! execution units, brokers every tenant database statement, and suspends
//! idle tenants.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     HTTP (axum) / embedding app                     │
//! │        Host: <tenant>.<base>  |  /apps/{tenant}/...  |  /admin      │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Supervisor                                  │
//! │         ExecutionStrategy (chosen once by ExecutionMode)            │
//! │  ┌──────────────────────────────┐   ┌────────────────────────────┐  │
//! │  │ PooledStrategy → UnitPool    │   │ StatelessStrategy          │  │
//! │  │ spawn dedup, pending table,  │   │ fresh context per request  │  │
//! │  │ IdleWatchdog                 │   │                            │  │
//! │  └──────────────────────────────┘   └────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │ request / stop                ▲ ready / response / error /
//!          ▼                               │ status / db_query
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │      Execution units (one tokio task per tenant, bounded mpsc)      │
//! │      Bundler → ModuleLoader → TenantHandler                         │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │ db_query (via Supervisor)
//!                                   ▼
//!                 tenvisor-core: TenantStore, DatabaseBroker
//! ```
//!
//! # Execution modes
//!
//! | Mode | Units | Watchdog | Admin |
//! |------|-------|----------|-------|
//! | `pooled` (default) | one long-lived unit per active tenant | yes | full |
//! | `stateless` | none; handler built per request | no | `list_units` only |
//!
//! The mode is chosen at startup by [`ExecutionMode::detect`]: an explicit
//! `TENVISOR_EXECUTION_MODE`, else stateless on serverless platforms.
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables.

#![deny(missing_docs)]

/// Tenant artifact linking for the server and client targets.
pub mod bundle;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// HTTP router.
pub mod http;

/// Requests awaiting a correlated reply.
pub mod pending;

/// Pool of long-lived execution units.
pub mod pool;

/// Embeddable runtime with builder.
pub mod runtime;

/// Stateless per-request execution.
pub mod stateless;

/// Execution strategies and mode detection.
pub mod strategy;

/// Supervisor façade.
pub mod supervisor;

/// Execution units: lifecycle types, handlers, loaders.
pub mod unit;

/// Idle watchdog.
pub mod watchdog;

pub use error::{Error, Result};
pub use pool::{PoolConfig, UnitHandle, UnitPool};
pub use runtime::SupervisorRuntime;
pub use strategy::{ExecutionMode, ExecutionStrategy, PooledStrategy};
pub use supervisor::Supervisor;
pub use unit::{ExecutionUnit, ResourceLimits, UnitStats, UnitStatus};
