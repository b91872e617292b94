// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenvisor Core - tenant records and brokered tenant storage
//!
//! This crate holds the two pieces of state the supervisor shares across
//! tenants: the tenant store (who the tenants are and what they run) and the
//! database broker (the only component allowed to open tenant databases).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   tenvisor-environment                       │
//! │        (Supervisor, Execution Units, Watchdog, HTTP)         │
//! └──────────────────────────────────────────────────────────────┘
//!            │ find_by_id_or_subdomain            │ db_query
//!            ▼                                    ▼
//! ┌────────────────────────┐        ┌────────────────────────────┐
//! │   TenantStore          │        │   DatabaseBroker           │
//! │   (this crate)         │        │   (this crate)             │
//! │   SQLite / in-memory   │        │   one connection / tenant  │
//! └────────────────────────┘        └────────────────────────────┘
//!            │                                    │
//!            ▼                                    ▼
//!      tenants.db                      apps/<tenant>.db (WAL)
//! ```
//!
//! # Modules
//!
//! - [`tenant`]: tenant records, source artifacts and store backends
//! - [`broker`]: per-tenant SQLite connections and statement execution
//! - [`error`]: error types

#![deny(missing_docs)]

/// Error types for tenant store operations.
pub mod error;

/// Tenant records and store backends.
pub mod tenant;

/// Per-tenant database broker.
pub mod broker;

pub use broker::{BrokerConfig, DatabaseBroker};
pub use error::StoreError;
pub use tenant::{SourceArtifact, TenantApp, TenantStore};
