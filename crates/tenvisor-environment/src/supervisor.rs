// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor: the single entry point for tenant requests and admin actions.

use std::sync::Arc;

use serde_json::Value;
use tenvisor_core::TenantStore;
use tenvisor_protocol::{RequestPayload, ResponsePayload};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pool::UnitPool;
use crate::strategy::{ExecutionMode, ExecutionStrategy};
use crate::unit::{ExecutionUnit, ResourceLimits, UnitStats, UnitStatus};

/// Dispatches to the execution strategy chosen at startup.
///
/// Cheap to share: wrap in an `Arc` and hand it to the HTTP layer.
pub struct Supervisor {
    strategy: Arc<dyn ExecutionStrategy>,
    pool: Option<Arc<UnitPool>>,
    store: Arc<dyn TenantStore>,
}

impl Supervisor {
    /// Supervisor over `strategy`. `pool` is set in pooled mode only.
    pub fn new(
        strategy: Arc<dyn ExecutionStrategy>,
        pool: Option<Arc<UnitPool>>,
        store: Arc<dyn TenantStore>,
    ) -> Self {
        Self {
            strategy,
            pool,
            store,
        }
    }

    /// Active execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.strategy.mode()
    }

    /// The unit pool, in pooled mode.
    pub fn pool(&self) -> Option<&Arc<UnitPool>> {
        self.pool.as_ref()
    }

    /// Execute a request for the tenant identified by id or subdomain.
    pub async fn request(&self, key: &str, payload: RequestPayload) -> Result<ResponsePayload> {
        self.strategy.request(key, payload).await
    }

    /// Stop the tenant's unit.
    pub async fn stop(&self, key: &str) -> Result<ExecutionUnit> {
        self.strategy.stop(key).await
    }

    /// Terminate and respawn the tenant's unit.
    pub async fn restart(&self, key: &str) -> Result<ExecutionUnit> {
        self.strategy.restart(key).await
    }

    /// Statistics for the tenant's unit.
    pub async fn stats(&self, key: &str) -> Result<UnitStats> {
        self.strategy.stats(key).await
    }

    /// Replace the tenant's resource limits.
    pub async fn update_resources(&self, key: &str, limits: ResourceLimits) -> Result<ResourceLimits> {
        self.strategy.update_resources(key, limits).await
    }

    /// Every registered unit, ordered by tenant id.
    pub async fn list_units(&self) -> Vec<ExecutionUnit> {
        self.strategy.list_units().await
    }

    /// Replace the tenant's persisted data.
    ///
    /// A running unit was seeded with the old blob, so it is restarted to
    /// pick up the new one.
    pub async fn update_persisted_data(&self, key: &str, data: Value) -> Result<()> {
        let tenant = self
            .store
            .find_by_id_or_subdomain(key)
            .await?
            .ok_or_else(|| Error::TenantNotFound(key.to_string()))?;
        self.store.update_persisted_data(&tenant.id, &data).await?;
        info!(app_id = %tenant.id, "Persisted data updated");

        let Some(pool) = &self.pool else {
            return Ok(());
        };
        let running = pool
            .unit(&tenant.id)
            .is_some_and(|unit| unit.status == UnitStatus::Running);
        if running && let Err(e) = pool.restart(&tenant.id).await {
            warn!(app_id = %tenant.id, error = %e, "Restart after data update failed");
            return Err(e);
        }
        Ok(())
    }

    /// Stop all units and close all tenant databases.
    pub async fn shutdown(&self) {
        self.strategy.shutdown().await;
    }
}
