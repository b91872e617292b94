// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that suspends idle tenants.
//!
//! On every poll the watchdog walks the running units, reads each tenant's
//! `always_on` flag from the tenant store and suspends units whose last
//! activity is older than the idle timeout. A suspended unit is `sleeping`;
//! the next request for the tenant spawns a fresh one.
//!
//! There is exactly one eviction path: [`UnitPool::suspend`]. The watchdog
//! never force-terminates.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pool::UnitPool;

/// Configuration for the idle watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Inactivity after which a unit is suspended.
    pub idle_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Suspends idle, non-always-on units.
pub struct IdleWatchdog {
    pool: Arc<UnitPool>,
    config: WatchdogConfig,
    shutdown: Arc<Notify>,
}

impl IdleWatchdog {
    /// Create a watchdog over `pool`.
    pub fn new(pool: Arc<UnitPool>, config: WatchdogConfig) -> Self {
        Self {
            pool,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Idle watchdog started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Idle watchdog received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Idle sweep failed");
                    }
                }
            }
        }

        info!("Idle watchdog stopped");
    }

    /// One pass over the running units. Returns how many were suspended.
    pub async fn sweep(&self) -> Result<usize> {
        let idle = chrono::Duration::from_std(self.config.idle_timeout)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        let cutoff = Utc::now() - idle;

        let idle_units: Vec<_> = self
            .pool
            .running_units()
            .into_iter()
            .filter(|(_, last_activity)| *last_activity < cutoff)
            .collect();
        if idle_units.is_empty() {
            debug!("No idle units found");
            return Ok(0);
        }

        let mut suspended = 0;
        for (app_id, last_activity) in idle_units {
            let tenant = match self.pool.store().find_by_id_or_subdomain(&app_id).await {
                Ok(Some(tenant)) => tenant,
                Ok(None) => {
                    warn!(app_id = %app_id, "Running unit has no tenant record; skipping");
                    continue;
                }
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "Tenant lookup failed during sweep; skipping");
                    continue;
                }
            };
            if tenant.always_on {
                debug!(app_id = %app_id, "Idle unit is always-on; keeping");
                continue;
            }

            // Activity may have arrived while the store was being read.
            let still_idle = self
                .pool
                .unit(&app_id)
                .is_some_and(|unit| unit.last_activity == last_activity);
            if still_idle && self.pool.suspend(&app_id) {
                suspended += 1;
            }
        }

        if suspended > 0 {
            info!(suspended, "Suspended idle units");
        }
        Ok(suspended)
    }
}
