// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable supervisor runtime.
//!
//! [`SupervisorRuntime`] wires the tenant store, database broker and module
//! loader into a [`Supervisor`] and, in pooled mode, starts the idle watchdog.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenvisor_core::{DatabaseBroker, BrokerConfig};
//! use tenvisor_core::tenant::SqliteTenantStore;
//! use tenvisor_environment::runtime::SupervisorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteTenantStore::from_path(".data/tenants.db").await?);
//!     let broker = Arc::new(DatabaseBroker::new(BrokerConfig::on_disk(".data/apps")));
//!
//!     let runtime = SupervisorRuntime::builder()
//!         .store(store)
//!         .broker(broker)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let supervisor = runtime.supervisor().clone();
//!     // ... serve requests through `supervisor` ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tenvisor_core::{DatabaseBroker, TenantStore};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::pool::{PoolConfig, UnitPool};
use crate::stateless::StatelessStrategy;
use crate::strategy::{ExecutionMode, ExecutionStrategy, PooledStrategy};
use crate::supervisor::Supervisor;
use crate::unit::{BundleLoader, ModuleLoader, ResourceLimits};
use crate::watchdog::{IdleWatchdog, WatchdogConfig};

/// Builder for creating a [`SupervisorRuntime`].
pub struct SupervisorRuntimeBuilder {
    store: Option<Arc<dyn TenantStore>>,
    broker: Option<Arc<DatabaseBroker>>,
    loader: Option<Arc<dyn ModuleLoader>>,
    mode: Option<ExecutionMode>,
    spawn_timeout: Duration,
    request_timeout: Duration,
    idle_timeout: Duration,
    watchdog_interval: Duration,
    default_limits: ResourceLimits,
    channel_capacity: usize,
}

impl Default for SupervisorRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            broker: None,
            loader: None,
            mode: None,
            spawn_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),      // 10 minutes
            watchdog_interval: Duration::from_secs(60), // 1 minute
            default_limits: ResourceLimits::default(),
            channel_capacity: 64,
        }
    }
}

impl SupervisorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take mode and timeouts from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.mode = config.execution_mode;
        self.spawn_timeout = config.spawn_timeout;
        self.request_timeout = config.request_timeout;
        self.idle_timeout = config.idle_timeout;
        self.watchdog_interval = config.watchdog_interval;
        self
    }

    /// Set the tenant store (required).
    pub fn store(mut self, store: Arc<dyn TenantStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the database broker (required).
    pub fn broker(mut self, broker: Arc<DatabaseBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the module loader.
    ///
    /// Default: [`BundleLoader::default()`]
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Force an execution mode.
    ///
    /// Default: [`ExecutionMode::detect()`]
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set how long a unit may take to report ready.
    ///
    /// Default: 20 seconds
    pub fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Set the default bound on a single request.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the inactivity after which a unit is suspended.
    ///
    /// Default: 10 minutes
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the watchdog sweep interval.
    ///
    /// Default: 1 minute
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Set the limits for tenants without an override.
    pub fn default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Set the capacity of each unit's channels.
    ///
    /// Default: 64
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or values are unusable.
    pub fn build(self) -> Result<SupervisorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker is required"))?;
        for (name, value) in [
            ("spawn_timeout", self.spawn_timeout),
            ("request_timeout", self.request_timeout),
            ("idle_timeout", self.idle_timeout),
            ("watchdog_interval", self.watchdog_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be greater than zero");
        }
        self.default_limits
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid default limits: {}", e))?;

        Ok(SupervisorRuntimeConfig {
            store,
            broker,
            loader: self
                .loader
                .unwrap_or_else(|| Arc::new(BundleLoader::default())),
            mode: self.mode.unwrap_or_else(ExecutionMode::detect),
            pool: PoolConfig {
                spawn_timeout: self.spawn_timeout,
                request_timeout: self.request_timeout,
                default_limits: self.default_limits,
                channel_capacity: self.channel_capacity,
            },
            watchdog: WatchdogConfig {
                poll_interval: self.watchdog_interval,
                idle_timeout: self.idle_timeout,
            },
        })
    }
}

/// Configuration for a [`SupervisorRuntime`].
pub struct SupervisorRuntimeConfig {
    store: Arc<dyn TenantStore>,
    broker: Arc<DatabaseBroker>,
    loader: Arc<dyn ModuleLoader>,
    mode: ExecutionMode,
    pool: PoolConfig,
    watchdog: WatchdogConfig,
}

impl SupervisorRuntimeConfig {
    /// Execution mode the runtime will use.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Start the runtime: build the strategy and, in pooled mode, the watchdog.
    pub async fn start(self) -> Result<SupervisorRuntime> {
        let (supervisor, watchdog) = match self.mode {
            ExecutionMode::Pooled => {
                let pool = UnitPool::new(
                    self.store.clone(),
                    self.broker.clone(),
                    self.loader.clone(),
                    self.pool,
                );
                let strategy: Arc<dyn ExecutionStrategy> =
                    Arc::new(PooledStrategy::new(pool.clone()));

                let watchdog = IdleWatchdog::new(pool.clone(), self.watchdog);
                let shutdown = watchdog.shutdown_handle();
                let handle = tokio::spawn(async move {
                    watchdog.run().await;
                });

                (
                    Supervisor::new(strategy, Some(pool), self.store),
                    Some((handle, shutdown)),
                )
            }
            ExecutionMode::Stateless => {
                let strategy: Arc<dyn ExecutionStrategy> = Arc::new(StatelessStrategy::new(
                    self.store.clone(),
                    self.broker,
                    self.loader,
                ));
                (Supervisor::new(strategy, None, self.store), None)
            }
        };

        info!(
            mode = %self.mode,
            watchdog = watchdog.is_some(),
            "SupervisorRuntime started"
        );

        Ok(SupervisorRuntime {
            supervisor: Arc::new(supervisor),
            watchdog,
        })
    }
}

/// A running supervisor that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct SupervisorRuntime {
    supervisor: Arc<Supervisor>,
    watchdog: Option<(JoinHandle<()>, Arc<Notify>)>,
}

impl SupervisorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SupervisorRuntimeBuilder {
        SupervisorRuntimeBuilder::new()
    }

    /// The supervisor.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        self.watchdog
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the watchdog and waits for it, then stops every unit and closes
    /// every tenant database.
    pub async fn shutdown(self) -> Result<()> {
        info!("SupervisorRuntime shutting down...");

        if let Some((handle, shutdown)) = self.watchdog {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Idle watchdog task panicked: {}", e);
            }
        }

        self.supervisor.shutdown().await;

        info!("SupervisorRuntime shutdown complete");
        Ok(())
    }
}
