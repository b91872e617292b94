// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenvisor - Multi-Tenant App Runtime Supervisor
//!
//! An HTTP server responsible for:
//! - Routing tenant traffic by subdomain or `/apps/{tenant}` prefix
//! - Spawning, addressing and suspending per-tenant execution units
//! - Brokering tenant database access
//! - Operator endpoints under `/admin/units`

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use tenvisor_core::tenant::SqliteTenantStore;
use tenvisor_core::{BrokerConfig, DatabaseBroker};
use tenvisor_environment::config::Config;
use tenvisor_environment::http;
use tenvisor_environment::runtime::SupervisorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenvisor_environment=info,tenvisor_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        data_dir = %config.data_dir.display(),
        tenant_db = %config.tenant_db.display(),
        base_domain = ?config.base_domain,
        "Starting Tenvisor"
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let store = Arc::new(SqliteTenantStore::from_path(&config.tenant_db).await?);
    info!("Tenant store ready");

    let broker = Arc::new(DatabaseBroker::new(BrokerConfig::on_disk(&config.data_dir)));

    let runtime = SupervisorRuntime::builder()
        .config(&config)
        .store(store)
        .broker(broker)
        .build()?
        .start()
        .await?;

    let app = http::router(runtime.supervisor().clone(), config.base_domain.clone());
    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .context("failed to bind HTTP listener")?;

    info!(
        addr = %config.http_addr,
        mode = %runtime.supervisor().mode(),
        "Tenvisor ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    runtime.shutdown().await?;

    info!("Tenvisor shut down");

    Ok(())
}
