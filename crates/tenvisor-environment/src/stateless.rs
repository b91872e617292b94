// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stateless strategy: every request builds the tenant context from scratch
//! and runs in the caller's task.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tenvisor_core::{DatabaseBroker, TenantStore};
use tenvisor_protocol::{RequestPayload, ResponsePayload};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::find_tenant;
use crate::strategy::{ExecutionMode, ExecutionStrategy};
use crate::unit::{BrokerExecutor, HandlerError, ModuleLoader};

/// No units, no messages, no watchdog.
pub struct StatelessStrategy {
    store: Arc<dyn TenantStore>,
    broker: Arc<DatabaseBroker>,
    loader: Arc<dyn ModuleLoader>,
}

impl StatelessStrategy {
    /// Create the strategy.
    pub fn new(
        store: Arc<dyn TenantStore>,
        broker: Arc<DatabaseBroker>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        Self {
            store,
            broker,
            loader,
        }
    }
}

#[async_trait]
impl ExecutionStrategy for StatelessStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Stateless
    }

    async fn request(&self, key: &str, payload: RequestPayload) -> Result<ResponsePayload> {
        let started = Instant::now();
        let tenant = find_tenant(self.store.as_ref(), key).await?;

        let db = Arc::new(BrokerExecutor::new(self.broker.clone(), tenant.id.clone()));
        let handler = self
            .loader
            .load(&tenant, db)
            .await
            .map_err(|e| compile_failure(&tenant.id, e.to_string()))?;
        handler
            .init()
            .await
            .map_err(|e| compile_failure(&tenant.id, e.to_string()))?;

        let response = handler.handle(payload).await.map_err(|e| match e {
            HandlerError::Storage(message) | HandlerError::Failed(message) => {
                Error::HandlerFault(message)
            }
        })?;

        debug!(
            app_id = %tenant.id,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stateless request complete"
        );
        Ok(response)
    }

    async fn shutdown(&self) {
        self.broker.close_all().await;
    }
}

fn compile_failure(app_id: &str, message: String) -> Error {
    warn!(app_id = %app_id, error = %message, "Tenant module failed to load");
    Error::CompileFailure {
        app_id: app_id.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tenvisor_core::SourceArtifact;
    use tenvisor_core::TenantApp;
    use tenvisor_core::tenant::MemoryTenantStore;

    use crate::unit::BundleLoader;

    fn strategy(store: MemoryTenantStore) -> StatelessStrategy {
        StatelessStrategy::new(
            Arc::new(store),
            Arc::new(DatabaseBroker::in_memory()),
            Arc::new(BundleLoader::default()),
        )
    }

    #[tokio::test]
    async fn test_data_round_trip_without_units() {
        let store = MemoryTenantStore::new();
        store.insert(TenantApp::new(
            "app-1",
            "one",
            SourceArtifact::Module("export default function App() {}".into()),
        ));
        let strategy = strategy(store);

        let created = strategy
            .request(
                "one",
                RequestPayload::new("POST", "/api/data").with_json(&json!({"title": "milk"})),
            )
            .await
            .unwrap();
        assert_eq!(created.status, 201);

        let listed = strategy
            .request("app-1", RequestPayload::get("/api/data"))
            .await
            .unwrap();
        let body = listed.json_body().unwrap();
        assert_eq!(body[0]["data"]["title"], json!("milk"));
    }

    #[tokio::test]
    async fn test_errors_and_unsupported_admin() {
        let store = MemoryTenantStore::new();
        store.insert(TenantApp::new(
            "broken",
            "broken",
            SourceArtifact::Module("export const handler = 'nope';".into()),
        ));
        let strategy = strategy(store);

        let err = strategy
            .request("missing", RequestPayload::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TenantNotFound(_)));

        let err = strategy
            .request("broken", RequestPayload::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CompileFailure { .. }));
        assert!(err.is_unit_not_running());

        let err = strategy.stop("broken").await.unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED");
        assert!(strategy.list_units().await.is_empty());
    }

    #[tokio::test]
    async fn test_tenant_without_subdomain_is_not_found() {
        let store = MemoryTenantStore::new();
        let mut tenant = TenantApp::new(
            "app-2",
            "two",
            SourceArtifact::Module("export const handler = \"echo\";".into()),
        );
        tenant.subdomain = None;
        store.insert(tenant);
        let strategy = strategy(store);

        let err = strategy
            .request("app-2", RequestPayload::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TenantNotFound(ref key) if key == "app-2"));
    }
}
