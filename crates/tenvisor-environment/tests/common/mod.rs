// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tenvisor-environment integration tests.
//!
//! Provides a [`TestContext`] wiring an in-memory tenant store, an in-memory
//! broker and a unit pool, plus loaders and handlers with scripted behaviour.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tenvisor_core::tenant::MemoryTenantStore;
use tenvisor_core::{DatabaseBroker, SourceArtifact, TenantApp};
use tenvisor_environment::bundle::BundleError;
use tenvisor_environment::unit::{
    BundleLoader, HandlerError, HandlerRegistry, ModuleLoader, QueryExecutor, TenantHandler,
};
use tenvisor_environment::{PoolConfig, PooledStrategy, Supervisor, UnitPool};
use tenvisor_protocol::{RequestPayload, ResponsePayload};

/// Single-module artifact.
pub fn module(source: &str) -> SourceArtifact {
    SourceArtifact::Module(source.to_string())
}

/// Multi-file artifact.
pub fn files(entries: &[(&str, &str)]) -> SourceArtifact {
    SourceArtifact::Files(
        entries
            .iter()
            .map(|(path, source)| (path.to_string(), source.to_string()))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// Tenant served by the built-in echo handler.
pub fn echo_tenant(id: &str, subdomain: &str) -> TenantApp {
    TenantApp::new(id, subdomain, module("export const handler = \"echo\";"))
}

/// Tenant served by the default page + data handler.
pub fn default_tenant(id: &str, subdomain: &str) -> TenantApp {
    TenantApp::new(
        id,
        subdomain,
        module("export const title = \"Groceries\";\nexport default function App() {}"),
    )
}

/// `window.__INITIAL_STATE__` embedded in a default-handler page.
pub fn initial_state(page: &ResponsePayload) -> serde_json::Value {
    let marker = "window.__INITIAL_STATE__ = ";
    let start = page.body.find(marker).unwrap() + marker.len();
    let end = start + page.body[start..].find(";</script>").unwrap();
    serde_json::from_str(&page.body[start..end]).unwrap()
}

/// Pool config with short bounds for tests.
pub fn fast_config() -> PoolConfig {
    PoolConfig {
        spawn_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    }
}

/// Test context with an in-memory store, broker and pool.
pub struct TestContext {
    pub store: Arc<MemoryTenantStore>,
    pub broker: Arc<DatabaseBroker>,
    pub pool: Arc<UnitPool>,
    pub supervisor: Supervisor,
}

impl TestContext {
    /// Context using the default loader.
    pub fn new() -> Self {
        Self::with_loader(Arc::new(BundleLoader::default()), fast_config())
    }

    /// Context using `loader` and `config`.
    pub fn with_loader(loader: Arc<dyn ModuleLoader>, config: PoolConfig) -> Self {
        let store = Arc::new(MemoryTenantStore::new());
        let broker = Arc::new(DatabaseBroker::in_memory());
        let pool = UnitPool::new(store.clone(), broker.clone(), loader, config);
        let supervisor = Supervisor::new(
            Arc::new(PooledStrategy::new(pool.clone())),
            Some(pool.clone()),
            store.clone(),
        );
        Self {
            store,
            broker,
            pool,
            supervisor,
        }
    }

    /// Add a tenant and return self for chaining.
    pub fn with_tenant(self, tenant: TenantApp) -> Self {
        self.store.insert(tenant);
        self
    }
}

/// Loader that counts loads and can delay each one.
///
/// Delays are consumed in order; once exhausted, loads are immediate.
pub struct ScriptedLoader {
    inner: BundleLoader,
    delays: Mutex<VecDeque<Duration>>,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new(inner: BundleLoader) -> Self {
        Self {
            inner,
            delays: Mutex::new(VecDeque::new()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_delays(self, delays: &[Duration]) -> Self {
        self.delays.lock().unwrap().extend(delays.iter().copied());
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleLoader for ScriptedLoader {
    async fn load(
        &self,
        tenant: &TenantApp,
        db: Arc<dyn QueryExecutor>,
    ) -> Result<Arc<dyn TenantHandler>, BundleError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.load(tenant, db).await
    }
}

/// Loader whose load panics, taking the unit task down with it.
pub struct PanickingLoader;

#[async_trait]
impl ModuleLoader for PanickingLoader {
    async fn load(
        &self,
        _tenant: &TenantApp,
        _db: Arc<dyn QueryExecutor>,
    ) -> Result<Arc<dyn TenantHandler>, BundleError> {
        panic!("loader blew up");
    }
}

/// Handler scripted by path:
/// - `/boom` fails
/// - `/panic` panics
/// - `/slow` sleeps for a minute
/// - anything else answers 200 with the path as body
pub struct ScriptedHandler;

#[async_trait]
impl TenantHandler for ScriptedHandler {
    async fn handle(&self, request: RequestPayload) -> Result<ResponsePayload, HandlerError> {
        match request.path.as_str() {
            "/boom" => Err(HandlerError::Failed("boom".to_string())),
            "/panic" => panic!("handler panicked"),
            "/slow" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ResponsePayload::text(200, "late"))
            }
            path => Ok(ResponsePayload::text(200, path)),
        }
    }
}

/// Default loader with `scripted` registered.
pub fn scripted_loader() -> BundleLoader {
    let mut registry = HandlerRegistry::default();
    registry.register("scripted", |_ctx| {
        Arc::new(ScriptedHandler) as Arc<dyn TenantHandler>
    });
    BundleLoader::new(Default::default(), registry)
}

/// Tenant selecting the scripted handler.
pub fn scripted_tenant(id: &str, subdomain: &str) -> TenantApp {
    TenantApp::new(id, subdomain, module("export const handler = \"scripted\";"))
}
