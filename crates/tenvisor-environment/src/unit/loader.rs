// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module loading: tenant artifact in, request handler out.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tenvisor_core::TenantApp;

use super::db::QueryExecutor;
use super::handler::{DefaultHandler, EchoHandler, HandlerContext, TenantHandler};
use crate::bundle::{BundleError, Bundler};

/// Turns a tenant artifact into a handler.
///
/// Implementations must not touch tenant storage directly; `db` is the only
/// path to the tenant's database.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Compile and load `tenant`'s module.
    async fn load(
        &self,
        tenant: &TenantApp,
        db: Arc<dyn QueryExecutor>,
    ) -> Result<Arc<dyn TenantHandler>, BundleError>;
}

/// Builds a custom handler from the loaded module's context.
pub type HandlerFactory = Arc<dyn Fn(HandlerContext) -> Arc<dyn TenantHandler> + Send + Sync>;

/// Named custom handlers a module may select with
/// `export const handler = "<name>"`.
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("echo", |ctx: HandlerContext| {
            Arc::new(EchoHandler::new(ctx.app_id)) as Arc<dyn TenantHandler>
        });
        registry
    }
}

impl HandlerRegistry {
    /// Registry without the built-in handlers.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register (or replace) a named handler.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(HandlerContext) -> Arc<dyn TenantHandler> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Build the handler registered as `name`.
    pub fn build(&self, name: &str, ctx: HandlerContext) -> Option<Arc<dyn TenantHandler>> {
        self.factories.get(name).map(|factory| factory(ctx))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Default loader: links with the [`Bundler`] and picks the custom handler
/// named by the module, falling back to [`DefaultHandler`].
#[derive(Clone, Default)]
pub struct BundleLoader {
    bundler: Bundler,
    registry: HandlerRegistry,
}

impl BundleLoader {
    /// Loader with an explicit bundler and registry.
    pub fn new(bundler: Bundler, registry: HandlerRegistry) -> Self {
        Self { bundler, registry }
    }

    /// Handler registry in use.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

#[async_trait]
impl ModuleLoader for BundleLoader {
    async fn load(
        &self,
        tenant: &TenantApp,
        db: Arc<dyn QueryExecutor>,
    ) -> Result<Arc<dyn TenantHandler>, BundleError> {
        let module = Arc::new(self.bundler.compile(&tenant.source)?);
        let custom = module.handler_name().map(str::to_string);

        let ctx = HandlerContext {
            app_id: tenant.id.clone(),
            persisted_data: tenant.persisted_data.clone(),
            module,
            db,
        };

        match custom {
            Some(name) => self
                .registry
                .build(&name, ctx)
                .ok_or(BundleError::UnknownHandler(name)),
            None => Ok(Arc::new(DefaultHandler::new(ctx))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::db::BrokerExecutor;
    use serde_json::json;
    use tenvisor_core::{DatabaseBroker, SourceArtifact};
    use tenvisor_protocol::RequestPayload;

    fn db() -> Arc<dyn QueryExecutor> {
        Arc::new(BrokerExecutor::new(
            Arc::new(DatabaseBroker::in_memory()),
            "app-1",
        ))
    }

    fn tenant(source: &str) -> TenantApp {
        TenantApp::new("app-1", "one", SourceArtifact::Module(source.to_string()))
    }

    #[tokio::test]
    async fn test_custom_handler_replaces_default() {
        let loader = BundleLoader::default();
        let handler = loader
            .load(&tenant("export const handler = \"echo\";"), db())
            .await
            .unwrap();

        // The echo handler answers /api/data itself instead of the data API.
        let response = handler.handle(RequestPayload::get("/api/data")).await.unwrap();
        assert_eq!(response.json_body().unwrap()["path"], json!("/api/data"));
    }

    #[tokio::test]
    async fn test_unknown_handler_is_compile_failure() {
        let loader = BundleLoader::default();
        let err = loader
            .load(&tenant("export const handler = 'ssr';"), db())
            .await
            .err()
            .unwrap();
        assert_eq!(err, BundleError::UnknownHandler("ssr".into()));
    }

    #[tokio::test]
    async fn test_registry_extension() {
        let mut registry = HandlerRegistry::default();
        registry.register("static", |_ctx| {
            Arc::new(EchoHandler::new("static")) as Arc<dyn TenantHandler>
        });
        assert_eq!(registry.names(), vec!["echo", "static"]);

        let loader = BundleLoader::new(Bundler::default(), registry);
        let handler = loader
            .load(&tenant("export const handler = 'static';"), db())
            .await
            .unwrap();
        let body = handler
            .handle(RequestPayload::get("/"))
            .await
            .unwrap()
            .json_body()
            .unwrap();
        assert_eq!(body["appId"], json!("static"));
    }

    #[tokio::test]
    async fn test_compile_errors_propagate() {
        let err = BundleLoader::default()
            .load(&tenant(""), db())
            .await
            .err()
            .unwrap();
        assert_eq!(err, BundleError::EmptySource);
    }
}
