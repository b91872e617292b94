// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant records and the tenant store abstraction.
//!
//! Tenants are produced by an external generation pipeline. The supervisor only
//! reads them, with one exception: the persisted data blob has a mutator.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryTenantStore;
pub use self::sqlite::SqliteTenantStore;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Tenant source as delivered by the generation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceArtifact {
    /// A single, already bundled module.
    Module(String),
    /// A map of relative file paths to file contents.
    Files(BTreeMap<String, String>),
}

impl SourceArtifact {
    /// Total size of all sources in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            SourceArtifact::Module(source) => source.len(),
            SourceArtifact::Files(files) => files.iter().map(|(k, v)| k.len() + v.len()).sum(),
        }
    }

    /// Whether the artifact is a multi-file map.
    pub fn is_multi_file(&self) -> bool {
        matches!(self, SourceArtifact::Files(_))
    }
}

/// A hosted tenant application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantApp {
    /// Stable canonical identity.
    pub id: String,
    /// Public alias used for routing.
    pub subdomain: Option<String>,
    /// Source artifact to load.
    pub source: SourceArtifact,
    /// Exempt from idle suspension.
    #[serde(default)]
    pub always_on: bool,
    /// Opaque data owned by the tenant's own schema.
    #[serde(default)]
    pub persisted_data: Value,
}

impl TenantApp {
    /// Create a tenant record with no persisted data.
    pub fn new(
        id: impl Into<String>,
        subdomain: impl Into<String>,
        source: SourceArtifact,
    ) -> Self {
        Self {
            id: id.into(),
            subdomain: Some(subdomain.into()),
            source,
            always_on: false,
            persisted_data: Value::Null,
        }
    }

    /// Set the always-on flag.
    pub fn with_always_on(mut self, always_on: bool) -> Self {
        self.always_on = always_on;
        self
    }

    /// Set the persisted data blob.
    pub fn with_persisted_data(mut self, data: Value) -> Self {
        self.persisted_data = data;
        self
    }

    /// Whether `key` names this tenant, by id or subdomain.
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.subdomain.as_deref() == Some(key)
    }
}

/// Durable tenant records.
#[async_trait::async_trait]
pub trait TenantStore: Send + Sync {
    /// Find a tenant by primary id, falling back to subdomain.
    async fn find_by_id_or_subdomain(&self, key: &str) -> Result<Option<TenantApp>>;

    /// Replace a tenant's persisted data blob.
    async fn update_persisted_data(&self, id: &str, data: &Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_artifact_untagged() {
        let single: SourceArtifact = serde_json::from_value(json!("export default 1")).unwrap();
        assert!(!single.is_multi_file());

        let files: SourceArtifact =
            serde_json::from_value(json!({"App.jsx": "x", "lib/util.js": "y"})).unwrap();
        assert!(files.is_multi_file());
        assert_eq!(files.size_bytes(), "App.jsx".len() + 1 + "lib/util.js".len() + 1);
    }

    #[test]
    fn test_tenant_matches_id_or_subdomain() {
        let app = TenantApp::new("app-1", "todo", SourceArtifact::Module(String::new()));
        assert!(app.matches("app-1"));
        assert!(app.matches("todo"));
        assert!(!app.matches("other"));
    }
}
