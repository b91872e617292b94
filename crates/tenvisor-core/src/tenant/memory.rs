// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory tenant store for tests and embedding.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use super::{TenantApp, TenantStore};
use crate::error::{Result, StoreError};

/// Tenant store backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryTenantStore {
    tenants: RwLock<HashMap<String, TenantApp>>,
}

impl MemoryTenantStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tenant.
    pub fn insert(&self, tenant: TenantApp) {
        self.write().insert(tenant.id.clone(), tenant);
    }

    /// Remove a tenant, returning it if present.
    pub fn remove(&self, id: &str) -> Option<TenantApp> {
        self.write().remove(id)
    }

    /// Flip the always-on flag. Returns false if the tenant is unknown.
    pub fn set_always_on(&self, id: &str, always_on: bool) -> bool {
        match self.write().get_mut(id) {
            Some(tenant) => {
                tenant.always_on = always_on;
                true
            }
            None => false,
        }
    }

    /// Fetch a tenant by canonical id.
    pub fn get(&self, id: &str) -> Option<TenantApp> {
        self.read().get(id).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TenantApp>> {
        self.tenants.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TenantApp>> {
        self.tenants.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl TenantStore for MemoryTenantStore {
    async fn find_by_id_or_subdomain(&self, key: &str) -> Result<Option<TenantApp>> {
        let tenants = self.read();
        if let Some(tenant) = tenants.get(key) {
            return Ok(Some(tenant.clone()));
        }
        Ok(tenants
            .values()
            .find(|t| t.subdomain.as_deref() == Some(key))
            .cloned())
    }

    async fn update_persisted_data(&self, id: &str, data: &Value) -> Result<()> {
        let mut tenants = self.write();
        let tenant = tenants
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        tenant.persisted_data = data.clone();
        Ok(())
    }
}
