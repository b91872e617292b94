// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed tenant store.

use std::path::Path;

use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{SourceArtifact, TenantApp, TenantStore};
use crate::error::{Result, StoreError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: String,
    subdomain: Option<String>,
    source: String,
    always_on: bool,
    persisted_data: String,
}

impl TryFrom<TenantRow> for TenantApp {
    type Error = StoreError;

    fn try_from(row: TenantRow) -> Result<Self> {
        let source: SourceArtifact =
            serde_json::from_str(&row.source).map_err(|e| StoreError::InvalidRecord {
                id: row.id.clone(),
                reason: format!("source: {}", e),
            })?;
        let persisted_data: Value =
            serde_json::from_str(&row.persisted_data).map_err(|e| StoreError::InvalidRecord {
                id: row.id.clone(),
                reason: format!("persisted_data: {}", e),
            })?;

        Ok(TenantApp {
            id: row.id,
            subdomain: row.subdomain,
            source,
            always_on: row.always_on,
            persisted_data,
        })
    }
}

/// SQLite-backed tenant store.
#[derive(Clone)]
pub struct SqliteTenantStore {
    pool: SqlitePool,
}

impl SqliteTenantStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the store at `path` and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteTenantStore::from_path(".data/tenants.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open a private in-memory store (single connection, never recycled).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Insert or replace a tenant record.
    pub async fn upsert(&self, tenant: &TenantApp) -> Result<()> {
        let source = serde_json::to_string(&tenant.source).map_err(|e| {
            StoreError::InvalidRecord {
                id: tenant.id.clone(),
                reason: e.to_string(),
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO tenants (id, subdomain, source, always_on, persisted_data)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                subdomain = excluded.subdomain,
                source = excluded.source,
                always_on = excluded.always_on,
                persisted_data = excluded.persisted_data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.subdomain)
        .bind(source)
        .bind(tenant.always_on)
        .bind(tenant.persisted_data.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Set the always-on flag.
    pub async fn set_always_on(&self, id: &str, always_on: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenants SET always_on = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(always_on)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// List all tenants ordered by id.
    pub async fn list(&self) -> Result<Vec<TenantApp>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT id, subdomain, source, always_on, persisted_data FROM tenants ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantApp::try_from).collect()
    }

    async fn fetch_one_by(&self, column: &str, key: &str) -> Result<Option<TenantApp>> {
        let sql = format!(
            "SELECT id, subdomain, source, always_on, persisted_data FROM tenants WHERE {} = ?",
            column
        );
        sqlx::query_as::<_, TenantRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(TenantApp::try_from)
            .transpose()
    }
}

#[async_trait::async_trait]
impl TenantStore for SqliteTenantStore {
    async fn find_by_id_or_subdomain(&self, key: &str) -> Result<Option<TenantApp>> {
        if let Some(tenant) = self.fetch_one_by("id", key).await? {
            return Ok(Some(tenant));
        }
        self.fetch_one_by("subdomain", key).await
    }

    async fn update_persisted_data(&self, id: &str, data: &Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenants SET persisted_data = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(data.to_string())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
