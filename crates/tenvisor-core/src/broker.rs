// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-tenant database broker.
//!
//! The broker is the only component that opens tenant databases. Each tenant
//! gets exactly one SQLite connection, opened on first use and reused until
//! explicitly closed. Queries for one tenant serialize on that connection;
//! queries for different tenants never contend.
//!
//! Storage failures are returned as [`QueryOutcome::Error`] so a single bad
//! statement cannot take down the execution unit that issued it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, ConnectOptions, Row, Sqlite, TypeInfo, ValueRef};
use tenvisor_protocol::QueryOutcome;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

type SharedConnection = Arc<Mutex<SqliteConnection>>;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory holding `apps/<tenant>.db`. `None` keeps every tenant in memory.
    pub data_dir: Option<PathBuf>,
    /// How long a statement waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Persist tenant databases under `data_dir`.
    pub fn on_disk(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }
}

/// Read/write classification of a statement, by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows.
    Read,
    /// Returns change metadata.
    Write,
}

impl StatementKind {
    /// Classify `sql`, skipping leading whitespace, comments and parentheses.
    pub fn classify(sql: &str) -> Self {
        match leading_keyword(sql).to_ascii_uppercase().as_str() {
            "SELECT" | "WITH" | "PRAGMA" | "EXPLAIN" | "VALUES" => StatementKind::Read,
            _ => StatementKind::Write,
        }
    }
}

fn leading_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }
    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// File name for a tenant database. Ids that are not filesystem-safe are hashed.
fn database_file_name(tenant_id: &str) -> String {
    let safe = !tenant_id.is_empty()
        && tenant_id.len() <= 64
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        format!("{}.db", tenant_id)
    } else {
        format!("{:x}.db", Sha256::digest(tenant_id.as_bytes()))
    }
}

/// Owns one SQLite connection per tenant.
pub struct DatabaseBroker {
    config: BrokerConfig,
    connections: std::sync::Mutex<HashMap<String, Arc<OnceCell<SharedConnection>>>>,
}

impl Default for DatabaseBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl DatabaseBroker {
    /// Create a broker. No connection is opened until the first query.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            connections: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Broker keeping every tenant database in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Path of the tenant's database file, if the broker is on disk.
    pub fn database_path(&self, tenant_id: &str) -> Option<PathBuf> {
        self.config
            .data_dir
            .as_ref()
            .map(|dir| dir.join("apps").join(database_file_name(tenant_id)))
    }

    /// Number of tenants with an open (or opening) connection.
    pub fn open_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Whether the tenant has a cached connection.
    pub fn is_open(&self, tenant_id: &str) -> bool {
        self.lock_connections()
            .get(tenant_id)
            .is_some_and(|cell| cell.initialized())
    }

    /// Execute a statement on behalf of a tenant.
    pub async fn query(&self, tenant_id: &str, sql: &str, params: &[Value]) -> QueryOutcome {
        if sql.trim().is_empty() {
            return QueryOutcome::error("empty statement");
        }

        let connection = match self.connection(tenant_id).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(app_id = %tenant_id, error = %e, "Failed to open tenant database");
                return QueryOutcome::error(format!("failed to open database: {}", e));
            }
        };

        let kind = StatementKind::classify(sql);
        let query = bind_params(sqlx::query(sql), params);
        let mut conn = connection.lock().await;

        let outcome = match kind {
            StatementKind::Read => match query.fetch_all(&mut *conn).await {
                Ok(rows) => rows
                    .iter()
                    .map(row_to_json)
                    .collect::<Result<Vec<_>, _>>()
                    .map(QueryOutcome::Rows)
                    .unwrap_or_else(|e| QueryOutcome::error(e.to_string())),
                Err(e) => QueryOutcome::error(e.to_string()),
            },
            StatementKind::Write => match query.execute(&mut *conn).await {
                Ok(result) => QueryOutcome::Write {
                    last_insert_id: result.last_insert_rowid(),
                    changes: result.rows_affected(),
                },
                Err(e) => QueryOutcome::error(e.to_string()),
            },
        };

        if let Some(error) = outcome.error_message() {
            debug!(app_id = %tenant_id, error = %error, "Tenant statement failed");
        }

        outcome
    }

    /// Close and forget a tenant's connection. Returns whether one was cached.
    pub async fn close(&self, tenant_id: &str) -> bool {
        let cell = self.lock_connections().remove(tenant_id);
        let Some(cell) = cell else {
            return false;
        };

        if let Some(connection) = cell.get() {
            // Wait for any statement in progress before dropping the handle.
            let _guard = connection.lock().await;
        }
        if let Some(connection) = Arc::into_inner(cell).and_then(OnceCell::into_inner)
            && let Some(connection) = Arc::into_inner(connection)
            && let Err(e) = sqlx::Connection::close(connection.into_inner()).await
        {
            warn!(app_id = %tenant_id, error = %e, "Error closing tenant database");
        }

        debug!(app_id = %tenant_id, "Tenant database closed");
        true
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let tenants: Vec<String> = self.lock_connections().keys().cloned().collect();
        for tenant_id in &tenants {
            self.close(tenant_id).await;
        }
        if !tenants.is_empty() {
            info!(count = tenants.len(), "Closed tenant databases");
        }
    }

    async fn connection(&self, tenant_id: &str) -> Result<SharedConnection, sqlx::Error> {
        let cell = self
            .lock_connections()
            .entry(tenant_id.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            let conn = self.open(tenant_id).await?;
            Ok::<_, sqlx::Error>(Arc::new(Mutex::new(conn)))
        })
        .await
        .cloned()
    }

    async fn open(&self, tenant_id: &str) -> Result<SqliteConnection, sqlx::Error> {
        let options = match self.database_path(tenant_id) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
            }
            None => SqliteConnectOptions::from_str("sqlite::memory:")?,
        }
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(self.config.busy_timeout)
        .foreign_keys(true);

        let conn = options.connect().await?;
        debug!(
            app_id = %tenant_id,
            path = ?self.database_path(tenant_id),
            "Opened tenant database"
        );
        Ok(conn)
    }

    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<OnceCell<SharedConnection>>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn row_to_json(row: &SqliteRow) -> Result<Map<String, Value>, sqlx::Error> {
    let mut object = Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "INT8" | "BOOLEAN" => {
                    Value::from(row.try_get_unchecked::<i64, _>(idx)?)
                }
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                    serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(idx)?)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
                "BLOB" => Value::String(BASE64.encode(row.try_get_unchecked::<Vec<u8>, _>(idx)?)),
                _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(object)
}
