// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant request handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tenvisor_protocol::{QueryOutcome, RequestPayload, ResponsePayload};
use thiserror::Error;
use uuid::Uuid;

use super::db::QueryExecutor;
use crate::bundle::CompiledModule;

const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS app_records (
    id TEXT PRIMARY KEY,
    collection TEXT NOT NULL DEFAULT 'default',
    data TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

const CREATE_META_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)";

const UPSERT_RECORD: &str = r#"
INSERT INTO app_records (id, data) VALUES (?, ?)
ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = CURRENT_TIMESTAMP
"#;

/// Record holding a `persistedData` value that is not an object.
const WHOLE_VALUE_ID: &str = "data";

const SELECT_RECORDS: &str =
    "SELECT id, collection, data, created_at, updated_at FROM app_records";

/// Handler failures. Each one fails a single request; the unit stays usable.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// A brokered statement failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The handler could not produce a response.
    #[error("{0}")]
    Failed(String),
}

/// Everything a handler gets from the unit that loaded it.
#[derive(Clone)]
pub struct HandlerContext {
    /// Canonical tenant id.
    pub app_id: String,
    /// Tenant's persisted data blob at load time. The default handler seeds
    /// its records from it.
    pub persisted_data: Value,
    /// Linked module.
    pub module: Arc<CompiledModule>,
    /// Tenant database access.
    pub db: Arc<dyn QueryExecutor>,
}

/// Answers requests for one tenant.
#[async_trait]
pub trait TenantHandler: Send + Sync {
    /// One-time setup run during bootstrap, before `ready`.
    async fn init(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Handle a single request.
    async fn handle(&self, request: RequestPayload) -> Result<ResponsePayload, HandlerError>;
}

/// Page, client module and data API for a tenant without a custom handler.
///
/// The tenant's `persistedData` lives in the `app_records` table, one record
/// per top-level key, so the data API changes exactly what the page embeds.
pub struct DefaultHandler {
    ctx: HandlerContext,
}

impl DefaultHandler {
    /// Default handler over `ctx`.
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn run(&self, sql: &str, params: Vec<Value>) -> Result<QueryOutcome, HandlerError> {
        let outcome = self.ctx.db.query(sql, params).await;
        match outcome.error_message() {
            Some(message) => Err(HandlerError::Storage(message.to_string())),
            None => Ok(outcome),
        }
    }

    async fn list_records(&self, collection: Option<&str>) -> Result<Vec<Value>, HandlerError> {
        let outcome = match collection {
            Some(c) => {
                self.run(
                    &format!("{} WHERE collection = ? ORDER BY created_at, rowid", SELECT_RECORDS),
                    vec![json!(c)],
                )
                .await?
            }
            None => {
                self.run(&format!("{} ORDER BY created_at, rowid", SELECT_RECORDS), vec![])
                    .await?
            }
        };
        Ok(outcome
            .rows()
            .unwrap_or_default()
            .iter()
            .map(record_json)
            .collect())
    }

    /// Records keyed by id, the shape `persistedData` is stored in.
    async fn persisted_state(&self) -> Result<Value, HandlerError> {
        let state: Map<String, Value> = self
            .list_records(None)
            .await?
            .into_iter()
            .filter_map(|record| {
                let id = record.get("id")?.as_str()?.to_string();
                Some((id, record.get("data").cloned().unwrap_or(Value::Null)))
            })
            .collect();
        Ok(Value::Object(state))
    }

    /// Write `persistedData` into the records table.
    ///
    /// Each distinct value is applied once. A respawn with the same value
    /// keeps what the data API changed since; a new value written to the
    /// store replaces the records it names.
    async fn seed(&self) -> Result<(), HandlerError> {
        let seed = self.ctx.persisted_data.to_string();
        let applied = self
            .run("SELECT value FROM app_meta WHERE key = 'seed'", vec![])
            .await?;
        let unchanged = applied
            .rows()
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("value"))
            .and_then(Value::as_str)
            == Some(seed.as_str());
        if unchanged {
            return Ok(());
        }

        match &self.ctx.persisted_data {
            Value::Null => {}
            Value::Object(entries) => {
                for (id, data) in entries {
                    self.run(UPSERT_RECORD, vec![json!(id), json!(data.to_string())])
                        .await?;
                }
            }
            other => {
                self.run(
                    UPSERT_RECORD,
                    vec![json!(WHOLE_VALUE_ID), json!(other.to_string())],
                )
                .await?;
            }
        }

        self.run(
            "INSERT INTO app_meta (key, value) VALUES ('seed', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            vec![json!(seed)],
        )
        .await?;
        Ok(())
    }

    async fn find_record(&self, id: &str) -> Result<Option<Value>, HandlerError> {
        let outcome = self
            .run(&format!("{} WHERE id = ?", SELECT_RECORDS), vec![json!(id)])
            .await?;
        Ok(outcome.rows().and_then(|rows| rows.first()).map(record_json))
    }

    async fn create_record(&self, request: &RequestPayload) -> Result<ResponsePayload, HandlerError> {
        let body = match parse_body(request) {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        let id = body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let collection = request
            .query_param("collection")
            .or_else(|| body.get("collection").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "default".to_string());
        let data = record_data(&body);

        self.run(
            "INSERT INTO app_records (id, collection, data) VALUES (?, ?, ?)",
            vec![json!(id), json!(collection), json!(data.to_string())],
        )
        .await?;

        match self.find_record(&id).await? {
            Some(record) => Ok(ResponsePayload::json(201, &record)),
            None => Err(HandlerError::Failed(format!(
                "record {} vanished after insert",
                id
            ))),
        }
    }

    async fn update_record(
        &self,
        id: &str,
        request: &RequestPayload,
    ) -> Result<ResponsePayload, HandlerError> {
        let body = match parse_body(request) {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        let outcome = self
            .run(
                "UPDATE app_records SET data = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
                vec![json!(record_data(&body).to_string()), json!(id)],
            )
            .await?;
        if outcome.changes() == Some(0) {
            return Ok(not_found());
        }

        match self.find_record(id).await? {
            Some(record) => Ok(ResponsePayload::json(200, &record)),
            None => Ok(not_found()),
        }
    }

    async fn delete_record(&self, id: &str) -> Result<ResponsePayload, HandlerError> {
        let outcome = self
            .run("DELETE FROM app_records WHERE id = ?", vec![json!(id)])
            .await?;
        if outcome.changes() == Some(0) {
            return Ok(not_found());
        }
        Ok(ResponsePayload::new(204))
    }

    fn client_module(&self, request: &RequestPayload) -> ResponsePayload {
        let client = &self.ctx.module.client;
        if request.headers.get("if-none-match") == Some(&client.etag) {
            return ResponsePayload::new(304).with_header("etag", client.etag.clone());
        }
        ResponsePayload::new(200)
            .with_header("content-type", "application/javascript; charset=utf-8")
            .with_header("cache-control", "no-cache")
            .with_header("etag", client.etag.clone())
            .with_body(client.source.clone())
    }

    async fn page(&self, request: &RequestPayload) -> Result<ResponsePayload, HandlerError> {
        let state = json!({ "persistedData": self.persisted_state().await? });
        let title = self.ctx.module.export("title").unwrap_or(&self.ctx.app_id);
        let prefix = request
            .headers
            .get("x-forwarded-prefix")
            .map(|p| p.trim_end_matches('/'))
            .unwrap_or("");

        Ok(ResponsePayload::html(render_page(title, &state, prefix)))
    }
}

#[async_trait]
impl TenantHandler for DefaultHandler {
    async fn init(&self) -> Result<(), HandlerError> {
        self.run(CREATE_RECORDS_TABLE, vec![]).await?;
        self.run(CREATE_META_TABLE, vec![]).await?;
        self.seed().await
    }

    async fn handle(&self, request: RequestPayload) -> Result<ResponsePayload, HandlerError> {
        let path = request.path.trim_end_matches('/');
        let method = match request.method.as_str() {
            "HEAD" => "GET",
            other => other,
        };

        if path == "/api/data" {
            return match method {
                "GET" => {
                    let collection = request.query_param("collection");
                    let records = self.list_records(collection.as_deref()).await?;
                    Ok(ResponsePayload::json(200, &Value::Array(records)))
                }
                "POST" => self.create_record(&request).await,
                _ => Ok(method_not_allowed("GET, POST")),
            };
        }

        if let Some(id) = path.strip_prefix("/api/data/") {
            return match method {
                "GET" => match self.find_record(id).await? {
                    Some(record) => Ok(ResponsePayload::json(200, &record)),
                    None => Ok(not_found()),
                },
                "PUT" => self.update_record(id, &request).await,
                "DELETE" => self.delete_record(id).await,
                _ => Ok(method_not_allowed("GET, PUT, DELETE")),
            };
        }

        if path.starts_with("/api/") {
            return Ok(ResponsePayload::json(404, &json!({"error": "Unknown API route"})));
        }

        if method != "GET" {
            return Ok(method_not_allowed("GET"));
        }
        if path == "/app.js" {
            return Ok(self.client_module(&request));
        }
        self.page(&request).await
    }
}

/// Returns the request back as JSON. Registered under the name `echo`.
pub struct EchoHandler {
    app_id: String,
}

impl EchoHandler {
    /// Echo handler for `app_id`.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
        }
    }
}

#[async_trait]
impl TenantHandler for EchoHandler {
    async fn handle(&self, request: RequestPayload) -> Result<ResponsePayload, HandlerError> {
        Ok(ResponsePayload::json(
            200,
            &json!({
                "appId": self.app_id,
                "method": request.method,
                "path": request.path,
                "query": request.query,
                "headers": request.headers,
                "body": request.body,
            }),
        ))
    }
}

fn record_json(row: &Map<String, Value>) -> Value {
    let data = match row.get("data") {
        Some(Value::String(text)) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        Some(other) => other.clone(),
        None => Value::Null,
    };
    json!({
        "id": row.get("id").cloned().unwrap_or(Value::Null),
        "collection": row.get("collection").cloned().unwrap_or(Value::Null),
        "data": data,
        "createdAt": row.get("created_at").cloned().unwrap_or(Value::Null),
        "updatedAt": row.get("updated_at").cloned().unwrap_or(Value::Null),
    })
}

/// `{"data": …}` bodies store the inner value; anything else is stored whole.
fn record_data(body: &Value) -> Value {
    match body.get("data") {
        Some(data) => data.clone(),
        None => body.clone(),
    }
}

fn parse_body(request: &RequestPayload) -> Result<Value, ResponsePayload> {
    let text = request.body.as_deref().unwrap_or("").trim();
    if text.is_empty() {
        return Err(ResponsePayload::json(
            400,
            &json!({"error": "Request body is required"}),
        ));
    }
    serde_json::from_str(text).map_err(|e| {
        ResponsePayload::json(400, &json!({"error": format!("Invalid JSON body: {}", e)}))
    })
}

fn not_found() -> ResponsePayload {
    ResponsePayload::json(404, &json!({"error": "Record not found"}))
}

fn method_not_allowed(allow: &str) -> ResponsePayload {
    ResponsePayload::json(405, &json!({"error": "Method not allowed"})).with_header("allow", allow)
}

fn render_page(title: &str, state: &Value, prefix: &str) -> String {
    // "</" inside the JSON would end the script element early.
    let state = state.to_string().replace("</", "<\\/");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
</head>
<body>
<div id="root"></div>
<script>window.__INITIAL_STATE__ = {state};</script>
<script type="module" src="{prefix}/app.js"></script>
</body>
</html>
"#,
        title = escape_html(title),
        state = state,
        prefix = prefix,
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
