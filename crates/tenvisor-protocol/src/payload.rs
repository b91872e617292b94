// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// HTTP-like request forwarded to a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    /// Upper-case HTTP method.
    pub method: String,
    /// Path relative to the tenant root, always starting with `/`.
    pub path: String,
    /// Raw query string without the leading `?`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Request headers, lower-cased names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestPayload {
    /// Create a request with the given method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method: method.into().to_ascii_uppercase(),
            path: if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            },
            query: None,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    /// Set the query string.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Add a header. Names are stored lower-cased.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set a JSON body and the matching content type.
    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = Some(body.to_string());
        self.with_header("content-type", "application/json")
    }

    /// Look up a query-string parameter (no percent-decoding beyond `+`).
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| value.replace('+', " "))
        })
    }
}

/// HTTP-like response produced by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Response body as text.
    #[serde(default)]
    pub body: String,
}

impl ResponsePayload {
    /// Empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    /// JSON response.
    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    /// HTML response.
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(body)
    }

    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body)
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse the body as JSON.
    pub fn json_body(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Error details carried by an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error.
    pub message: String,
}

/// Statement sent by a unit to the database broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbQuery {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Result of a brokered statement.
///
/// Storage failures are data, not errors: a bad statement yields
/// [`QueryOutcome::Error`] and never tears down the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryOutcome {
    /// Rows returned by a read statement.
    Rows(Vec<Map<String, Value>>),
    /// Change metadata for a write statement.
    #[serde(rename_all = "camelCase")]
    Write {
        /// Row id of the last inserted row.
        last_insert_id: i64,
        /// Number of rows changed.
        changes: u64,
    },
    /// Storage-layer failure.
    Error {
        /// Error text from the storage layer.
        error: String,
    },
}

impl QueryOutcome {
    /// Build an error outcome.
    pub fn error(message: impl Into<String>) -> Self {
        QueryOutcome::Error {
            error: message.into(),
        }
    }

    /// Rows, if this is a read result.
    pub fn rows(&self) -> Option<&[Map<String, Value>]> {
        match self {
            QueryOutcome::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Number of changed rows, if this is a write result.
    pub fn changes(&self) -> Option<u64> {
        match self {
            QueryOutcome::Write { changes, .. } => Some(*changes),
            _ => None,
        }
    }

    /// Last inserted row id, if this is a write result.
    pub fn last_insert_id(&self) -> Option<i64> {
        match self {
            QueryOutcome::Write { last_insert_id, .. } => Some(*last_insert_id),
            _ => None,
        }
    }

    /// Error text, if the statement failed.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            QueryOutcome::Error { error } => Some(error),
            _ => None,
        }
    }

    /// Whether the statement failed.
    pub fn is_error(&self) -> bool {
        matches!(self, QueryOutcome::Error { .. })
    }
}

/// Usage counters reported by a unit after handling requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Requests answered with a `response`.
    pub requests_handled: u64,
    /// Requests answered with an `error`.
    pub faults: u64,
    /// Cumulative time spent inside the handler, in milliseconds.
    pub cpu_ms: u64,
    /// Approximate footprint of the loaded module, in bytes.
    pub memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_path_is_normalized() {
        let req = RequestPayload::new("post", "api/data");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/data");
    }

    #[test]
    fn test_query_param() {
        let req = RequestPayload::get("/").with_query("collection=todo+items&limit=5&flag");
        assert_eq!(req.query_param("collection").as_deref(), Some("todo items"));
        assert_eq!(req.query_param("limit").as_deref(), Some("5"));
        assert_eq!(req.query_param("flag").as_deref(), Some(""));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_query_outcome_shapes() {
        let rows: QueryOutcome = serde_json::from_value(json!([{"id": 1}])).unwrap();
        assert_eq!(rows.rows().map(|r| r.len()), Some(1));

        let write: QueryOutcome =
            serde_json::from_value(json!({"lastInsertId": 7, "changes": 1})).unwrap();
        assert_eq!(write.last_insert_id(), Some(7));
        assert_eq!(write.changes(), Some(1));

        let err: QueryOutcome = serde_json::from_value(json!({"error": "no such table"})).unwrap();
        assert!(err.is_error());
        assert_eq!(err.error_message(), Some("no such table"));
    }

    #[test]
    fn test_response_json_sets_content_type() {
        let resp = ResponsePayload::json(201, &json!({"ok": true}));
        assert_eq!(resp.status, 201);
        assert_eq!(
            resp.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(resp.json_body().unwrap(), json!({"ok": true}));
    }
}
