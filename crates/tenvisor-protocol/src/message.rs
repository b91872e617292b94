// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol message envelope.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::payload::{
    DbQuery, ErrorPayload, QueryOutcome, RequestPayload, ResponsePayload, StatusReport,
};

/// Generate a fresh correlation id.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A message exchanged between the supervisor and an execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Unit finished bootstrapping and accepts requests.
    Ready {
        /// Canonical tenant id the unit was started for.
        app_id: String,
    },
    /// Request to be handled by the tenant handler.
    Request {
        /// Tenant id.
        app_id: String,
        /// Id used to match the reply.
        correlation_id: String,
        /// Request data.
        payload: RequestPayload,
    },
    /// Successful reply to a request.
    Response {
        /// Tenant id.
        app_id: String,
        /// Id of the request being answered.
        correlation_id: String,
        /// Response data.
        payload: ResponsePayload,
    },
    /// Failed request, or a unit-level fault when `correlation_id` is absent.
    Error {
        /// Tenant id.
        app_id: String,
        /// Id of the failed request, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        /// Error details.
        payload: ErrorPayload,
    },
    /// Usage report from a unit.
    Status {
        /// Tenant id.
        app_id: String,
        /// Usage counters.
        payload: StatusReport,
    },
    /// Ask the unit to exit.
    Stop {
        /// Tenant id.
        app_id: String,
    },
    /// Statement the unit wants executed against its tenant database.
    DbQuery {
        /// Tenant id.
        app_id: String,
        /// Id used to match the result.
        correlation_id: String,
        /// Statement and parameters.
        payload: DbQuery,
    },
    /// Result of a `db_query`.
    DbResult {
        /// Tenant id.
        app_id: String,
        /// Id of the query being answered.
        correlation_id: String,
        /// Query outcome.
        payload: QueryOutcome,
    },
}

/// Discriminant of a [`Message`], mostly for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `ready`
    Ready,
    /// `request`
    Request,
    /// `response`
    Response,
    /// `error`
    Error,
    /// `status`
    Status,
    /// `stop`
    Stop,
    /// `db_query`
    DbQuery,
    /// `db_result`
    DbResult,
}

impl MessageKind {
    /// Wire name of the message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ready => "ready",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            MessageKind::Status => "status",
            MessageKind::Stop => "stop",
            MessageKind::DbQuery => "db_query",
            MessageKind::DbResult => "db_result",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    /// Message type.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ready { .. } => MessageKind::Ready,
            Message::Request { .. } => MessageKind::Request,
            Message::Response { .. } => MessageKind::Response,
            Message::Error { .. } => MessageKind::Error,
            Message::Status { .. } => MessageKind::Status,
            Message::Stop { .. } => MessageKind::Stop,
            Message::DbQuery { .. } => MessageKind::DbQuery,
            Message::DbResult { .. } => MessageKind::DbResult,
        }
    }

    /// Tenant id carried by the message.
    pub fn app_id(&self) -> &str {
        match self {
            Message::Ready { app_id }
            | Message::Request { app_id, .. }
            | Message::Response { app_id, .. }
            | Message::Error { app_id, .. }
            | Message::Status { app_id, .. }
            | Message::Stop { app_id }
            | Message::DbQuery { app_id, .. }
            | Message::DbResult { app_id, .. } => app_id,
        }
    }

    /// Correlation id, for message types that carry one.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Message::Request { correlation_id, .. }
            | Message::Response { correlation_id, .. }
            | Message::DbQuery { correlation_id, .. }
            | Message::DbResult { correlation_id, .. } => Some(correlation_id),
            Message::Error { correlation_id, .. } => correlation_id.as_deref(),
            Message::Ready { .. } | Message::Status { .. } | Message::Stop { .. } => None,
        }
    }

    /// Build an uncorrelated unit-level fault.
    pub fn fault(app_id: impl Into<String>, message: impl Into<String>) -> Self {
        Message::Error {
            app_id: app_id.into(),
            correlation_id: None,
            payload: ErrorPayload {
                message: message.into(),
            },
        }
    }
}
