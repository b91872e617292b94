// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenvisor Protocol - supervisor <-> execution unit messages
//!
//! Execution units never share state with the supervisor. Everything that
//! crosses the boundary is a [`Message`], delivered over bounded channels.
//!
//! # Wire Shape
//!
//! ```text
//! { "type": "request", "appId": "app-1", "correlationId": "…", "payload": { … } }
//! ```
//!
//! | Type | Direction | Correlated | Payload |
//! |------|-----------|------------|---------|
//! | `ready` | unit → supervisor | no | - |
//! | `request` | supervisor → unit | yes | [`RequestPayload`] |
//! | `response` | unit → supervisor | yes | [`ResponsePayload`] |
//! | `error` | unit → supervisor | optional | [`ErrorPayload`] |
//! | `status` | unit → supervisor | no | [`StatusReport`] |
//! | `stop` | supervisor → unit | no | - |
//! | `db_query` | unit → supervisor | yes | [`DbQuery`] |
//! | `db_result` | supervisor → unit | yes | [`QueryOutcome`] |
//!
//! An `error` without a correlation id is a unit-level fault (for example a
//! bootstrap failure) rather than the reply to a single request.

mod message;
mod payload;

pub use message::{Message, MessageKind, new_correlation_id};
pub use payload::{
    DbQuery, ErrorPayload, QueryOutcome, RequestPayload, ResponsePayload, StatusReport,
};
