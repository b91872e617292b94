// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outstanding requests awaiting a correlated reply.

use std::collections::HashMap;
use std::sync::Mutex;

use tenvisor_protocol::ResponsePayload;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Reply delivered to a waiting caller.
pub type Reply = Result<ResponsePayload>;

struct PendingRequest {
    app_id: String,
    unit_id: Uuid,
    reply: oneshot::Sender<Reply>,
}

/// Correlation id → waiting caller.
///
/// An entry is removed the instant its reply arrives, when the caller stops
/// waiting (timeout or a dropped future) or when its unit exits.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return the receiver for its reply.
    pub fn register(
        &self,
        correlation_id: impl Into<String>,
        app_id: impl Into<String>,
        unit_id: Uuid,
    ) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.entries().insert(
            correlation_id.into(),
            PendingRequest {
                app_id: app_id.into(),
                unit_id,
                reply: tx,
            },
        );
        rx
    }

    /// Complete the request with `correlation_id`.
    ///
    /// Returns `false` when no such request is outstanding (already answered,
    /// timed out, or never issued).
    pub fn resolve(&self, correlation_id: &str, reply: Reply) -> bool {
        let Some(entry) = self.entries().remove(correlation_id) else {
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        let _ = entry.reply.send(reply);
        true
    }

    /// Drop a request without answering it.
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.entries().remove(correlation_id).is_some()
    }

    /// Tie the entry for `correlation_id` to the returned guard's lifetime.
    pub fn guard(&self, correlation_id: impl Into<String>) -> PendingGuard<'_> {
        PendingGuard {
            table: self,
            correlation_id: correlation_id.into(),
        }
    }

    /// Fail every request owned by `unit_id`. Returns how many were failed.
    pub fn fail_unit(&self, unit_id: Uuid, error: &Error) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut entries = self.entries();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, p)| p.unit_id == unit_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(error.clone()));
        }
        count
    }

    /// Outstanding requests across all units.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding requests for one tenant.
    pub fn count_for(&self, app_id: &str) -> usize {
        self.entries()
            .values()
            .filter(|p| p.app_id == app_id)
            .count()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes its request from the table when dropped.
///
/// Held by the waiting caller, so a request whose caller is cancelled never
/// outlives it. Removing an already answered request is a no-op.
pub struct PendingGuard<'a> {
    table: &'a PendingRequests,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.correlation_id);
    }
}
