// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database access from inside an execution unit.
//!
//! Handlers never open storage. In pooled mode every statement travels to the
//! supervisor as a `db_query` message and comes back as `db_result`; in
//! stateless mode it is handed straight to the broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tenvisor_core::DatabaseBroker;
use tenvisor_protocol::{DbQuery, Message, QueryOutcome, new_correlation_id};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Executes statements against the current tenant's database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run `sql` with positional `params`. Failures come back as
    /// [`QueryOutcome::Error`].
    async fn query(&self, sql: &str, params: Vec<Value>) -> QueryOutcome;
}

/// Routes statements through the supervisor as protocol messages.
pub struct ChannelExecutor {
    app_id: String,
    outbox: mpsc::Sender<Message>,
    waiting: Mutex<HashMap<String, oneshot::Sender<QueryOutcome>>>,
    timeout: Duration,
}

impl ChannelExecutor {
    /// Executor sending on `outbox` and waiting at most `timeout` per statement.
    pub fn new(app_id: impl Into<String>, outbox: mpsc::Sender<Message>, timeout: Duration) -> Self {
        Self {
            app_id: app_id.into(),
            outbox,
            waiting: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Deliver a `db_result`. Returns `false` for unknown correlation ids.
    pub fn resolve(&self, correlation_id: &str, outcome: QueryOutcome) -> bool {
        match self.waiting().remove(correlation_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => {
                warn!(
                    app_id = %self.app_id,
                    correlation_id = %correlation_id,
                    "db_result for unknown query"
                );
                false
            }
        }
    }

    /// Statements awaiting a result.
    pub fn in_flight(&self) -> usize {
        self.waiting().len()
    }

    fn waiting(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<QueryOutcome>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueryExecutor for ChannelExecutor {
    async fn query(&self, sql: &str, params: Vec<Value>) -> QueryOutcome {
        let correlation_id = new_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.waiting().insert(correlation_id.clone(), tx);

        debug!(app_id = %self.app_id, correlation_id = %correlation_id, "Sending db_query");

        let message = Message::DbQuery {
            app_id: self.app_id.clone(),
            correlation_id: correlation_id.clone(),
            payload: DbQuery {
                sql: sql.to_string(),
                params,
            },
        };
        if self.outbox.send(message).await.is_err() {
            self.waiting().remove(&correlation_id);
            return QueryOutcome::error("supervisor channel closed");
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => QueryOutcome::error("query abandoned"),
            Err(_) => {
                self.waiting().remove(&correlation_id);
                QueryOutcome::error(format!(
                    "query timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

/// Calls the broker directly; used when there is no supervisor in between.
pub struct BrokerExecutor {
    broker: Arc<DatabaseBroker>,
    app_id: String,
}

impl BrokerExecutor {
    /// Executor bound to `app_id`'s database.
    pub fn new(broker: Arc<DatabaseBroker>, app_id: impl Into<String>) -> Self {
        Self {
            broker,
            app_id: app_id.into(),
        }
    }
}

#[async_trait]
impl QueryExecutor for BrokerExecutor {
    async fn query(&self, sql: &str, params: Vec<Value>) -> QueryOutcome {
        self.broker.query(&self.app_id, sql, &params).await
    }
}
