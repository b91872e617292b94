// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The execution unit task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tenvisor_core::TenantApp;
use tenvisor_protocol::{
    ErrorPayload, Message, RequestPayload, ResponsePayload, StatusReport,
};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::db::ChannelExecutor;
use super::handler::{HandlerError, TenantHandler};
use super::loader::ModuleLoader;

/// Everything a unit starts with.
pub(crate) struct UnitSeed {
    pub tenant: TenantApp,
    pub loader: Arc<dyn ModuleLoader>,
    pub inbox: mpsc::Receiver<Message>,
    pub outbox: mpsc::Sender<Message>,
    pub db_timeout: Duration,
}

/// How a unit task ended without panicking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitExit {
    /// Received `stop`.
    Stopped,
    /// Bootstrap failed; the message was also sent as an uncorrelated `error`.
    Faulted(String),
    /// The supervisor side of a channel went away.
    Disconnected,
}

type RequestResult = (String, Result<Result<ResponsePayload, HandlerError>, JoinError>, Duration);

/// Run a unit until it is stopped, faults during bootstrap, or loses its
/// supervisor. Panics in the loader propagate and end the task abnormally.
pub(crate) async fn run_unit(seed: UnitSeed) -> UnitExit {
    let UnitSeed {
        tenant,
        loader,
        mut inbox,
        outbox,
        db_timeout,
    } = seed;
    let app_id = tenant.id.clone();
    let db = Arc::new(ChannelExecutor::new(app_id.clone(), outbox.clone(), db_timeout));

    // Bootstrap issues db_query messages, so the inbox is pumped meanwhile.
    let handler = {
        let boot = bootstrap(&tenant, loader.as_ref(), db.clone());
        tokio::pin!(boot);
        loop {
            tokio::select! {
                result = &mut boot => break result,
                msg = inbox.recv() => match msg {
                    None => return UnitExit::Disconnected,
                    Some(Message::Stop { .. }) => return UnitExit::Stopped,
                    Some(Message::DbResult { correlation_id, payload, .. }) => {
                        db.resolve(&correlation_id, payload);
                    }
                    Some(Message::Request { correlation_id, .. }) => {
                        let reply = error_reply(&app_id, correlation_id, "unit is still starting");
                        if outbox.send(reply).await.is_err() {
                            return UnitExit::Disconnected;
                        }
                    }
                    Some(other) => {
                        debug!(app_id = %app_id, kind = %other.kind(), "Ignoring message during bootstrap");
                    }
                },
            }
        }
    };

    let handler = match handler {
        Ok(handler) => handler,
        Err(message) => {
            // The supervisor may already be gone; the exit reason carries the message too.
            let _ = outbox.send(Message::fault(app_id.clone(), message.clone())).await;
            return UnitExit::Faulted(message);
        }
    };

    if outbox
        .send(Message::Ready {
            app_id: app_id.clone(),
        })
        .await
        .is_err()
    {
        return UnitExit::Disconnected;
    }
    info!(app_id = %app_id, "Execution unit ready");

    let mut report = StatusReport {
        memory_bytes: tenant.source.size_bytes() as u64,
        ..StatusReport::default()
    };
    let mut requests: JoinSet<RequestResult> = JoinSet::new();

    loop {
        tokio::select! {
            msg = inbox.recv() => match msg {
                None => {
                    requests.abort_all();
                    return UnitExit::Disconnected;
                }
                Some(Message::Stop { .. }) => {
                    requests.abort_all();
                    debug!(app_id = %app_id, "Execution unit stopping");
                    return UnitExit::Stopped;
                }
                Some(Message::Request { correlation_id, payload, .. }) => {
                    requests.spawn(handle_request(handler.clone(), correlation_id, payload));
                }
                Some(Message::DbResult { correlation_id, payload, .. }) => {
                    db.resolve(&correlation_id, payload);
                }
                Some(other) => {
                    warn!(app_id = %app_id, kind = %other.kind(), "Unexpected message for execution unit");
                }
            },

            Some(joined) = requests.join_next() => {
                let Ok((correlation_id, outcome, elapsed)) = joined else {
                    // Request tasks only end early when aborted on stop.
                    continue;
                };
                report.cpu_ms += elapsed.as_millis() as u64;

                let reply = match outcome {
                    Ok(Ok(response)) => {
                        report.requests_handled += 1;
                        Message::Response {
                            app_id: app_id.clone(),
                            correlation_id,
                            payload: response,
                        }
                    }
                    Ok(Err(e)) => {
                        report.faults += 1;
                        error_reply(&app_id, correlation_id, e.to_string())
                    }
                    Err(join_error) => {
                        report.faults += 1;
                        warn!(app_id = %app_id, correlation_id = %correlation_id, "Handler panicked");
                        error_reply(&app_id, correlation_id, panic_message(join_error))
                    }
                };

                let status = Message::Status {
                    app_id: app_id.clone(),
                    payload: report.clone(),
                };
                if outbox.send(reply).await.is_err() || outbox.send(status).await.is_err() {
                    requests.abort_all();
                    return UnitExit::Disconnected;
                }
            }
        }
    }
}

async fn bootstrap(
    tenant: &TenantApp,
    loader: &dyn ModuleLoader,
    db: Arc<ChannelExecutor>,
) -> Result<Arc<dyn TenantHandler>, String> {
    let handler = loader
        .load(tenant, db)
        .await
        .map_err(|e| e.to_string())?;
    handler
        .init()
        .await
        .map_err(|e| format!("Handler initialization failed: {}", e))?;
    Ok(handler)
}

/// Run one request on its own task so a panicking handler only fails that
/// request.
async fn handle_request(
    handler: Arc<dyn TenantHandler>,
    correlation_id: String,
    payload: RequestPayload,
) -> RequestResult {
    let started = Instant::now();
    let outcome = tokio::spawn(async move { handler.handle(payload).await }).await;
    (correlation_id, outcome, started.elapsed())
}

fn error_reply(app_id: &str, correlation_id: String, message: impl Into<String>) -> Message {
    Message::Error {
        app_id: app_id.to_string(),
        correlation_id: Some(correlation_id),
        payload: ErrorPayload {
            message: message.into(),
        },
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "handler cancelled".to_string();
    }
    let panic = error.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleError;
    use crate::unit::db::QueryExecutor;
    use crate::unit::handler::EchoHandler;
    use async_trait::async_trait;
    use tenvisor_core::SourceArtifact;
    use tenvisor_protocol::QueryOutcome;

    struct PanickyHandler;

    #[async_trait]
    impl TenantHandler for PanickyHandler {
        async fn handle(&self, request: RequestPayload) -> Result<ResponsePayload, HandlerError> {
            match request.path.as_str() {
                "/panic" => panic!("kaboom"),
                "/fail" => Err(HandlerError::Failed("nope".into())),
                _ => Ok(ResponsePayload::text(200, "ok")),
            }
        }
    }

    struct FixedLoader(Result<Arc<dyn TenantHandler>, BundleError>);

    #[async_trait]
    impl ModuleLoader for FixedLoader {
        async fn load(
            &self,
            _tenant: &TenantApp,
            _db: Arc<dyn QueryExecutor>,
        ) -> Result<Arc<dyn TenantHandler>, BundleError> {
            self.0.clone()
        }
    }

    /// Loader whose handler runs a query during init.
    struct QueryingLoader;

    struct QueryingHandler(Arc<dyn QueryExecutor>);

    #[async_trait]
    impl TenantHandler for QueryingHandler {
        async fn init(&self) -> Result<(), HandlerError> {
            match self.0.query("CREATE TABLE t (x)", vec![]).await {
                QueryOutcome::Error { error } => Err(HandlerError::Storage(error)),
                _ => Ok(()),
            }
        }

        async fn handle(&self, _request: RequestPayload) -> Result<ResponsePayload, HandlerError> {
            Ok(ResponsePayload::new(204))
        }
    }

    #[async_trait]
    impl ModuleLoader for QueryingLoader {
        async fn load(
            &self,
            _tenant: &TenantApp,
            db: Arc<dyn QueryExecutor>,
        ) -> Result<Arc<dyn TenantHandler>, BundleError> {
            Ok(Arc::new(QueryingHandler(db)))
        }
    }

    struct Harness {
        to_unit: mpsc::Sender<Message>,
        from_unit: mpsc::Receiver<Message>,
        task: tokio::task::JoinHandle<UnitExit>,
    }

    fn start(loader: Arc<dyn ModuleLoader>) -> Harness {
        let (to_unit, inbox) = mpsc::channel(16);
        let (outbox, from_unit) = mpsc::channel(16);
        let seed = UnitSeed {
            tenant: TenantApp::new("app-1", "one", SourceArtifact::Module("x".into())),
            loader,
            inbox,
            outbox,
            db_timeout: Duration::from_secs(5),
        };
        Harness {
            to_unit,
            from_unit,
            task: tokio::spawn(run_unit(seed)),
        }
    }

    fn request(correlation_id: &str, path: &str) -> Message {
        Message::Request {
            app_id: "app-1".into(),
            correlation_id: correlation_id.into(),
            payload: RequestPayload::get(path),
        }
    }

    #[tokio::test]
    async fn test_ready_then_requests_and_status() {
        let mut h = start(Arc::new(FixedLoader(Ok(Arc::new(EchoHandler::new("app-1"))))));
        assert_eq!(
            h.from_unit.recv().await,
            Some(Message::Ready {
                app_id: "app-1".into()
            })
        );

        h.to_unit.send(request("c1", "/hello")).await.unwrap();
        let Some(Message::Response {
            correlation_id,
            payload,
            ..
        }) = h.from_unit.recv().await
        else {
            panic!("expected response");
        };
        assert_eq!(correlation_id, "c1");
        assert_eq!(payload.json_body().unwrap()["path"], "/hello");

        let Some(Message::Status { payload, .. }) = h.from_unit.recv().await else {
            panic!("expected status");
        };
        assert_eq!(payload.requests_handled, 1);
        assert_eq!(payload.memory_bytes, 1);

        h.to_unit
            .send(Message::Stop {
                app_id: "app-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(h.task.await.unwrap(), UnitExit::Stopped);
    }

    #[tokio::test]
    async fn test_handler_panic_fails_only_that_request() {
        let mut h = start(Arc::new(FixedLoader(Ok(Arc::new(PanickyHandler)))));
        assert!(matches!(h.from_unit.recv().await, Some(Message::Ready { .. })));

        h.to_unit.send(request("boom", "/panic")).await.unwrap();
        let Some(Message::Error {
            correlation_id,
            payload,
            ..
        }) = h.from_unit.recv().await
        else {
            panic!("expected error");
        };
        assert_eq!(correlation_id.as_deref(), Some("boom"));
        assert!(payload.message.contains("kaboom"));
        assert!(matches!(h.from_unit.recv().await, Some(Message::Status { .. })));

        h.to_unit.send(request("fine", "/")).await.unwrap();
        let Some(Message::Response { correlation_id, .. }) = h.from_unit.recv().await else {
            panic!("expected response");
        };
        assert_eq!(correlation_id, "fine");
        let Some(Message::Status { payload, .. }) = h.from_unit.recv().await else {
            panic!("expected status");
        };
        assert_eq!(payload.faults, 1);
        assert_eq!(payload.requests_handled, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_emits_uncorrelated_error() {
        let mut h = start(Arc::new(FixedLoader(Err(BundleError::NoEntry))));
        let Some(Message::Error {
            correlation_id,
            payload,
            ..
        }) = h.from_unit.recv().await
        else {
            panic!("expected fault");
        };
        assert_eq!(correlation_id, None);
        assert!(payload.message.contains("No entry module"));
        assert!(matches!(h.task.await.unwrap(), UnitExit::Faulted(_)));
    }

    #[tokio::test]
    async fn test_bootstrap_queries_are_answered_before_ready() {
        let mut h = start(Arc::new(QueryingLoader));

        let Some(Message::DbQuery {
            correlation_id,
            payload,
            ..
        }) = h.from_unit.recv().await
        else {
            panic!("expected db_query");
        };
        assert_eq!(payload.sql, "CREATE TABLE t (x)");

        h.to_unit
            .send(Message::DbResult {
                app_id: "app-1".into(),
                correlation_id,
                payload: QueryOutcome::Write {
                    last_insert_id: 0,
                    changes: 0,
                },
            })
            .await
            .unwrap();
        assert!(matches!(h.from_unit.recv().await, Some(Message::Ready { .. })));
    }

    #[tokio::test]
    async fn test_dropping_inbox_disconnects() {
        let h = start(Arc::new(FixedLoader(Ok(Arc::new(EchoHandler::new("app-1"))))));
        let Harness {
            to_unit,
            mut from_unit,
            task,
        } = h;
        assert!(matches!(from_unit.recv().await, Some(Message::Ready { .. })));
        drop(to_unit);
        assert_eq!(task.await.unwrap(), UnitExit::Disconnected);
    }
}
