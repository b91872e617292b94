// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface: tenant traffic, operator endpoints and health.
//!
//! Tenant traffic is selected either by `Host` (`<subdomain>.<base domain>`)
//! or by path prefix (`/apps/{tenant}/...`). Host routing wins over every
//! other route, so tenants own their whole path space on their subdomain.
//!
//! | Method | Path | Action |
//! |---|---|---|
//! | `GET` | `/health` | liveness and execution mode |
//! | `GET` | `/admin/units` | list units |
//! | `POST` | `/admin/units/{id}/stop` | stop a unit |
//! | `POST` | `/admin/units/{id}/restart` | restart a unit |
//! | `GET` | `/admin/units/{id}/stats` | unit statistics |
//! | `PUT` | `/admin/units/{id}/resources` | replace resource limits |
//! | `PUT` | `/admin/units/{id}/data` | replace persisted data |
//! | any | `/apps/{tenant}/{*path}` | tenant request |

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use tenvisor_protocol::{RequestPayload, ResponsePayload};
use tracing::{debug, warn};

use crate::error::Error;
use crate::supervisor::Supervisor;
use crate::unit::{ExecutionUnit, ResourceLimits, UnitStats};

/// Largest tenant request body accepted.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Seconds a client should wait after a spawn timeout.
const SPAWN_RETRY_AFTER_SECS: u64 = 5;

#[derive(Clone)]
struct HttpState {
    supervisor: Arc<Supervisor>,
    base_domain: Option<String>,
}

/// Build the router. `base_domain` enables subdomain routing.
pub fn router(supervisor: Arc<Supervisor>, base_domain: Option<String>) -> Router {
    let state = HttpState {
        supervisor,
        base_domain: base_domain
            .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty()),
    };

    Router::new()
        .route("/health", get(health))
        .route("/admin/units", get(list_units))
        .route("/admin/units/{id}/stop", post(stop_unit))
        .route("/admin/units/{id}/restart", post(restart_unit))
        .route("/admin/units/{id}/stats", get(unit_stats))
        .route("/admin/units/{id}/resources", put(update_resources))
        .route("/admin/units/{id}/data", put(update_data))
        .route("/apps/{tenant}", any(app_root))
        .route("/apps/{tenant}/{*path}", any(app_path))
        .layer(middleware::from_fn_with_state(state.clone(), host_routing))
        .with_state(state)
}

/// Tenant label of `host` under `base_domain`, if any.
///
/// Only a single label directly under the base domain selects a tenant;
/// `www` and the bare domain do not.
pub fn tenant_from_host(host: &str, base_domain: &str) -> Option<String> {
    let host = host.trim().to_ascii_lowercase();
    let name = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host.as_str(),
    };
    let label = name.strip_suffix(base_domain)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') || label == "www" {
        return None;
    }
    Some(label.to_string())
}

/// Error response: status from [`Error::http_status`] and a JSON body with
/// the stable error code.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(code = self.0.error_code(), error = %self.0, "Request failed");
        } else {
            debug!(code = self.0.error_code(), error = %self.0, "Request rejected");
        }

        let body = Json(json!({
            "error": self.0.error_code(),
            "message": self.0.to_string(),
        }));
        let mut response = (status, body).into_response();
        if matches!(self.0, Error::SpawnTimeout { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(SPAWN_RETRY_AFTER_SECS));
        }
        response
    }
}

async fn host_routing(State(state): State<HttpState>, request: Request, next: Next) -> Response {
    let tenant = state.base_domain.as_deref().and_then(|base| {
        request
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().host())
            .and_then(|host| tenant_from_host(host, base))
    });

    match tenant {
        Some(tenant) => {
            let path = request.uri().path().to_string();
            dispatch(&state, &tenant, path, None, request).await
        }
        None => next.run(request).await,
    }
}

async fn health(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mode": state.supervisor.mode().as_str(),
    }))
}

async fn list_units(State(state): State<HttpState>) -> Json<Vec<ExecutionUnit>> {
    Json(state.supervisor.list_units().await)
}

async fn stop_unit(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionUnit>, ApiError> {
    Ok(Json(state.supervisor.stop(&id).await?))
}

async fn restart_unit(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionUnit>, ApiError> {
    Ok(Json(state.supervisor.restart(&id).await?))
}

async fn unit_stats(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<UnitStats>, ApiError> {
    Ok(Json(state.supervisor.stats(&id).await?))
}

async fn update_resources(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(limits): Json<ResourceLimits>,
) -> Result<Json<ResourceLimits>, ApiError> {
    Ok(Json(state.supervisor.update_resources(&id, limits).await?))
}

async fn update_data(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(data): Json<Value>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.update_persisted_data(&id, data).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn app_root(
    State(state): State<HttpState>,
    Path(tenant): Path<String>,
    request: Request,
) -> Response {
    let prefix = format!("/apps/{}", tenant);
    dispatch(&state, &tenant, "/".to_string(), Some(prefix), request).await
}

async fn app_path(
    State(state): State<HttpState>,
    Path((tenant, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    let prefix = format!("/apps/{}", tenant);
    dispatch(&state, &tenant, format!("/{}", path), Some(prefix), request).await
}

/// Forward one HTTP request to a tenant and translate the reply.
async fn dispatch(
    state: &HttpState,
    tenant: &str,
    path: String,
    prefix: Option<String>,
    request: Request,
) -> Response {
    let payload = match to_payload(path, prefix, request).await {
        Ok(payload) => payload,
        Err(e) => return ApiError(e).into_response(),
    };
    match state.supervisor.request(tenant, payload).await {
        Ok(response) => from_payload(response),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn to_payload(
    path: String,
    prefix: Option<String>,
    request: Request,
) -> Result<RequestPayload, Error> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidRequest(format!("Failed to read body: {}", e)))?;

    let mut payload = RequestPayload::new(parts.method.as_str(), path);
    payload.query = parts.uri.query().map(str::to_string);
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            payload
                .headers
                .insert(name.as_str().to_string(), value.to_string());
        }
    }
    if let Some(prefix) = prefix {
        payload.headers.insert("x-forwarded-prefix".to_string(), prefix);
    }
    if !bytes.is_empty() {
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidRequest("Request body is not valid UTF-8".to_string()))?;
        payload.body = Some(text);
    }
    Ok(payload)
}

fn from_payload(payload: ResponsePayload) -> Response {
    let ResponsePayload {
        status,
        headers,
        body,
    } = payload;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for (name, value) in headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid tenant response header"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tenvisor_core::tenant::MemoryTenantStore;
    use tenvisor_core::{DatabaseBroker, SourceArtifact, TenantApp};
    use tower::ServiceExt;

    use crate::pool::{PoolConfig, UnitPool};
    use crate::strategy::PooledStrategy;
    use crate::unit::BundleLoader;

    fn app() -> Router {
        let store = Arc::new(MemoryTenantStore::new());
        store.insert(TenantApp::new(
            "app-1",
            "one",
            SourceArtifact::Module("export const handler = \"echo\";".into()),
        ));
        let pool = UnitPool::new(
            store.clone(),
            Arc::new(DatabaseBroker::in_memory()),
            Arc::new(BundleLoader::default()),
            PoolConfig::default(),
        );
        let supervisor = Supervisor::new(
            Arc::new(PooledStrategy::new(pool.clone())),
            Some(pool),
            store,
        );
        router(Arc::new(supervisor), Some(".Apps.Test".to_string()))
    }

    async fn send(app: &Router, request: axum::http::Request<Body>) -> (StatusCode, Response) {
        let response = app.clone().oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_tenant_from_host() {
        assert_eq!(tenant_from_host("todo.apps.test", "apps.test"), Some("todo".into()));
        assert_eq!(tenant_from_host("TODO.apps.test:8080", "apps.test"), Some("todo".into()));
        assert_eq!(tenant_from_host("apps.test", "apps.test"), None);
        assert_eq!(tenant_from_host("www.apps.test", "apps.test"), None);
        assert_eq!(tenant_from_host("a.b.apps.test", "apps.test"), None);
        assert_eq!(tenant_from_host("todoapps.test", "apps.test"), None);
        assert_eq!(tenant_from_host("todo.other.test", "apps.test"), None);
    }

    #[tokio::test]
    async fn test_health() {
        let (status, response) = send(&app(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "pooled");
    }

    #[tokio::test]
    async fn test_path_prefix_routing() {
        let (status, response) = send(&app(), get("/apps/one/hello/world?x=1")).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["appId"], "app-1");
        assert_eq!(body["path"], "/hello/world");
        assert_eq!(body["query"], "x=1");
        assert_eq!(body["headers"]["x-forwarded-prefix"], "/apps/one");
    }

    #[tokio::test]
    async fn test_host_routing_owns_all_paths() {
        let request = axum::http::Request::post("/health")
            .header(header::HOST, "one.apps.test")
            .body(Body::from("{\"a\":1}"))
            .unwrap();
        let (status, response) = send(&app(), request).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["method"], "POST");
        assert_eq!(body["path"], "/health");
        assert_eq!(body["body"], "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_404() {
        let (status, response) = send(&app(), get("/apps/nobody/")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "TENANT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_admin_lifecycle() {
        let app = app();
        let (status, _) = send(&app, get("/apps/one")).await;
        assert_eq!(status, StatusCode::OK);

        let (_, response) = send(&app, get("/admin/units")).await;
        let units = json_body(response).await;
        assert_eq!(units[0]["appId"], "app-1");
        assert_eq!(units[0]["status"], "running");

        let (status, response) = send(&app, get("/admin/units/one/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await["limits"]["maxConcurrentRequests"], 32);

        let request = axum::http::Request::put("/admin/units/one/resources")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"maxConcurrentRequests\":0}"))
            .unwrap();
        let (status, response) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "INVALID_REQUEST");

        let request = axum::http::Request::post("/admin/units/app-1/stop")
            .body(Body::empty())
            .unwrap();
        let (status, response) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "terminated");

        let request = axum::http::Request::post("/admin/units/ghost/stop")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_spawn_timeout_sets_retry_after() {
        let response = ApiError(Error::SpawnTimeout {
            app_id: "a".into(),
            timeout_ms: 20_000,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    }
}
