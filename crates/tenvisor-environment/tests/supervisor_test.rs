// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end supervisor tests through the default handler and the runtime.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::*;
use serde_json::json;
use tenvisor_core::tenant::SqliteTenantStore;
use tenvisor_core::{BrokerConfig, DatabaseBroker};
use tenvisor_environment::{ExecutionMode, SupervisorRuntime, UnitStatus};
use tenvisor_protocol::RequestPayload;

#[tokio::test]
async fn test_record_round_trip_through_broker() {
    let ctx = TestContext::new().with_tenant(default_tenant("app-1", "groceries"));

    let created = ctx
        .supervisor
        .request(
            "groceries",
            RequestPayload::new("POST", "/api/data")
                .with_json(&json!({"collection": "items", "data": {"name": "milk", "qty": 2}})),
        )
        .await
        .unwrap();
    assert_eq!(created.status, 201);
    let record = created.json_body().unwrap();
    let id = record["id"].as_str().unwrap().to_string();

    // Read back through the default read path.
    let fetched = ctx
        .supervisor
        .request("app-1", RequestPayload::get(format!("/api/data/{}", id)))
        .await
        .unwrap();
    assert_eq!(fetched.status, 200);
    assert_eq!(fetched.json_body().unwrap()["data"], json!({"name": "milk", "qty": 2}));

    // The value is what the broker persisted for this tenant.
    let rows = ctx
        .broker
        .query("app-1", "SELECT data FROM app_records WHERE id = ?", &[json!(id)])
        .await;
    let stored: serde_json::Value =
        serde_json::from_str(rows.rows().unwrap()[0]["data"].as_str().unwrap()).unwrap();
    assert_eq!(stored, json!({"name": "milk", "qty": 2}));

    // The page embeds the same value as the tenant's persisted data.
    let page = ctx
        .supervisor
        .request("groceries", RequestPayload::get("/"))
        .await
        .unwrap();
    assert!(page.body.contains("<title>Groceries</title>"));
    assert_eq!(initial_state(&page)["persistedData"][id.as_str()], stored);
}

#[tokio::test]
async fn test_tenants_have_separate_databases() {
    let ctx = TestContext::new()
        .with_tenant(default_tenant("a", "alpha"))
        .with_tenant(default_tenant("b", "beta"));

    ctx.supervisor
        .request(
            "alpha",
            RequestPayload::new("POST", "/api/data").with_json(&json!({"note": "only alpha"})),
        )
        .await
        .unwrap();

    let beta = ctx
        .supervisor
        .request("beta", RequestPayload::get("/api/data"))
        .await
        .unwrap();
    assert_eq!(beta.json_body().unwrap(), json!([]));
    assert!(ctx.broker.is_open("a"));
    assert!(ctx.broker.is_open("b"));
}

#[tokio::test]
async fn test_client_module_etag() {
    let ctx = TestContext::new().with_tenant(default_tenant("app-1", "groceries"));

    let first = ctx
        .supervisor
        .request("groceries", RequestPayload::get("/app.js"))
        .await
        .unwrap();
    assert_eq!(first.status, 200);
    let etag = first.headers["etag"].clone();

    let cached = ctx
        .supervisor
        .request(
            "groceries",
            RequestPayload::get("/app.js").with_header("If-None-Match", etag.clone()),
        )
        .await
        .unwrap();
    assert_eq!(cached.status, 304);
    assert_eq!(cached.headers["etag"], etag);
}

#[tokio::test]
async fn test_persisted_data_update_restarts_running_unit() {
    let ctx = TestContext::new().with_tenant(
        default_tenant("app-1", "groceries").with_persisted_data(json!({"theme": "light"})),
    );

    let page = ctx
        .supervisor
        .request("groceries", RequestPayload::get("/"))
        .await
        .unwrap();
    assert!(page.body.contains("\"theme\":\"light\""));
    let before = ctx.pool.unit("app-1").unwrap().unit_id;

    ctx.supervisor
        .update_persisted_data("groceries", json!({"theme": "dark"}))
        .await
        .unwrap();
    assert_eq!(
        ctx.store.get("app-1").unwrap().persisted_data,
        json!({"theme": "dark"})
    );

    let unit = ctx.pool.unit("app-1").unwrap();
    assert_ne!(unit.unit_id, before);
    assert_eq!(unit.status, UnitStatus::Running);

    let page = ctx
        .supervisor
        .request("groceries", RequestPayload::get("/"))
        .await
        .unwrap();
    assert_eq!(initial_state(&page)["persistedData"]["theme"], json!("dark"));
}

#[tokio::test]
async fn test_stateless_runtime_round_trip() {
    let store = Arc::new(tenvisor_core::tenant::MemoryTenantStore::new());
    store.insert(default_tenant("app-1", "groceries"));

    let runtime = SupervisorRuntime::builder()
        .store(store)
        .broker(Arc::new(DatabaseBroker::in_memory()))
        .mode(ExecutionMode::Stateless)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let supervisor = runtime.supervisor().clone();

    let created = supervisor
        .request(
            "groceries",
            RequestPayload::new("POST", "/api/data").with_json(&json!({"name": "eggs"})),
        )
        .await
        .unwrap();
    assert_eq!(created.status, 201);

    let listed = supervisor
        .request("groceries", RequestPayload::get("/api/data"))
        .await
        .unwrap();
    assert_eq!(listed.json_body().unwrap()[0]["data"]["name"], "eggs");

    let err = supervisor.stats("groceries").await.unwrap_err();
    assert_eq!(err.error_code(), "UNSUPPORTED");
    assert_eq!(err.http_status(), 409);

    runtime.shutdown().await.unwrap();
}

async fn start_on_disk(dir: &Path) -> SupervisorRuntime {
    let store = Arc::new(
        SqliteTenantStore::from_path(dir.join("tenants.db"))
            .await
            .unwrap(),
    );
    store
        .upsert(&default_tenant("app-1", "groceries"))
        .await
        .unwrap();
    SupervisorRuntime::builder()
        .store(store)
        .broker(Arc::new(DatabaseBroker::new(BrokerConfig::on_disk(dir))))
        .mode(ExecutionMode::Pooled)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_on_disk_data_survives_runtime_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();

    let runtime = start_on_disk(temp_dir.path()).await;
    runtime
        .supervisor()
        .request(
            "groceries",
            RequestPayload::new("POST", "/api/data").with_json(&json!({"id": "r1", "name": "tea"})),
        )
        .await
        .unwrap();
    runtime.shutdown().await.unwrap();

    let runtime = start_on_disk(temp_dir.path()).await;
    let fetched = runtime
        .supervisor()
        .request("groceries", RequestPayload::get("/api/data/r1"))
        .await
        .unwrap();
    assert_eq!(fetched.status, 200);
    assert_eq!(fetched.json_body().unwrap()["data"]["name"], "tea");
    assert!(temp_dir.path().join("apps").is_dir());
    runtime.shutdown().await.unwrap();
}
