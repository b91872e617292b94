// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the SQLite tenant store.

use std::collections::BTreeMap;

use serde_json::json;
use tenvisor_core::StoreError;
use tenvisor_core::tenant::{SourceArtifact, SqliteTenantStore, TenantApp, TenantStore};

fn multi_file_tenant() -> TenantApp {
    let mut files = BTreeMap::new();
    files.insert("App.jsx".to_string(), "import './util';".to_string());
    files.insert("util.js".to_string(), "export const x = 1;".to_string());
    TenantApp::new("app-files", "files", SourceArtifact::Files(files))
}

#[tokio::test]
async fn test_upsert_and_lookup_by_either_identity() {
    let store = SqliteTenantStore::in_memory().await.unwrap();
    let tenant = multi_file_tenant().with_persisted_data(json!({"todos": []}));
    store.upsert(&tenant).await.unwrap();

    let by_id = store
        .find_by_id_or_subdomain("app-files")
        .await
        .unwrap()
        .expect("tenant by id");
    let by_subdomain = store
        .find_by_id_or_subdomain("files")
        .await
        .unwrap()
        .expect("tenant by subdomain");

    assert_eq!(by_id, tenant);
    assert_eq!(by_subdomain.id, "app-files");
    assert!(by_id.source.is_multi_file());
    assert!(store.find_by_id_or_subdomain("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_upsert_replaces_existing_record() {
    let store = SqliteTenantStore::in_memory().await.unwrap();
    let tenant = TenantApp::new("app-1", "one", SourceArtifact::Module("v1".into()));
    store.upsert(&tenant).await.unwrap();

    let updated = TenantApp::new("app-1", "uno", SourceArtifact::Module("v2".into()))
        .with_always_on(true);
    store.upsert(&updated).await.unwrap();

    let all = store.list().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].subdomain.as_deref(), Some("uno"));
    assert_eq!(all[0].source, SourceArtifact::Module("v2".into()));
    assert!(all[0].always_on);
}

#[tokio::test]
async fn test_persisted_data_and_flags() {
    let store = SqliteTenantStore::in_memory().await.unwrap();
    store
        .upsert(&TenantApp::new("app-1", "one", SourceArtifact::Module("m".into())))
        .await
        .unwrap();

    store
        .update_persisted_data("app-1", &json!({"visits": 2}))
        .await
        .unwrap();
    store.set_always_on("app-1", true).await.unwrap();

    let tenant = store.find_by_id_or_subdomain("one").await.unwrap().unwrap();
    assert_eq!(tenant.persisted_data, json!({"visits": 2}));
    assert!(tenant.always_on);

    let missing = store.update_persisted_data("nope", &json!(null)).await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
    let missing = store.set_always_on("nope", false).await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_from_path_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("tenants.db");

    {
        let store = SqliteTenantStore::from_path(&path).await.unwrap();
        store
            .upsert(&TenantApp::new("app-1", "one", SourceArtifact::Module("m".into())))
            .await
            .unwrap();
    }

    let store = SqliteTenantStore::from_path(&path).await.unwrap();
    let tenant = store.find_by_id_or_subdomain("app-1").await.unwrap();
    assert!(tenant.is_some());
}
