// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool of long-lived execution units, one per active tenant.
//!
//! The pool is the addressable registry behind the pooled strategy. It owns
//! every unit's inbox, routes every unit's outbox, and is the only place unit
//! status changes.
//!
//! # Spawn deduplication
//!
//! Cold tenants are spawned through a map of `app_id → shared spawn future`.
//! Concurrent callers for the same tenant await the same future, so a tenant
//! never has two units racing to become ready. The spawn itself runs in its
//! own task and clears its marker when it finishes, even if every caller has
//! given up waiting.
//!
//! # Generations
//!
//! Every spawn gets a fresh `unit_id`. Messages and exits from a unit whose
//! `unit_id` no longer matches the registry entry are stale and never change
//! status, which is how a `ready` arriving after a spawn timeout is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tenvisor_core::{DatabaseBroker, TenantApp, TenantStore};
use tenvisor_protocol::{
    DbQuery, Message, RequestPayload, ResponsePayload, StatusReport, new_correlation_id,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pending::PendingRequests;
use crate::unit::worker::{self, UnitExit, UnitSeed};
use crate::unit::{
    ExecutionUnit, ModuleLoader, ResourceLimits, ResourceUsage, UnitStats, UnitStatus,
};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bound on a unit reporting `ready`.
    pub spawn_timeout: Duration,
    /// Bound on a single request (and on a unit's database round trips).
    pub request_timeout: Duration,
    /// Limits for tenants without an explicit override.
    pub default_limits: ResourceLimits,
    /// Capacity of each unit's inbox and outbox.
    pub channel_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            default_limits: ResourceLimits::default(),
            channel_capacity: 64,
        }
    }
}

/// Address of a running unit.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    app_id: String,
    unit_id: Uuid,
    inbox: mpsc::Sender<Message>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    request_timeout: Option<Duration>,
}

impl UnitHandle {
    /// Canonical tenant id.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Generation id of the unit.
    pub fn unit_id(&self) -> Uuid {
        self.unit_id
    }
}

/// Identity of the unit a message came from.
///
/// Database queries always run against `app_id` from the route, never the
/// id a message claims.
#[derive(Debug, Clone)]
pub struct UnitRoute {
    app_id: String,
    unit_id: Uuid,
    inbox: mpsc::Sender<Message>,
}

impl UnitRoute {
    /// Canonical tenant id bound to the unit.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Generation id of the unit.
    pub fn unit_id(&self) -> Uuid {
        self.unit_id
    }
}

struct UnitEntry {
    subdomain: Option<String>,
    unit_id: Uuid,
    status: UnitStatus,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    error: Option<String>,
    usage: Option<StatusReport>,
    inbox: mpsc::Sender<Message>,
    permits: Arc<Semaphore>,
    /// Requests holding a permit, whichever semaphore it came from.
    in_flight: Arc<AtomicUsize>,
    ready: Option<oneshot::Sender<Result<()>>>,
}

impl UnitEntry {
    fn snapshot(&self, app_id: &str) -> ExecutionUnit {
        ExecutionUnit {
            app_id: app_id.to_string(),
            subdomain: self.subdomain.clone(),
            unit_id: self.unit_id,
            status: self.status,
            started_at: self.started_at,
            last_activity: self.last_activity,
            error: self.error.clone(),
            resource_usage: self.usage.as_ref().map(ResourceUsage::from),
        }
    }

    /// Apply a status change if the lifecycle allows it.
    fn transition(&mut self, next: UnitStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Registry {
    units: HashMap<String, UnitEntry>,
    /// subdomain → canonical id
    aliases: HashMap<String, String>,
    /// Per-tenant overrides, kept across respawns.
    limits: HashMap<String, ResourceLimits>,
}

impl Registry {
    fn canonical(&self, key: &str) -> Option<String> {
        if self.units.contains_key(key) {
            return Some(key.to_string());
        }
        self.aliases.get(key).cloned()
    }

    fn current_mut(&mut self, route: &UnitRoute) -> Option<&mut UnitEntry> {
        self.units
            .get_mut(&route.app_id)
            .filter(|entry| entry.unit_id == route.unit_id)
    }
}

/// Counts a request as in flight until dropped.
struct InFlight {
    count: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl InFlight {
    fn new(count: Arc<AtomicUsize>, permit: OwnedSemaphorePermit) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self {
            count,
            _permit: permit,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

type SpawnFuture = Shared<BoxFuture<'static, Result<UnitHandle>>>;

/// An in-flight spawn. `seq` tells a spawn's own marker apart from one that
/// replaced it.
#[derive(Clone)]
struct SpawnMarker {
    seq: u64,
    future: SpawnFuture,
}

/// Registry and lifecycle controller for pooled execution units.
pub struct UnitPool {
    store: Arc<dyn TenantStore>,
    broker: Arc<DatabaseBroker>,
    loader: Arc<dyn ModuleLoader>,
    config: PoolConfig,
    registry: RwLock<Registry>,
    spawning: Mutex<HashMap<String, SpawnMarker>>,
    spawn_seq: AtomicU64,
    pending: PendingRequests,
    handshakes: AtomicU64,
    weak: Weak<UnitPool>,
}

impl UnitPool {
    /// Create a pool.
    pub fn new(
        store: Arc<dyn TenantStore>,
        broker: Arc<DatabaseBroker>,
        loader: Arc<dyn ModuleLoader>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            broker,
            loader,
            config,
            registry: RwLock::new(Registry::default()),
            spawning: Mutex::new(HashMap::new()),
            spawn_seq: AtomicU64::new(0),
            pending: PendingRequests::new(),
            handshakes: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Tenant store the pool reads from.
    pub fn store(&self) -> &Arc<dyn TenantStore> {
        &self.store
    }

    /// Return the running unit for `key` (id or subdomain), spawning one if
    /// needed.
    pub async fn get_or_spawn(&self, key: &str) -> Result<UnitHandle> {
        if let Some(handle) = self.running_handle(key) {
            return Ok(handle);
        }
        let tenant = self.lookup(key).await?;
        self.spawn_deduplicated(tenant).await
    }

    /// Spawn a unit for `key`, joining an in-flight spawn for the same tenant.
    pub async fn spawn(&self, key: &str) -> Result<UnitHandle> {
        let tenant = self.lookup(key).await?;
        self.spawn_deduplicated(tenant).await
    }

    /// Send a request to the tenant's unit and wait for the correlated reply.
    pub async fn request(&self, key: &str, payload: RequestPayload) -> Result<ResponsePayload> {
        let handle = self.get_or_spawn(key).await?;
        let permit = handle
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::UnitExited(handle.app_id.clone()))?;
        let _in_flight = InFlight::new(handle.in_flight.clone(), permit);

        let correlation_id = new_correlation_id();
        let reply = self
            .pending
            .register(correlation_id.clone(), &handle.app_id, handle.unit_id);
        // Removes the entry on every exit path, including a dropped caller.
        let _pending = self.pending.guard(correlation_id.clone());

        debug!(
            app_id = %handle.app_id,
            correlation_id = %correlation_id,
            method = %payload.method,
            path = %payload.path,
            "Dispatching request"
        );

        let message = Message::Request {
            app_id: handle.app_id.clone(),
            correlation_id: correlation_id.clone(),
            payload,
        };
        if handle.inbox.send(message).await.is_err() {
            return Err(Error::UnitExited(handle.app_id.clone()));
        }

        let timeout = handle.request_timeout.unwrap_or(self.config.request_timeout);
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::UnitExited(handle.app_id.clone())),
            Err(_) => {
                warn!(
                    app_id = %handle.app_id,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(Error::RequestTimeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Terminate any unit for the tenant, whatever its status, and spawn a
    /// fresh one.
    pub async fn restart(&self, key: &str) -> Result<UnitHandle> {
        let tenant = self.lookup(key).await?;
        {
            // An in-flight spawn belongs to the generation being replaced, so
            // it must not be joined.
            let mut spawning = self.spawning();
            spawning.remove(&tenant.id);
            let mut registry = self.registry_mut();
            if let Some(entry) = registry.units.get_mut(&tenant.id) {
                entry.transition(UnitStatus::Terminated);
                entry.ready.take();
                send_stop(&entry.inbox, &tenant.id);
            }
        }
        info!(app_id = %tenant.id, "Restarting execution unit");
        self.spawn_deduplicated(tenant).await
    }

    /// Stop the tenant's unit and mark it terminated.
    pub fn stop(&self, key: &str) -> Result<ExecutionUnit> {
        let mut registry = self.registry_mut();
        let app_id = registry
            .canonical(key)
            .ok_or_else(|| Error::TenantNotFound(key.to_string()))?;
        let entry = registry
            .units
            .get_mut(&app_id)
            .ok_or_else(|| Error::TenantNotFound(key.to_string()))?;

        if matches!(entry.status, UnitStatus::Starting | UnitStatus::Running) {
            entry.status = UnitStatus::Terminated;
            entry.ready.take();
            send_stop(&entry.inbox, &app_id);
            info!(app_id = %app_id, unit_id = %entry.unit_id, "Execution unit stopped");
        }
        Ok(entry.snapshot(&app_id))
    }

    /// Suspend an idle unit. Returns `false` unless it was running.
    pub fn suspend(&self, app_id: &str) -> bool {
        let mut registry = self.registry_mut();
        let Some(entry) = registry.units.get_mut(app_id) else {
            return false;
        };
        if !entry.transition(UnitStatus::Sleeping) {
            return false;
        }
        send_stop(&entry.inbox, app_id);
        info!(
            app_id = %app_id,
            unit_id = %entry.unit_id,
            last_activity = %entry.last_activity,
            "Execution unit suspended"
        );
        true
    }

    /// Detailed statistics for the tenant's unit.
    pub fn stats(&self, key: &str) -> Result<UnitStats> {
        let registry = self.registry();
        let app_id = registry
            .canonical(key)
            .ok_or_else(|| Error::TenantNotFound(key.to_string()))?;
        let entry = registry
            .units
            .get(&app_id)
            .ok_or_else(|| Error::TenantNotFound(key.to_string()))?;
        let limits = self.limits_for(&registry, &app_id);

        Ok(UnitStats {
            unit: entry.snapshot(&app_id),
            usage: entry.usage.clone().unwrap_or_default(),
            limits,
            in_flight: entry.in_flight.load(Ordering::Relaxed),
            pending: self.pending.count_for(&app_id),
        })
    }

    /// Replace the tenant's limits. Requests already holding a permit keep it
    /// and still count as in flight; new requests use the new bound.
    pub fn update_resources(&self, key: &str, limits: ResourceLimits) -> Result<ResourceLimits> {
        limits.validate().map_err(Error::InvalidRequest)?;

        let mut registry = self.registry_mut();
        let app_id = registry
            .canonical(key)
            .ok_or_else(|| Error::TenantNotFound(key.to_string()))?;
        registry.limits.insert(app_id.clone(), limits);
        if let Some(entry) = registry.units.get_mut(&app_id) {
            entry.permits = Arc::new(Semaphore::new(limits.max_concurrent_requests as usize));
        }

        info!(
            app_id = %app_id,
            max_concurrent_requests = limits.max_concurrent_requests,
            request_timeout_ms = ?limits.request_timeout_ms,
            "Resource limits updated"
        );
        Ok(limits)
    }

    /// Snapshot of every registered unit, ordered by tenant id.
    pub fn list_units(&self) -> Vec<ExecutionUnit> {
        let registry = self.registry();
        let mut units: Vec<ExecutionUnit> = registry
            .units
            .iter()
            .map(|(app_id, entry)| entry.snapshot(app_id))
            .collect();
        units.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        units
    }

    /// Snapshot of one unit, by id or subdomain.
    pub fn unit(&self, key: &str) -> Option<ExecutionUnit> {
        let registry = self.registry();
        let app_id = registry.canonical(key)?;
        registry.units.get(&app_id).map(|e| e.snapshot(&app_id))
    }

    /// `(app_id, last_activity)` of every running unit.
    pub fn running_units(&self) -> Vec<(String, DateTime<Utc>)> {
        self.registry()
            .units
            .iter()
            .filter(|(_, e)| e.status == UnitStatus::Running)
            .map(|(id, e)| (id.clone(), e.last_activity))
            .collect()
    }

    /// Number of completed ready handshakes since the pool was created.
    pub fn handshake_count(&self) -> u64 {
        self.handshakes.load(Ordering::Relaxed)
    }

    /// Requests awaiting a reply across all units.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop every unit and close every tenant database.
    pub async fn shutdown(&self) {
        let inboxes: Vec<(String, mpsc::Sender<Message>)> = {
            let mut registry = self.registry_mut();
            registry
                .units
                .iter_mut()
                .map(|(app_id, entry)| {
                    entry.transition(UnitStatus::Terminated);
                    entry.ready.take();
                    (app_id.clone(), entry.inbox.clone())
                })
                .collect()
        };

        let count = inboxes.len();
        for (app_id, inbox) in inboxes {
            let _ = inbox.send(Message::Stop { app_id }).await;
        }
        self.broker.close_all().await;

        info!(units = count, "Unit pool shut down");
    }

    /// Route one message from a unit.
    pub fn on_message(&self, route: &UnitRoute, message: Message) {
        debug!(
            app_id = %route.app_id,
            unit_id = %route.unit_id,
            kind = %message.kind(),
            correlation_id = ?message.correlation_id(),
            "Routing unit message"
        );

        if let Some(entry) = self.registry_mut().current_mut(route) {
            entry.last_activity = Utc::now();
        }

        match message {
            Message::Ready { app_id } => self.complete_ready(route, &app_id),
            Message::Response {
                correlation_id,
                payload,
                ..
            } => self.resolve(route, &correlation_id, Ok(payload)),
            Message::Error {
                correlation_id: Some(correlation_id),
                payload,
                ..
            } => self.resolve(
                route,
                &correlation_id,
                Err(Error::HandlerFault(payload.message)),
            ),
            Message::Error {
                correlation_id: None,
                payload,
                ..
            } => self.record_fault(route, payload.message),
            Message::DbQuery {
                app_id,
                correlation_id,
                payload,
            } => {
                if app_id != route.app_id {
                    warn!(
                        app_id = %route.app_id,
                        claimed_app_id = %app_id,
                        "db_query claims another tenant; using the unit's own database"
                    );
                }
                self.forward_query(route, correlation_id, payload);
            }
            Message::Status { payload, .. } => {
                if let Some(entry) = self.registry_mut().current_mut(route) {
                    entry.usage = Some(payload);
                }
            }
            other => {
                warn!(
                    app_id = %route.app_id,
                    kind = %other.kind(),
                    "Unexpected message from execution unit"
                );
            }
        }
    }

    async fn lookup(&self, key: &str) -> Result<TenantApp> {
        find_tenant(self.store.as_ref(), key).await
    }

    /// Handle of a running unit, refreshing its activity time.
    fn running_handle(&self, key: &str) -> Option<UnitHandle> {
        let mut registry = self.registry_mut();
        let app_id = registry.canonical(key)?;
        let limits = self.limits_for(&registry, &app_id);
        let entry = registry.units.get_mut(&app_id)?;
        if entry.status != UnitStatus::Running {
            return None;
        }
        entry.last_activity = Utc::now();
        Some(UnitHandle {
            app_id,
            unit_id: entry.unit_id,
            inbox: entry.inbox.clone(),
            permits: entry.permits.clone(),
            in_flight: entry.in_flight.clone(),
            request_timeout: limits.request_timeout_ms.map(Duration::from_millis),
        })
    }

    async fn spawn_deduplicated(&self, tenant: TenantApp) -> Result<UnitHandle> {
        let app_id = tenant.id.clone();
        let spawn = {
            let mut spawning = self.spawning();
            if let Some(existing) = spawning.get(&app_id) {
                existing.future.clone()
            } else {
                // A spawn may have finished between the caller's check and now.
                if let Some(handle) = self.running_handle(&app_id) {
                    return Ok(handle);
                }
                let pool = self
                    .weak
                    .upgrade()
                    .ok_or_else(|| Error::Other("unit pool is shutting down".to_string()))?;
                let seq = self.spawn_seq.fetch_add(1, Ordering::Relaxed);
                let marker = app_id.clone();
                let task: JoinHandle<Result<UnitHandle>> = tokio::spawn(async move {
                    let result = pool.spawn_unit(tenant).await;
                    {
                        let mut spawning = pool.spawning();
                        if spawning.get(&marker).is_some_and(|m| m.seq == seq) {
                            spawning.remove(&marker);
                        }
                    }
                    result
                });

                let id = app_id.clone();
                let shared: SpawnFuture = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(Error::Other(format!("spawn task for {} failed: {}", id, e)))
                    })
                }
                .boxed()
                .shared();
                spawning.insert(
                    app_id,
                    SpawnMarker {
                        seq,
                        future: shared.clone(),
                    },
                );
                shared
            }
        };
        spawn.await
    }

    async fn spawn_unit(&self, tenant: TenantApp) -> Result<UnitHandle> {
        let app_id = tenant.id.clone();
        let unit_id = Uuid::new_v4();
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.channel_capacity);
        let (outbox_tx, outbox_rx) = mpsc::channel(self.config.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let now = Utc::now();

        {
            let mut registry = self.registry_mut();
            let limits = self.limits_for(&registry, &app_id);
            if let Some(previous) = registry.units.remove(&app_id) {
                send_stop(&previous.inbox, &app_id);
                if let Some(subdomain) = previous.subdomain {
                    registry.aliases.remove(&subdomain);
                }
            }
            if let Some(subdomain) = &tenant.subdomain {
                registry.aliases.insert(subdomain.clone(), app_id.clone());
            }
            registry.units.insert(
                app_id.clone(),
                UnitEntry {
                    subdomain: tenant.subdomain.clone(),
                    unit_id,
                    status: UnitStatus::Starting,
                    started_at: now,
                    last_activity: now,
                    error: None,
                    usage: None,
                    inbox: inbox_tx.clone(),
                    permits: Arc::new(Semaphore::new(limits.max_concurrent_requests as usize)),
                    in_flight: Arc::new(AtomicUsize::new(0)),
                    ready: Some(ready_tx),
                },
            );
        }

        info!(app_id = %app_id, unit_id = %unit_id, "Spawning execution unit");

        let route = UnitRoute {
            app_id: app_id.clone(),
            unit_id,
            inbox: inbox_tx,
        };
        let unit_task = tokio::spawn(worker::run_unit(UnitSeed {
            tenant,
            loader: self.loader.clone(),
            inbox: inbox_rx,
            outbox: outbox_tx,
            db_timeout: self.config.request_timeout,
        }));
        tokio::spawn(route_messages(self.weak.clone(), route.clone(), outbox_rx));
        tokio::spawn(observe_exit(self.weak.clone(), route, unit_task));

        let timeout = self.config.spawn_timeout;
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => self.handle_for(&app_id, unit_id),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::UnitExited(app_id)),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                self.abandon(&app_id, unit_id, timeout_ms);
                Err(Error::SpawnTimeout { app_id, timeout_ms })
            }
        }
    }

    fn handle_for(&self, app_id: &str, unit_id: Uuid) -> Result<UnitHandle> {
        match self.running_handle(app_id) {
            Some(handle) if handle.unit_id == unit_id => Ok(handle),
            _ => {
                let status = self
                    .unit(app_id)
                    .map(|u| u.status)
                    .unwrap_or(UnitStatus::Terminated);
                Err(Error::UnitNotRunning {
                    app_id: app_id.to_string(),
                    status,
                })
            }
        }
    }

    /// Give up on a unit that missed the spawn bound.
    fn abandon(&self, app_id: &str, unit_id: Uuid, timeout_ms: u64) {
        let mut registry = self.registry_mut();
        let Some(entry) = registry
            .units
            .get_mut(app_id)
            .filter(|e| e.unit_id == unit_id)
        else {
            return;
        };
        entry.transition(UnitStatus::Error);
        entry.error = Some(format!("did not become ready within {}ms", timeout_ms));
        entry.ready.take();
        send_stop(&entry.inbox, app_id);
        warn!(
            app_id = %app_id,
            unit_id = %unit_id,
            timeout_ms,
            "Execution unit missed spawn deadline; abandoned"
        );
    }

    fn complete_ready(&self, route: &UnitRoute, claimed_app_id: &str) {
        if claimed_app_id != route.app_id {
            warn!(
                app_id = %route.app_id,
                claimed_app_id = %claimed_app_id,
                "Ignoring ready for a different tenant"
            );
            return;
        }

        let mut registry = self.registry_mut();
        let Some(entry) = registry.current_mut(route) else {
            warn!(app_id = %route.app_id, unit_id = %route.unit_id, "Ignoring ready from stale unit");
            return;
        };
        if !entry.transition(UnitStatus::Running) {
            warn!(
                app_id = %route.app_id,
                unit_id = %route.unit_id,
                status = %entry.status,
                "Ignoring late ready"
            );
            return;
        }

        self.handshakes.fetch_add(1, Ordering::Relaxed);
        if let Some(ready) = entry.ready.take() {
            let _ = ready.send(Ok(()));
        }
        debug!(app_id = %route.app_id, unit_id = %route.unit_id, "Ready handshake complete");
    }

    fn resolve(&self, route: &UnitRoute, correlation_id: &str, reply: Result<ResponsePayload>) {
        if !self.pending.resolve(correlation_id, reply) {
            warn!(
                app_id = %route.app_id,
                correlation_id = %correlation_id,
                "Dropping reply for unknown or expired request"
            );
        }
    }

    fn record_fault(&self, route: &UnitRoute, message: String) {
        error!(
            app_id = %route.app_id,
            unit_id = %route.unit_id,
            error = %message,
            "Execution unit fault"
        );
        let mut registry = self.registry_mut();
        if let Some(entry) = registry.current_mut(route) {
            entry.transition(UnitStatus::Error);
            entry.error = Some(message.clone());
            if let Some(ready) = entry.ready.take() {
                let _ = ready.send(Err(Error::CompileFailure {
                    app_id: route.app_id.clone(),
                    message,
                }));
            }
        }
    }

    fn forward_query(&self, route: &UnitRoute, correlation_id: String, query: DbQuery) {
        let broker = self.broker.clone();
        let app_id = route.app_id.clone();
        let inbox = route.inbox.clone();
        tokio::spawn(async move {
            let outcome = broker.query(&app_id, &query.sql, &query.params).await;
            let result = Message::DbResult {
                app_id: app_id.clone(),
                correlation_id,
                payload: outcome,
            };
            if inbox.send(result).await.is_err() {
                debug!(app_id = %app_id, "Unit exited before its db_result was delivered");
            }
        });
    }

    fn on_unit_exit(&self, route: &UnitRoute, result: std::result::Result<UnitExit, JoinError>) {
        let failed = self
            .pending
            .fail_unit(route.unit_id, &Error::UnitExited(route.app_id.clone()));

        let mut registry = self.registry_mut();
        match result {
            Ok(exit) => {
                debug!(
                    app_id = %route.app_id,
                    unit_id = %route.unit_id,
                    exit = ?exit,
                    pending_failed = failed,
                    "Execution unit exited"
                );
                let Some(entry) = registry.current_mut(route) else {
                    return;
                };
                match exit {
                    UnitExit::Stopped | UnitExit::Disconnected => {
                        entry.transition(UnitStatus::Terminated);
                    }
                    UnitExit::Faulted(message) => {
                        entry.transition(UnitStatus::Error);
                        entry.error = Some(message.clone());
                        if let Some(ready) = entry.ready.take() {
                            let _ = ready.send(Err(Error::CompileFailure {
                                app_id: route.app_id.clone(),
                                message,
                            }));
                        }
                    }
                }
                entry.ready.take();
            }
            Err(join_error) => {
                error!(
                    app_id = %route.app_id,
                    unit_id = %route.unit_id,
                    error = %join_error,
                    pending_failed = failed,
                    "Execution unit exited abnormally"
                );
                if registry.current_mut(route).is_some()
                    && let Some(entry) = registry.units.remove(&route.app_id)
                    && let Some(subdomain) = entry.subdomain
                    && registry.aliases.get(&subdomain) == Some(&route.app_id)
                {
                    registry.aliases.remove(&subdomain);
                }
            }
        }
    }

    fn limits_for(&self, registry: &Registry, app_id: &str) -> ResourceLimits {
        registry
            .limits
            .get(app_id)
            .copied()
            .unwrap_or(self.config.default_limits)
    }

    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    fn spawning(&self) -> MutexGuard<'_, HashMap<String, SpawnMarker>> {
        self.spawning.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Find a servable tenant by id or subdomain. Tenants without a subdomain
/// cannot be addressed and count as missing.
pub(crate) async fn find_tenant(store: &dyn TenantStore, key: &str) -> Result<TenantApp> {
    let tenant = store
        .find_by_id_or_subdomain(key)
        .await?
        .ok_or_else(|| Error::TenantNotFound(key.to_string()))?;
    if tenant.subdomain.as_deref().is_none_or(str::is_empty) {
        return Err(Error::TenantNotFound(key.to_string()));
    }
    Ok(tenant)
}

/// Ask a unit to exit without waiting on its inbox.
fn send_stop(inbox: &mpsc::Sender<Message>, app_id: &str) {
    let stop = Message::Stop {
        app_id: app_id.to_string(),
    };
    if let Err(mpsc::error::TrySendError::Full(stop)) = inbox.try_send(stop) {
        let inbox = inbox.clone();
        tokio::spawn(async move {
            let _ = inbox.send(stop).await;
        });
    }
}

/// Per-unit router: feeds the unit's outbox into the pool.
async fn route_messages(
    pool: Weak<UnitPool>,
    route: UnitRoute,
    mut outbox: mpsc::Receiver<Message>,
) {
    while let Some(message) = outbox.recv().await {
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.on_message(&route, message);
    }
}

/// Waits for the unit task and reports how it ended.
async fn observe_exit(pool: Weak<UnitPool>, route: UnitRoute, task: JoinHandle<UnitExit>) {
    let result = task.await;
    if let Some(pool) = pool.upgrade() {
        pool.on_unit_exit(&route, result);
    }
}
