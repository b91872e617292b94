// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for tenvisor-environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::strategy::ExecutionMode;

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tenant store SQLite file
    pub tenant_db: PathBuf,
    /// Root for per-tenant databases
    pub data_dir: PathBuf,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Domain whose subdomains select tenants (e.g. `apps.example.com`)
    pub base_domain: Option<String>,
    /// Forced execution mode; `None` detects from the platform
    pub execution_mode: Option<ExecutionMode>,
    /// Bound on unit bootstrap
    pub spawn_timeout: Duration,
    /// Bound on a single pending request
    pub request_timeout: Duration,
    /// Inactivity before a unit is suspended
    pub idle_timeout: Duration,
    /// Watchdog sweep interval
    pub watchdog_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(
            get("TENVISOR_DATA_DIR")
                .or_else(|| get("DATA_DIR"))
                .unwrap_or_else(|| ".data".to_string()),
        );

        let tenant_db = get("TENVISOR_TENANT_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("tenants.db"));

        let port: u16 = match get("TENVISOR_HTTP_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("TENVISOR_HTTP_PORT", raw))?,
            None => 8080,
        };
        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let base_domain = get("TENVISOR_BASE_DOMAIN")
            .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty());

        let execution_mode = match get("TENVISOR_EXECUTION_MODE") {
            Some(raw) => parse_mode(&raw)?,
            None => None,
        };

        Ok(Self {
            tenant_db,
            data_dir,
            http_addr,
            base_domain,
            execution_mode,
            spawn_timeout: secs(&get, "TENVISOR_SPAWN_TIMEOUT_SECS", 20)?,
            request_timeout: secs(&get, "TENVISOR_REQUEST_TIMEOUT_SECS", 30)?,
            idle_timeout: secs(&get, "TENVISOR_IDLE_TIMEOUT_SECS", 600)?,
            watchdog_interval: secs(&get, "TENVISOR_WATCHDOG_INTERVAL_SECS", 60)?,
        })
    }
}

fn parse_mode(raw: &str) -> Result<Option<ExecutionMode>, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "auto" => Ok(None),
        other => other
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid("TENVISOR_EXECUTION_MODE", raw.to_string())),
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(raw) = get(var) else {
        return Ok(Duration::from_secs(default));
    };
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ConfigError::Invalid(var, raw)),
        Ok(n) => Ok(Duration::from_secs(n)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A variable holds a value that cannot be used.
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}


#[cfg(test)]
mod tests {
    use super::test_env::{ENV_MUTEX, EnvGuard};
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.tenant_db, PathBuf::from(".data/tenants.db"));
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.base_domain, None);
        assert_eq!(config.execution_mode, None);
        assert_eq!(config.spawn_timeout, Duration::from_secs(20));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.watchdog_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATA_DIR", "/var/lib/fallback"),
            ("TENVISOR_DATA_DIR", "/var/lib/tenvisor"),
            ("TENVISOR_HTTP_PORT", "9000"),
            ("TENVISOR_BASE_DOMAIN", ".Apps.Example.com"),
            ("TENVISOR_EXECUTION_MODE", "Stateless"),
            ("TENVISOR_SPAWN_TIMEOUT_SECS", "15"),
            ("TENVISOR_IDLE_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/tenvisor"));
        assert_eq!(config.tenant_db, PathBuf::from("/var/lib/tenvisor/tenants.db"));
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.base_domain.as_deref(), Some("apps.example.com"));
        assert_eq!(config.execution_mode, Some(ExecutionMode::Stateless));
        assert_eq!(config.spawn_timeout, Duration::from_secs(15));
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_auto_mode_means_detect() {
        let config = Config::from_lookup(lookup(&[("TENVISOR_EXECUTION_MODE", "auto")])).unwrap();
        assert_eq!(config.execution_mode, None);
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("TENVISOR_HTTP_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TENVISOR_HTTP_PORT", _)));

        let err = Config::from_lookup(lookup(&[("TENVISOR_REQUEST_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TENVISOR_REQUEST_TIMEOUT_SECS", _)));

        let err = Config::from_lookup(lookup(&[("TENVISOR_EXECUTION_MODE", "edge")])).unwrap_err();
        assert!(err.to_string().contains("TENVISOR_EXECUTION_MODE"));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let mut guard = EnvGuard::new();
        guard.set("TENVISOR_TENANT_DB", "/tmp/tenvisor-test/tenants.db");
        guard.set("TENVISOR_WATCHDOG_INTERVAL_SECS", "7");
        guard.remove("TENVISOR_HTTP_PORT");
        guard.remove("TENVISOR_EXECUTION_MODE");

        let config = Config::from_env().unwrap();
        assert_eq!(config.tenant_db, PathBuf::from("/tmp/tenvisor-test/tenants.db"));
        assert_eq!(config.watchdog_interval, Duration::from_secs(7));
        assert_eq!(config.http_addr.port(), 8080);
    }
}
