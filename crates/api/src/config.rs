//! Process configuration for the API binary.

use std::net::SocketAddr;

use troubadour_infra::config::{ConfigError, WorkerConfig, parse_or};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Postgres-backed stores instead of in-memory ones.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub max_db_connections: u32,
    pub audio_endpoint: Option<String>,
    pub critique_endpoint: Option<String>,
    pub compare_endpoint: Option<String>,
    pub notify_webhook: Option<String>,
    pub worker: WorkerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
        let use_persistent_stores = parse_or(&lookup, "USE_PERSISTENT_STORES", false)?;
        let database_url = optional("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            bind_addr,
            use_persistent_stores,
            database_url,
            max_db_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            audio_endpoint: optional("TROUBADOUR_AUDIO_ENDPOINT"),
            critique_endpoint: optional("TROUBADOUR_CRITIQUE_ENDPOINT"),
            compare_endpoint: optional("TROUBADOUR_COMPARE_ENDPOINT"),
            notify_webhook: optional("TROUBADOUR_NOTIFY_WEBHOOK"),
            worker: WorkerConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
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
    fn in_memory_defaults() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert!(!cfg.use_persistent_stores);
        assert!(cfg.audio_endpoint.is_none());
        assert_eq!(cfg.worker.default_max_attempts, 3);
    }

    #[test]
    fn persistent_stores_need_a_database() {
        let err = AppConfig::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let cfg = AppConfig::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/troubadour"),
        ]))
        .unwrap();
        assert!(cfg.use_persistent_stores);
    }

    #[test]
    fn bad_bind_addr_is_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[("BIND_ADDR", "not-an-addr")])).is_err());
    }
}
