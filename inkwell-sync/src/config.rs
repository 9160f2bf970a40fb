//! Service configuration.
//!
//! Everything has a working default; [`ServerConfig::from_env`] overrides
//! individual fields from `INKWELL_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::FlushPolicy;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:1234";

/// How attach requests for documents without a readable ACL are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    /// Owner, collaborator or public document; anything else is refused.
    #[default]
    Enforce,
    /// Every attach is allowed; refusals are logged as warnings.
    Permissive,
}

impl FromStr for AccessPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enforce" => Ok(AccessPolicy::Enforce),
            "permissive" => Ok(AccessPolicy::Permissive),
            other => Err(ConfigError::Invalid {
                key: "INKWELL_ACCESS_POLICY",
                value: other.to_string(),
            }),
        }
    }
}

/// Flush timing and failure tolerance.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Quiet period after the last edit before a flush.
    pub debounce: Duration,
    /// Upper bound on time between the first unflushed edit and a flush.
    pub max_debounce: Duration,
    /// Consecutive flush failures before clients are told the session is degraded.
    pub degraded_after_failures: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2000),
            max_debounce: Duration::from_millis(30_000),
            degraded_after_failures: 3,
        }
    }
}

impl PersistenceConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::new(self.debounce, self.max_debounce)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:1234")
    pub bind_addr: SocketAddr,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Maximum connections per document
    pub max_connections_per_document: usize,
    /// RocksDB directory; `None` runs on the in-memory store. That store
    /// starts with no documents or grants, so under
    /// [`AccessPolicy::Enforce`] every attach is refused until they are
    /// added through the CRUD layer.
    pub storage_path: Option<PathBuf>,
    pub persistence: PersistenceConfig,
    pub access_policy: AccessPolicy,
    /// Largest accepted awareness payload in bytes
    pub max_awareness_bytes: usize,
    /// Time a fresh socket has to send its `Auth` message
    pub auth_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1234)),
            broadcast_capacity: 256,
            max_connections_per_document: 100,
            storage_path: None,
            persistence: PersistenceConfig::default(),
            access_policy: AccessPolicy::default(),
            max_awareness_bytes: 4096,
            auth_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `INKWELL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("INKWELL_BIND_ADDR") {
            config.bind_addr = parse("INKWELL_BIND_ADDR", &addr)?;
        }
        if let Some(path) = lookup("INKWELL_STORAGE_PATH") {
            if !path.trim().is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        }
        if let Some(ms) = lookup("INKWELL_DEBOUNCE_MS") {
            config.persistence.debounce =
                Duration::from_millis(parse("INKWELL_DEBOUNCE_MS", &ms)?);
        }
        if let Some(ms) = lookup("INKWELL_MAX_DEBOUNCE_MS") {
            config.persistence.max_debounce =
                Duration::from_millis(parse("INKWELL_MAX_DEBOUNCE_MS", &ms)?);
        }
        if let Some(policy) = lookup("INKWELL_ACCESS_POLICY") {
            config.access_policy = policy.parse()?;
        }

        if config.persistence.max_debounce < config.persistence.debounce {
            return Err(ConfigError::Invalid {
                key: "INKWELL_MAX_DEBOUNCE_MS",
                value: format!(
                    "{}ms is shorter than the debounce",
                    config.persistence.max_debounce.as_millis()
                ),
            });
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
