//! Connection and loader configuration

use crate::error::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default glob used when loading a script directory
pub const DEFAULT_SCRIPT_PATTERN: &str = "*.*";

/// Default `notify-keyspace-events` value: keyspace + keyevent channels, all classes
pub const DEFAULT_NOTIFY_KEYSPACE_EVENTS: &str = "KEA";

/// Where the store lives and how long a single blocking call may take
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    /// Connect/command timeout, microsecond resolution
    pub timeout: Duration,
    pub database: i64,
    pub password: Option<String>,
}

impl StoreConfig {
    /// Build a config from a host, port and a timeout in microseconds
    pub fn new(host: impl Into<String>, port: u16, timeout_usec: u64) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::new(
                timeout_usec / 1_000_000,
                ((timeout_usec % 1_000_000) * 1_000) as u32,
            ),
            database: 0,
            password: None,
        }
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Timeout split into whole seconds and remaining microseconds
    pub fn timeout_parts(&self) -> (u64, u32) {
        (self.timeout.as_secs(), self.timeout.subsec_micros())
    }

    pub fn addr_label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.database,
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 6379, 500_000)
    }
}

/// Full configuration for the integration layer and the monitor binary
#[derive(Debug, Clone)]
pub struct IntegrationConfig {
    pub store: StoreConfig,
    pub script_dir: Option<String>,
    pub script_pattern: String,
    pub notify_keyspace_events: String,
}

impl IntegrationConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = parse_var("REDIS_PORT", 6379)?;
        let timeout_usec: u64 = parse_var("REDIS_TIMEOUT_USEC", 500_000)?;
        let database: i64 = parse_var("REDIS_DB", 0)?;

        let mut store = StoreConfig::new(host, port, timeout_usec).with_database(database);
        if let Ok(password) = env::var("REDIS_PASSWORD") {
            if !password.is_empty() {
                store = store.with_password(password);
            }
        }

        Ok(Self {
            store,
            script_dir: env::var("SCRIPT_DIR").ok().filter(|s| !s.is_empty()),
            script_pattern: env::var("SCRIPT_PATTERN")
                .unwrap_or_else(|_| DEFAULT_SCRIPT_PATTERN.to_string()),
            notify_keyspace_events: env::var("NOTIFY_KEYSPACE_EVENTS")
                .unwrap_or_else(|_| DEFAULT_NOTIFY_KEYSPACE_EVENTS.to_string()),
        })
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}
