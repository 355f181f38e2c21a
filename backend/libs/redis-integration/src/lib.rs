//! Redis integration layer
//!
//! Wraps one Redis instance for an application that needs three things:
//!
//! - a single synchronous connection with explicit lifecycle,
//! - Lua scripts uploaded once and invoked by SHA-1 (`EVALSHA`),
//! - keyspace notifications dispatched to registered handlers.
//!
//! # Architecture
//!
//! ```text
//! RedisIntegration
//!   ├── ConnectionManager   sync connection, last error
//!   ├── ScriptCache         script path -> sha1
//!   ├── NotificationRegistry  __key<class>@<db>__:<prefix> -> handler
//!   └── DispatchLoop        own async connection, PSUBSCRIBE, handler calls
//! ```
//!
//! Scripts and handlers are registered during setup through `&mut self`;
//! [`RedisIntegration::run_loop`] takes `&self`, so nothing can be registered
//! while the loop is running.
//!
//! # Example
//!
//! ```no_run
//! use redis_integration::{RedisIntegration, StoreConfig};
//! use std::sync::Arc;
//!
//! let mut redis = RedisIntegration::new(StoreConfig::new("127.0.0.1", 6379, 500_000));
//! redis.connect()?;
//!
//! let loaded = redis.load_script_dir("./scripts", "*.lua");
//! println!("{} scripts loaded", loaded);
//!
//! redis.register_callback("event", 0, "OpticalLink:*", Arc::new(|event, _ctx| {
//!     println!("{:?} on {:?}", event.event, event.key);
//! }));
//!
//! // Blocks until shutdown or the connection drops.
//! redis.run_loop("KEA")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod connection;
mod dispatch;
mod error;
mod notifications;
mod scripts;
mod stats;

pub use config::{
    IntegrationConfig, StoreConfig, DEFAULT_NOTIFY_KEYSPACE_EVENTS, DEFAULT_SCRIPT_PATTERN,
};
pub use connection::ConnectionManager;
pub use dispatch::{DispatchLoop, ShutdownHandle};
pub use error::{ConfigError, ConnectionError, DispatchError, ScriptError};
pub use notifications::{
    notification_pattern, KeyspaceEvent, NotificationHandler, NotificationKind,
    NotificationRegistry, UserContext,
};
pub use scripts::{script_files, script_sha1, ScriptCache, SCRIPT_SHA_LEN};
pub use stats::{DispatchStats, StatsCollector};

use redis::FromRedisValue;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One Redis instance: sync connection, script cache and notification loop
pub struct RedisIntegration {
    connection: ConnectionManager,
    scripts: ScriptCache,
    notifications: NotificationRegistry,
    dispatch: DispatchLoop,
    context: Option<UserContext>,
}

impl RedisIntegration {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            connection: ConnectionManager::new(config),
            scripts: ScriptCache::new(),
            notifications: NotificationRegistry::new(),
            dispatch: DispatchLoop::new(),
            context: None,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        self.connection.config()
    }

    /// Open the synchronous connection; fails if one is already held
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        self.connection.connect()
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn last_error(&self) -> &str {
        self.connection.last_error()
    }

    /// Raw synchronous connection for ad-hoc commands
    pub fn connection(&mut self) -> Option<&mut redis::Connection> {
        self.connection.connection()
    }

    /// Upload a script body and return its SHA-1 handle. The cache is not
    /// touched; `None` means not connected or a rejected upload.
    pub fn load_script(&mut self, body: impl AsRef<[u8]>) -> Option<String> {
        scripts::load_script(&mut self.connection, body.as_ref())
    }

    /// Upload every file under `path` matching the glob `pattern` and cache
    /// the handles by file path. Returns how many scripts were cached.
    pub fn load_script_dir(&mut self, path: &str, pattern: &str) -> usize {
        scripts::load_script_dir(&mut self.connection, &mut self.scripts, path, pattern)
    }

    /// [`load_script_dir`](Self::load_script_dir) with the `*.*` pattern
    pub fn load_script_dir_default(&mut self, path: &str) -> usize {
        self.load_script_dir(path, DEFAULT_SCRIPT_PATTERN)
    }

    pub fn sha_by_script_name(&self, identity: &str) -> Option<&str> {
        self.scripts.get(identity)
    }

    pub fn all_scripts(&self) -> BTreeMap<String, String> {
        self.scripts.snapshot()
    }

    /// Run a cached script by the identity it was loaded under
    pub fn invoke_script<T: FromRedisValue>(
        &mut self,
        identity: &str,
        keys: &[&str],
        args: &[&str],
    ) -> Result<T, ScriptError> {
        scripts::invoke_script(&mut self.connection, &self.scripts, identity, keys, args)
    }

    /// Register `handler` for `__key<class>@<database>__:<prefix>` and return
    /// the pattern. Re-registering a pattern replaces its handler.
    pub fn register_callback(
        &mut self,
        class: &str,
        database: u32,
        prefix: &str,
        handler: NotificationHandler,
    ) -> String {
        self.notifications.register(class, database, prefix, handler)
    }

    pub fn notifications(&self) -> &NotificationRegistry {
        &self.notifications
    }

    /// State handed to every handler invocation
    pub fn set_user_context<T: Any + Send + Sync>(&mut self, context: T) {
        self.context = Some(Arc::new(context));
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.dispatch.shutdown_handle()
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatch.stats()
    }

    /// Async dispatch loop; see [`run_loop`](Self::run_loop)
    pub async fn run(&self, notify_config: &str) -> Result<(), DispatchError> {
        self.dispatch
            .run(
                self.connection.config(),
                &self.notifications,
                self.context.as_ref(),
                notify_config,
            )
            .await
    }

    /// Configure `notify-keyspace-events`, subscribe every registered
    /// pattern and dispatch events until shutdown. Blocks the calling thread.
    ///
    /// Patterns registered after this call starts are not subscribed.
    pub fn run_loop(&self, notify_config: &str) -> Result<(), DispatchError> {
        self.dispatch.run_blocking(
            self.connection.config(),
            &self.notifications,
            self.context.as_ref(),
            notify_config,
        )
    }
}
