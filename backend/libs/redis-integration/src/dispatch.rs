//! Keyspace notification dispatch loop
//!
//! The loop owns its own async connection, separate from the synchronous one
//! held by [`ConnectionManager`](crate::ConnectionManager). Handlers run inline
//! on the loop, one at a time; a slow handler delays every later event, so
//! long work should be handed to another task by the handler itself.

use crate::config::StoreConfig;
use crate::error::DispatchError;
use crate::notifications::{KeyspaceEvent, NotificationRegistry, UserContext};
use crate::stats::{DispatchStats, StatsCollector};
use futures_util::StreamExt;
use redis::Client;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Stops a running dispatch loop from another thread or task
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the loop to return. Only affects a loop that is already running.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Stats and shutdown plumbing shared by every run of the loop
pub struct DispatchLoop {
    stats: StatsCollector,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Default for DispatchLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchLoop {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            stats: StatsCollector::new(),
            shutdown: Arc::new(tx),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }

    /// Connect, configure notifications, subscribe every registered pattern
    /// and dispatch until shutdown or transport loss.
    pub async fn run(
        &self,
        store: &StoreConfig,
        registry: &NotificationRegistry,
        context: Option<&UserContext>,
        notify_config: &str,
    ) -> Result<(), DispatchError> {
        self.shutdown.send_replace(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        self.stats.reset();

        let client = Client::open(store.connection_info())
            .map_err(|err| DispatchError::AsyncConnect(err.to_string()))?;

        configure_notifications(&client, store.timeout, notify_config).await?;

        let mut pubsub = bounded(store.timeout, client.get_async_pubsub()).await?;
        for pattern in registry.patterns() {
            info!(pattern = %pattern, "Subscribing to keyspace notifications");
            if let Err(source) = pubsub.psubscribe(&pattern).await {
                return Err(DispatchError::Subscribe { pattern, source });
            }
        }

        info!(
            addr = %store.addr_label(),
            patterns = registry.len(),
            "Notification dispatch loop running"
        );

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Notification dispatch loop shutting down");
                        return Ok(());
                    }
                }
                msg = stream.next() => match msg {
                    Some(msg) => {
                        let pattern: String = match msg.get_pattern() {
                            Ok(pattern) => pattern,
                            Err(err) => {
                                warn!(error = %err, channel = %msg.get_channel_name(), "Message without pattern");
                                self.stats.record_receive();
                                self.stats.record_unmatched();
                                continue;
                            }
                        };
                        let payload = String::from_utf8_lossy(msg.get_payload_bytes()).into_owned();
                        self.deliver(registry, context, pattern, msg.get_channel_name().to_string(), payload);
                    }
                    None => {
                        error!(addr = %store.addr_label(), "Notification stream closed");
                        return Err(DispatchError::StreamClosed);
                    }
                },
            }
        }
    }

    /// Blocking variant of [`run`](Self::run) on a single-threaded runtime.
    ///
    /// Fails with `NestedRuntime` when called from inside a tokio runtime.
    pub fn run_blocking(
        &self,
        store: &StoreConfig,
        registry: &NotificationRegistry,
        context: Option<&UserContext>,
        notify_config: &str,
    ) -> Result<(), DispatchError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(DispatchError::NestedRuntime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(store, registry, context, notify_config))
    }

    /// Hand one message to the handler registered for its pattern
    fn deliver(
        &self,
        registry: &NotificationRegistry,
        context: Option<&UserContext>,
        pattern: String,
        channel: String,
        payload: String,
    ) {
        self.stats.record_receive();

        let Some(handler) = registry.get(&pattern) else {
            debug!(pattern = %pattern, channel = %channel, "No handler for pattern");
            self.stats.record_unmatched();
            return;
        };

        let event = KeyspaceEvent::new(pattern, channel, payload);
        debug!(
            channel = %event.channel,
            kind = %event.kind,
            key = ?event.key,
            event = ?event.event,
            "Dispatching keyspace event"
        );

        match catch_unwind(AssertUnwindSafe(|| handler(&event, context))) {
            Ok(()) => self.stats.record_dispatch(),
            Err(_) => {
                self.stats.record_panic();
                error!(pattern = %event.pattern, channel = %event.channel, "Notification handler panicked");
            }
        }
    }
}

/// `CONFIG SET notify-keyspace-events` on a short-lived connection that is
/// closed before subscribing
async fn configure_notifications(
    client: &Client,
    timeout: Duration,
    notify_config: &str,
) -> Result<(), DispatchError> {
    let mut conn = bounded(timeout, client.get_multiplexed_async_connection()).await?;
    redis::cmd("CONFIG")
        .arg("SET")
        .arg("notify-keyspace-events")
        .arg(notify_config)
        .query_async::<_, ()>(&mut conn)
        .await
        .map_err(DispatchError::Configure)?;
    drop(conn);

    info!(notify_keyspace_events = %notify_config, "Keyspace notifications configured");
    Ok(())
}

/// Await a connect future, failing with `AsyncConnect` on error or timeout
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, DispatchError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    let result = if timeout.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                return Err(DispatchError::AsyncConnect(format!(
                    "timed out after {:?}",
                    timeout
                )))
            }
        }
    };
    result.map_err(|err| DispatchError::AsyncConnect(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationHandler;
    use std::sync::Mutex;

    fn recording_handler(seen: Arc<Mutex<Vec<KeyspaceEvent>>>) -> NotificationHandler {
        Arc::new(move |event, _ctx| {
            seen.lock().unwrap().push(event.clone());
        })
    }

    #[test]
    fn test_deliver_matching_pattern() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NotificationRegistry::new();
        registry.register("event", 0, "Foo:*", recording_handler(seen.clone()));

        let dispatch = DispatchLoop::new();
        dispatch.deliver(
            &registry,
            None,
            "__keyevent@0__:Foo:*".to_string(),
            "__keyevent@0__:set".to_string(),
            "Foo:1".to_string(),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].key.as_deref(), Some("Foo:1"));
        assert_eq!(seen[0].event.as_deref(), Some("set"));

        let stats = dispatch.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_dispatched, 1);
    }

    #[test]
    fn test_deliver_unknown_pattern() {
        let registry = NotificationRegistry::new();
        let dispatch = DispatchLoop::new();
        dispatch.deliver(
            &registry,
            None,
            "__keyspace@0__:*".to_string(),
            "__keyspace@0__:k".to_string(),
            "set".to_string(),
        );

        let stats = dispatch.stats();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_unmatched, 1);
        assert_eq!(stats.events_dispatched, 0);
    }

    #[test]
    fn test_deliver_passes_context() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let handler: NotificationHandler = Arc::new(move |_event, ctx| {
            let value = ctx.and_then(|c| c.downcast_ref::<u32>()).copied();
            *seen_clone.lock().unwrap() = value;
        });

        let mut registry = NotificationRegistry::new();
        let pattern = registry.register("space", 3, "*", handler);
        let context: UserContext = Arc::new(42u32);

        let dispatch = DispatchLoop::new();
        dispatch.deliver(
            &registry,
            Some(&context),
            pattern,
            "__keyspace@3__:k".to_string(),
            "expired".to_string(),
        );

        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let mut registry = NotificationRegistry::new();
        let pattern = registry.register("event", 0, "*", Arc::new(|_, _| panic!("boom")));

        let dispatch = DispatchLoop::new();
        for _ in 0..2 {
            dispatch.deliver(
                &registry,
                None,
                pattern.clone(),
                "__keyevent@0__:del".to_string(),
                "k".to_string(),
            );
        }

        let stats = dispatch.stats();
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.handler_panics, 2);
        assert_eq!(stats.events_dispatched, 0);
    }

    #[tokio::test]
    async fn test_run_blocking_inside_runtime_is_rejected() {
        let dispatch = DispatchLoop::new();
        let result = dispatch.run_blocking(
            &StoreConfig::default(),
            &NotificationRegistry::new(),
            None,
            "KEA",
        );
        assert!(matches!(result, Err(DispatchError::NestedRuntime)));
    }

    #[tokio::test]
    async fn test_configure_unreachable_store() {
        let client = Client::open(StoreConfig::new("127.0.0.1", 1, 200_000).connection_info()).unwrap();
        let result = configure_notifications(&client, Duration::from_millis(200), "KEA").await;
        assert!(matches!(result, Err(DispatchError::AsyncConnect(_))));
    }

    #[test]
    fn test_run_resets_stats() {
        let registry = NotificationRegistry::new();
        let dispatch = DispatchLoop::new();
        dispatch.deliver(
            &registry,
            None,
            "__keyspace@0__:*".to_string(),
            "__keyspace@0__:k".to_string(),
            "set".to_string(),
        );
        assert_eq!(dispatch.stats().events_received, 1);

        let result = dispatch.run_blocking(
            &StoreConfig::new("127.0.0.1", 1, 200_000),
            &registry,
            None,
            "KEA",
        );
        assert!(matches!(result, Err(DispatchError::AsyncConnect(_))));
        assert_eq!(dispatch.stats(), DispatchStats::default());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), _> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(DispatchError::AsyncConnect(_))));
    }
}
