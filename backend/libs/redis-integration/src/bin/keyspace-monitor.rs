//! Logs keyspace events for one database and keeps a script directory loaded
//!
//! Run with: cargo run --bin keyspace-monitor
//!
//! Configured through REDIS_HOST, REDIS_PORT, REDIS_DB, SCRIPT_DIR,
//! SCRIPT_PATTERN and NOTIFY_KEYSPACE_EVENTS (a `.env` file is honoured).

use anyhow::{Context, Result};
use redis_integration::{IntegrationConfig, KeyspaceEvent, RedisIntegration, UserContext};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct MonitorContext {
    instance: String,
}

fn log_event(event: &KeyspaceEvent, ctx: Option<&UserContext>) {
    let instance = ctx
        .and_then(|c| c.downcast_ref::<MonitorContext>())
        .map(|c| c.instance.as_str())
        .unwrap_or("-");

    info!(
        instance = %instance,
        kind = %event.kind,
        db = ?event.database,
        key = ?event.key,
        event = ?event.event,
        "Keyspace event"
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = IntegrationConfig::from_env().context("failed to load configuration")?;
    let database = u32::try_from(config.store.database).context("REDIS_DB must be non-negative")?;

    let mut redis = RedisIntegration::new(config.store.clone());
    redis.connect().context("failed to connect to Redis")?;

    if let Some(dir) = &config.script_dir {
        let loaded = redis.load_script_dir(dir, &config.script_pattern);
        info!(dir = %dir, loaded, "Scripts loaded");
        for (script, sha) in redis.all_scripts() {
            info!(script = %script, sha = %sha, "Script available");
        }
    }

    redis.set_user_context(MonitorContext {
        instance: config.store.addr_label(),
    });
    redis.register_callback("event", database, "*", Arc::new(log_event));

    let shutdown = redis.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    redis
        .run(&config.notify_keyspace_events)
        .await
        .context("notification loop failed")?;

    let stats = redis.stats();
    info!(
        received = stats.events_received,
        dispatched = stats.events_dispatched,
        "Keyspace monitor stopped"
    );
    Ok(())
}
