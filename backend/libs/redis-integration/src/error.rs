//! Error types for the Redis integration layer

use thiserror::Error;

/// Failures while establishing the synchronous connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// A handle is still held; call `disconnect` first
    #[error("Reconnection needed, connection not clean")]
    AlreadyConnected,

    /// No connection could be produced (bad address, refused, timed out)
    #[error("Connection could not be created: {0}")]
    ConnectFailed(String),

    /// The store answered but rejected the connection setup
    #[error("Connection error: {0}")]
    Handshake(String),
}

/// Failures while invoking a cached script
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Not connected, call connect first")]
    NotConnected,

    #[error("Unknown script: {0}")]
    UnknownScript(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Fatal failures of the notification dispatch loop
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The loop's own async connection could not be opened
    #[error("Async connection failed: {0}")]
    AsyncConnect(String),

    /// `CONFIG SET notify-keyspace-events` was rejected
    #[error("Failed to configure keyspace notifications: {0}")]
    Configure(#[source] redis::RedisError),

    #[error("Failed to subscribe to {pattern}: {source}")]
    Subscribe {
        pattern: String,
        #[source]
        source: redis::RedisError,
    },

    /// The blocking runtime could not be built
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// `run_blocking` was called from a thread already driving a tokio runtime
    #[error("Blocking dispatch loop started inside a tokio runtime, use run instead")]
    NestedRuntime,

    /// The notification stream ended without a shutdown request
    #[error("Notification stream closed by the server")]
    StreamClosed,
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ConnectionError::AlreadyConnected.to_string(),
            "Reconnection needed, connection not clean"
        );

        let err = ConnectionError::Handshake("NOAUTH".to_string());
        assert_eq!(err.to_string(), "Connection error: NOAUTH");

        let err = ScriptError::UnknownScript("./scripts/missing.lua".to_string());
        assert_eq!(err.to_string(), "Unknown script: ./scripts/missing.lua");
    }

    #[test]
    fn test_error_from_redis() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "broken pipe"));
        let err: ScriptError = redis_err.into();
        assert!(matches!(err, ScriptError::Redis(_)));
    }

    #[test]
    fn test_subscribe_error_names_pattern() {
        let err = DispatchError::Subscribe {
            pattern: "__keyevent@0__:*".to_string(),
            source: redis::RedisError::from((redis::ErrorKind::IoError, "reset")),
        };
        assert!(err.to_string().contains("__keyevent@0__:*"));
    }
}
