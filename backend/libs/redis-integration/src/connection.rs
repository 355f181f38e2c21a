//! Single synchronous connection with last-error bookkeeping

use crate::config::StoreConfig;
use crate::error::ConnectionError;
use redis::{Client, Connection, ErrorKind, RedisError};
use tracing::{debug, info, warn};

/// Owns the one synchronous connection of an integration instance.
///
/// There is no implicit reconnection: once a handle is held, `connect` refuses
/// to run until `disconnect` releases it.
pub struct ConnectionManager {
    config: StoreConfig,
    connection: Option<Connection>,
    last_error: String,
}

impl ConnectionManager {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            connection: None,
            last_error: String::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open the connection with the configured timeout
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.connection.is_some() {
            return Err(self.fail(ConnectionError::AlreadyConnected));
        }

        let client = match Client::open(self.config.connection_info()) {
            Ok(client) => client,
            Err(err) => return Err(self.fail(ConnectionError::ConnectFailed(err.to_string()))),
        };

        let timeout = self.config.timeout;
        let result = if timeout.is_zero() {
            client.get_connection()
        } else {
            client.get_connection_with_timeout(timeout)
        };

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => return Err(self.fail(classify(err))),
        };

        if !timeout.is_zero() {
            let applied = connection
                .set_read_timeout(Some(timeout))
                .and_then(|_| connection.set_write_timeout(Some(timeout)));
            if let Err(err) = applied {
                // Dropping the handle closes the socket; a later connect may retry.
                return Err(self.fail(ConnectionError::Handshake(err.to_string())));
            }
        }

        let (timeout_secs, timeout_usec) = self.config.timeout_parts();
        info!(
            addr = %self.config.addr_label(),
            db = self.config.database,
            timeout_secs,
            timeout_usec,
            "Redis connection established"
        );
        self.connection = Some(connection);
        self.last_error.clear();
        Ok(())
    }

    /// Release the handle so a fresh `connect` is possible
    pub fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            debug!(addr = %self.config.addr_label(), "Redis connection released");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Most recent error message, empty if none
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub(crate) fn set_last_error(&mut self, message: impl Into<String>) {
        self.last_error = message.into();
    }

    /// Raw connection for issuing arbitrary commands
    pub fn connection(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        warn!(addr = %self.config.addr_label(), error = %err, "Redis connect failed");
        self.last_error = err.to_string();
        err
    }
}

/// Transport-level failures never produced a handle; everything else is the
/// store refusing the session (AUTH, SELECT, protocol).
fn classify(err: RedisError) -> ConnectionError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err.kind() == ErrorKind::InvalidClientConfig
    {
        ConnectionError::ConnectFailed(err.to_string())
    } else {
        ConnectionError::Handshake(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_manager_is_disconnected() {
        let mut manager = ConnectionManager::new(StoreConfig::default());
        assert!(!manager.is_connected());
        assert_eq!(manager.last_error(), "");
        assert!(manager.connection().is_none());
    }

    #[test]
    fn test_connect_refused_records_error() {
        // Port 1 on loopback is never a Redis server.
        let mut manager = ConnectionManager::new(StoreConfig::new("127.0.0.1", 1, 200_000));

        let err = manager.connect().unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed(_)));
        assert!(!manager.is_connected());
        assert_eq!(manager.last_error(), err.to_string());

        // No handle was kept, so a retry goes through the same path again.
        let err = manager.connect().unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed(_)));
    }

    #[test]
    fn test_classify_errors() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(classify(io), ConnectionError::ConnectFailed(_)));

        let auth = RedisError::from((ErrorKind::AuthenticationFailed, "WRONGPASS"));
        assert!(matches!(classify(auth), ConnectionError::Handshake(_)));
    }

    #[test]
    fn test_disconnect_without_connection_is_noop() {
        let mut manager = ConnectionManager::new(StoreConfig::default());
        manager.disconnect();
        assert!(!manager.is_connected());
    }
}
