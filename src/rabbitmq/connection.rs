use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::amqp_client::AmqpTransport;
use super::errors::{MessageBusError, Result};
use super::shutdown::Shutdown;
use super::transport::{BrokerChannel, BrokerConnection, BrokerTransport};
use crate::config::ConnectionConfig;

/// Owns the process' single broker connection and hands out fresh channels.
///
/// The connection is opened lazily and replaced when it reports closed.
/// Concurrent callers queue on the same lock, so at most one connection is
/// ever alive per manager. Channels are never pooled: every call to
/// [`ConnectionManager::acquire_channel`] opens a new one.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn BrokerTransport>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    disposed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(config, Arc::new(AmqpTransport))
    }

    pub fn with_transport(config: ConnectionConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            config,
            transport,
            connection: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub async fn acquire_channel(&self, shutdown: &Shutdown) -> Result<Arc<dyn BrokerChannel>> {
        if self.is_disposed() {
            return Err(MessageBusError::Disposed);
        }

        let connection = shutdown.run_until(self.get_connection()).await?;
        shutdown.run_until(connection.create_channel()).await
    }

    async fn get_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut guard = self.connection.lock().await;

        // dispose() may have won the race for the lock
        if self.is_disposed() {
            return Err(MessageBusError::Disposed);
        }

        if let Some(connection) = guard.as_ref() {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
            warn!(client = %self.config.client_name, "RabbitMQ connection is closed, reconnecting");
        }

        // A closed connection is replaced, never kept alongside the new one
        guard.take();
        let connection = self.transport.connect(&self.config).await?;
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Closes the connection if it is open. Repeated calls are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let connection = self.connection.lock().await.take();
        match connection {
            Some(connection) if connection.is_open() => {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close RabbitMQ connection: {}", e);
                }
            }
            _ => debug!("No open RabbitMQ connection to close"),
        }
        info!(client = %self.config.client_name, "Message bus connection disposed");
    }
}
