use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::connection::ConnectionManager;
use super::errors::{MessageBusError, Result};
use super::retry::RetryPolicy;
use super::routes::{BusMessage, PublishRoute, RouteTable};
use super::shutdown::Shutdown;
use super::transport::MessageProperties;

/// Publish routes, outbound properties and the optional retry policy shared
/// by every message type the publisher serves.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub routes: RouteTable,
    pub retry_policy: Option<RetryPolicy>,
    pub properties: MessageProperties,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            routes: RouteTable::new(),
            retry_policy: None,
            properties: MessageProperties::persistent_json(),
        }
    }
}

#[async_trait]
pub trait MessageBusPublisher: Send + Sync {
    /// Publishes `message` to the route registered for `T`.
    ///
    /// Only caller bugs are returned: a missing route or a message that does
    /// not serialize. Broker failures are retried per the configured policy,
    /// then logged and swallowed.
    async fn publish<T: BusMessage>(&self, message: &T, shutdown: &Shutdown) -> Result<()>;
}

pub struct RabbitBusPublisher {
    settings: Arc<PublishSettings>,
    connection: Arc<ConnectionManager>,
}

impl RabbitBusPublisher {
    pub fn new(settings: Arc<PublishSettings>, connection: Arc<ConnectionManager>) -> Self {
        Self {
            settings,
            connection,
        }
    }

    async fn create_channel_and_publish(
        &self,
        route: &PublishRoute,
        body: &[u8],
        shutdown: &Shutdown,
    ) -> Result<()> {
        let channel = self.connection.acquire_channel(shutdown).await?;

        let published = shutdown
            .run_until(channel.basic_publish(
                &route.exchange,
                &route.routing_key,
                body,
                &self.settings.properties,
            ))
            .await;

        if let Err(e) = channel.close().await {
            debug!("Failed to close publish channel: {}", e);
        }
        published
    }
}

#[async_trait]
impl MessageBusPublisher for RabbitBusPublisher {
    async fn publish<T: BusMessage>(&self, message: &T, shutdown: &Shutdown) -> Result<()> {
        let route = self.settings.routes.resolve::<T>().map_err(|e| {
            error!("{}", e);
            e
        })?;
        let body = serde_json::to_vec(message).map_err(MessageBusError::Serialization)?;

        let body_ref = body.as_slice();
        let outcome = match &self.settings.retry_policy {
            Some(policy) => {
                policy
                    .execute(
                        shutdown,
                        |e, retry, delay| {
                            error!(
                                exchange = %route.exchange,
                                routing_key = %route.routing_key,
                                attempt = retry,
                                delay_ms = delay.as_millis() as u64,
                                "Connection failed. {} attempt to publish the message. Error: {}",
                                retry,
                                e
                            )
                        },
                        move || self.create_channel_and_publish(route, body_ref, shutdown),
                    )
                    .await
            }
            None => {
                self.create_channel_and_publish(route, body_ref, shutdown)
                    .await
            }
        };

        match outcome {
            Ok(()) => info!(
                exchange = %route.exchange,
                routing_key = %route.routing_key,
                "Published {}",
                route.message_type
            ),
            Err(e) => error!(
                exchange = %route.exchange,
                routing_key = %route.routing_key,
                "Couldn't publish message ({}). Error: {}",
                String::from_utf8_lossy(&body),
                e
            ),
        }
        Ok(())
    }
}
