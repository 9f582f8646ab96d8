//! Broker seam.
//!
//! The connection manager, publisher and consumers only talk to the broker
//! through these traits. [`super::amqp_client::AmqpTransport`] binds them to
//! lapin.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use super::errors::Result;
use crate::config::ConnectionConfig;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Only valid on the channel the message arrived on
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub persistent: bool,
}

impl MessageProperties {
    pub fn persistent_json() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            persistent: true,
        }
    }
}

/// Deliveries of one `basic.consume`. Ends when the channel goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Envelope>> + Send>>;

#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Fire-and-forget, no publisher confirm is awaited.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    /// Returns the number of ready messages, or
    /// [`super::errors::MessageBusError::QueueNotFound`] if the queue is missing.
    async fn queue_declare_passive(&self, queue: &str) -> Result<u32>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
