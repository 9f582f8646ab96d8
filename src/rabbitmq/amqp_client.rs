// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
};
use tracing::{debug, info};

use super::errors::{MessageBusError, Result};
use super::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, DeliveryStream, Envelope, MessageProperties,
};
use crate::config::ConnectionConfig;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Opens real AMQP 0-9-1 connections through lapin.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpTransport;

fn amqp_uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: if config.tls.is_some() {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.user.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(config.heartbeat_seconds),
            connection_timeout: Some(config.connection_timeout_ms),
            ..AMQPQueryString::default()
        },
    }
}

// A failed connect means the broker could not be reached at all
fn connect_error(error: LapinError) -> MessageBusError {
    match error {
        LapinError::IOError(io) => MessageBusError::BrokerUnreachable(io.to_string()),
        other => other.into(),
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BrokerConnection>> {
        let uri = amqp_uri(config);
        let properties =
            ConnectionProperties::default().with_connection_name(config.client_name.clone().into());

        info!(
            client = %config.client_name,
            host = %config.host,
            port = config.port,
            vhost = %config.virtual_host,
            tls = config.tls.is_some(),
            "Connecting to RabbitMQ"
        );

        let ca_chain = match config.tls.as_ref().and_then(|tls| tls.ca_cert_path.as_ref()) {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                MessageBusError::Config(format!(
                    "Failed to read CA bundle at {}: {}",
                    path.display(),
                    e
                ))
            })?),
            None => None,
        };

        let connect = async {
            match ca_chain {
                Some(cert_chain) => {
                    let tls = OwnedTLSConfig {
                        identity: None,
                        cert_chain: Some(cert_chain),
                    };
                    Connection::connect_uri_with_config(uri, properties, tls).await
                }
                None => Connection::connect_uri(uri, properties).await,
            }
        };

        let connection = tokio::time::timeout(config.connect_timeout(), connect)
            .await?
            .map_err(connect_error)?;

        info!(client = %config.client_name, "Successfully connected to RabbitMQ");
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Channel created");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let delivery_mode = if properties.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };
        let props = BasicProperties::default()
            .with_content_type(properties.content_type.clone().into())
            .with_delivery_mode(delivery_mode);

        // Confirm mode is never enabled on these channels, the returned
        // confirmation is dropped unawaited
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                props,
            )
            .await?;
        Ok(())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<u32> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };

        match self
            .channel
            .queue_declare(queue, options, FieldTable::default())
            .await
        {
            Ok(declared) => Ok(declared.message_count()),
            Err(error @ LapinError::ProtocolError(_)) => Err(MessageBusError::QueueNotFound {
                queue: queue.to_string(),
                reason: error.to_string(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|delivery| Envelope {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                })
                .map_err(MessageBusError::from)
        });
        Ok(Box::pin(deliveries))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(REPLY_SUCCESS, "Closing channel").await?;
        Ok(())
    }
}
