// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum MessageBusError {
    #[error("RabbitMQ broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("RabbitMQ socket error: {0}")]
    Socket(String),

    #[error("RabbitMQ channel or connection already closed: {0}")]
    AlreadyClosed(String),

    #[error("RabbitMQ operation interrupted: {0}")]
    OperationInterrupted(String),

    #[error("Publisher is not registered for message type {message_type}")]
    RouteNotRegistered { message_type: &'static str },

    #[error("Publisher is already registered for message type {message_type}")]
    DuplicateRoute { message_type: &'static str },

    #[error("Queue with name {queue} probably does not exist: {reason}")]
    QueueNotFound { queue: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message bus connection was already disposed")]
    Disposed,

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Delivery {delivery_tag} belongs to a channel that was replaced")]
    StaleDelivery { delivery_tag: u64 },

    #[error("Message serialization error: {0}")]
    Serialization(#[source] SerdeError),

    #[error("Message deserialization error: {0}")]
    Deserialization(#[source] SerdeError),

    #[error("RabbitMQ error: {0}")]
    Broker(String),
}

// Custom Result type for message bus operations
pub type Result<T> = std::result::Result<T, MessageBusError>;

impl MessageBusError {
    /// Connection-class failures. Retry policies only ever retry these.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessageBusError::BrokerUnreachable(_)
                | MessageBusError::Socket(_)
                | MessageBusError::AlreadyClosed(_)
                | MessageBusError::OperationInterrupted(_)
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MessageBusError::RouteNotRegistered { .. }
                | MessageBusError::DuplicateRoute { .. }
                | MessageBusError::QueueNotFound { .. }
                | MessageBusError::Config(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for MessageBusError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::IOError(io) => MessageBusError::Socket(io.to_string()),
            LapinError::InvalidChannelState(_) | LapinError::InvalidConnectionState(_) => {
                MessageBusError::AlreadyClosed(error.to_string())
            }
            // The broker closed the channel or connection with a reply code
            LapinError::ProtocolError(_) => MessageBusError::OperationInterrupted(error.to_string()),
            _ => MessageBusError::Broker(error.to_string()),
        }
    }
}

impl From<Elapsed> for MessageBusError {
    fn from(_: Elapsed) -> Self {
        MessageBusError::BrokerUnreachable("Connection timed out".to_string())
    }
}
