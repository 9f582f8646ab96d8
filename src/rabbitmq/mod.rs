// src/rabbitmq/mod.rs
// Resilient publish/consume on top of a single RabbitMQ connection

pub mod errors;
pub mod shutdown;
pub mod retry;
pub mod routes;
pub mod transport;
pub mod connection;
pub mod publisher;
pub mod consumer;
pub mod builder;

// lapin binding of the transport traits
pub mod amqp_client;

pub use builder::{ConsumerHandle, MessageBus, MessageBusBuilder};
pub use connection::ConnectionManager;
pub use consumer::{ConsumerOptions, ConsumerState, Disposition, MessageBusConsumer, MessageHandler};
pub use errors::{MessageBusError, Result};
pub use publisher::{MessageBusPublisher, PublishSettings, RabbitBusPublisher};
pub use retry::{Backoff, RetryKind, RetryPolicy};
pub use routes::{BusMessage, PublishRoute, RouteTable};
pub use shutdown::{Shutdown, ShutdownTrigger};
