use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::connection::ConnectionManager;
use super::consumer::{ConsumerOptions, ConsumerState, MessageBusConsumer, MessageHandler};
use super::errors::{MessageBusError, Result};
use super::publisher::{PublishSettings, RabbitBusPublisher};
use super::retry::RetryPolicy;
use super::routes::{BusMessage, RouteTable};
use super::shutdown::Shutdown;
use super::transport::BrokerTransport;
use crate::config::{BusConfig, ConnectionConfig};

type SpawnConsumer =
    Box<dyn FnOnce(Arc<ConnectionManager>, ConsumerOptions, Shutdown) -> ConsumerHandle + Send>;

/// A running consumer loop.
pub struct ConsumerHandle {
    queue: String,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }
}

/// Collects publish routes and consumers, then wires them to one shared
/// connection in [`MessageBusBuilder::build`].
///
/// ```no_run
/// # use rabbit_bus::config::ConnectionConfig;
/// # use rabbit_bus::rabbitmq::{shutdown, MessageBusBuilder};
/// # #[derive(serde::Serialize, serde::Deserialize)] struct OrderCreated;
/// # async fn demo() -> rabbit_bus::rabbitmq::Result<()> {
/// let (trigger, signal) = shutdown::channel();
/// let bus = MessageBusBuilder::new(ConnectionConfig::new("orders", "localhost", "guest", "guest"))
///     .add_publisher::<OrderCreated>("order.exchange", "order.created")
///     .use_default_publisher_retry_policy()
///     .build(&signal)?;
/// trigger.trigger();
/// bus.shutdown().await
/// # }
/// ```
pub struct MessageBusBuilder {
    config: ConnectionConfig,
    transport: Option<Arc<dyn BrokerTransport>>,
    routes: RouteTable,
    publisher_retry_policy: Option<RetryPolicy>,
    consumer_options: ConsumerOptions,
    consumers: Vec<SpawnConsumer>,
    error: Option<MessageBusError>,
}

impl MessageBusBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            transport: None,
            routes: RouteTable::new(),
            publisher_retry_policy: None,
            consumer_options: ConsumerOptions::default(),
            consumers: Vec::new(),
            error: None,
        }
    }

    /// Starts from a loaded configuration file, taking consumer timings and
    /// the publisher retry policy from it.
    pub fn from_config(config: &BusConfig) -> Self {
        let mut builder = Self::new(config.connection.clone());
        builder.consumer_options = ConsumerOptions::from(&config.consumer);
        builder.publisher_retry_policy = config.publisher.retry_policy();
        builder
    }

    /// Replaces the lapin transport, mostly for tests.
    pub fn with_transport(mut self, transport: Arc<dyn BrokerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn add_publisher<T: BusMessage>(mut self, exchange: &str, routing_key: &str) -> Self {
        if let Err(e) = self.routes.register::<T>(exchange, routing_key) {
            // First error wins, build() reports it
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn add_consumer<H: MessageHandler>(mut self, handler: H) -> Self {
        self.consumers.push(Box::new(move |connection, options, shutdown| {
            let consumer = MessageBusConsumer::new(handler, connection, options);
            let queue = consumer.queue_name().to_string();
            let state = consumer.state();
            let task = consumer.spawn(shutdown);
            ConsumerHandle { queue, state, task }
        }));
        self
    }

    pub fn use_publisher_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.publisher_retry_policy = Some(policy);
        self
    }

    pub fn use_default_publisher_retry_policy(self) -> Self {
        self.use_publisher_retry_policy(RetryPolicy::default_publish())
    }

    pub fn without_publisher_retry_policy(mut self) -> Self {
        self.publisher_retry_policy = None;
        self
    }

    pub fn with_consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.consumer_options = options;
        self
    }

    /// Creates the shared connection manager, the publisher (when any route
    /// was added) and spawns one supervised loop per consumer.
    ///
    /// Must be called from inside a tokio runtime. Nothing connects until
    /// the first publish or the first consumer attempt.
    pub fn build(self, shutdown: &Shutdown) -> Result<MessageBus> {
        if let Some(e) = self.error {
            error!("Message bus configuration rejected: {}", e);
            return Err(e);
        }
        self.config
            .validate()
            .map_err(|e| MessageBusError::Config(format!("{:#}", e)))?;

        let connection = Arc::new(match self.transport {
            Some(transport) => ConnectionManager::with_transport(self.config, transport),
            None => ConnectionManager::new(self.config),
        });

        let publisher = if self.routes.is_empty() {
            None
        } else {
            let settings = PublishSettings {
                routes: self.routes,
                retry_policy: self.publisher_retry_policy,
                ..PublishSettings::default()
            };
            Some(Arc::new(RabbitBusPublisher::new(
                Arc::new(settings),
                Arc::clone(&connection),
            )))
        };

        let consumers: Vec<ConsumerHandle> = self
            .consumers
            .into_iter()
            .map(|spawn| {
                spawn(
                    Arc::clone(&connection),
                    self.consumer_options.clone(),
                    shutdown.clone(),
                )
            })
            .collect();

        info!(
            client = %connection.config().client_name,
            publisher = publisher.is_some(),
            consumers = consumers.len(),
            "Message bus built"
        );

        Ok(MessageBus {
            connection,
            publisher,
            consumers,
        })
    }
}

pub struct MessageBus {
    connection: Arc<ConnectionManager>,
    publisher: Option<Arc<RabbitBusPublisher>>,
    consumers: Vec<ConsumerHandle>,
}

impl MessageBus {
    /// `None` when no publish route was registered.
    pub fn publisher(&self) -> Option<Arc<RabbitBusPublisher>> {
        self.publisher.clone()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn consumers(&self) -> &[ConsumerHandle] {
        &self.consumers
    }

    pub fn consumer_state(&self, queue: &str) -> Option<watch::Receiver<ConsumerState>> {
        self.consumers
            .iter()
            .find(|handle| handle.queue == queue)
            .map(ConsumerHandle::state)
    }

    /// Resolves with the queue of the first consumer loop that stopped.
    /// Pends forever when the bus has no consumers.
    pub async fn first_stopped(&self) -> String {
        let waits: Vec<_> = self
            .consumers
            .iter()
            .map(|handle| {
                let mut state = handle.state();
                let queue = handle.queue.clone();
                Box::pin(async move {
                    // A dropped sender means the loop is gone too
                    let _ = state.wait_for(|s| *s == ConsumerState::Stopped).await;
                    queue
                })
            })
            .collect();

        if waits.is_empty() {
            return std::future::pending().await;
        }
        futures::future::select_all(waits).await.0
    }

    /// Waits for every consumer loop to stop, then disposes the connection.
    ///
    /// Loops only stop on their own for fatal configuration errors, so this
    /// is meant to be called after the shutdown trigger fired. Returns the
    /// first error a loop ended with.
    pub async fn shutdown(self) -> Result<()> {
        let mut first_error = None;

        for handle in self.consumers {
            let outcome = match handle.task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(MessageBusError::Broker(format!(
                    "consumer task for {} failed: {}",
                    handle.queue, e
                ))),
            };
            if let Err(e) = outcome {
                warn!(queue = %handle.queue, "Consumer ended with error: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.connection.dispose().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
