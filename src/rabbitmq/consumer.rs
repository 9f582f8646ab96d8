//! Supervised queue consumers.
//!
//! One [`MessageBusConsumer`] runs per [`MessageHandler`]. It owns its own
//! channel, keeps a subscription to the handler's queue alive across
//! reconnects, and settles every delivery with an ack or a nack-with-requeue:
//!
//! | outcome                                   | settlement    |
//! |-------------------------------------------|---------------|
//! | body does not deserialize                 | ack           |
//! | handler succeeds                          | ack           |
//! | handler fails, `on_failure` returns true  | ack           |
//! | handler fails, `on_failure` false / fails | nack, requeue |

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{MessageBusError, Result};
use super::retry::RetryPolicy;
use super::routes::BusMessage;
use super::shutdown::Shutdown;
use super::transport::{BrokerChannel, DeliveryStream, Envelope};
use crate::config::ConsumerConfig;

/// Business side of a consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: BusMessage + fmt::Debug;

    fn queue_name(&self) -> &str;

    async fn handle(&self, message: &Self::Message, shutdown: &Shutdown) -> anyhow::Result<()>;

    /// Called after `handle` failed. `Ok(true)` declares the message handled
    /// and acknowledges it; `Ok(false)` or an error requeues it.
    async fn on_failure(
        &self,
        message: &Self::Message,
        error: &anyhow::Error,
        shutdown: &Shutdown,
    ) -> anyhow::Result<bool> {
        let _ = (message, error, shutdown);
        Ok(false)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Grace period before the first connection attempt
    pub startup_delay: Duration,
    pub connection_check_period: Duration,
    /// 0 leaves the broker default in place
    pub prefetch_count: u16,
    /// Used for reconnects and for every ack/nack
    pub retry_policy: RetryPolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        (&ConsumerConfig::default()).into()
    }
}

impl From<&ConsumerConfig> for ConsumerOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            startup_delay: Duration::from_millis(config.startup_delay_ms),
            connection_check_period: Duration::from_millis(config.connection_check_period_ms),
            prefetch_count: config.prefetch_count,
            retry_policy: RetryPolicy::default_unbounded(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Consuming,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    NackRequeue,
}

/// Decides how a delivered body is settled, running the handler on the way.
pub async fn process_delivery<H: MessageHandler>(
    handler: &H,
    envelope: &Envelope,
    shutdown: &Shutdown,
) -> Disposition {
    let message = match serde_json::from_slice::<H::Message>(&envelope.body) {
        Ok(message) => message,
        Err(e) => {
            // Bad payloads can never be processed, drop them from the queue
            error!(
                queue = handler.queue_name(),
                delivery_tag = envelope.delivery_tag,
                body = %String::from_utf8_lossy(&envelope.body),
                "{}",
                MessageBusError::Deserialization(e)
            );
            return Disposition::Ack;
        }
    };

    info!(
        queue = handler.queue_name(),
        delivery_tag = envelope.delivery_tag,
        redelivered = envelope.redelivered,
        "Got message: {:?}",
        message
    );

    let handled = AssertUnwindSafe(handler.handle(&message, shutdown))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("handler panicked: {}", panic_text(panic.as_ref())))
        });

    let error = match handled {
        Ok(()) => return Disposition::Ack,
        Err(error) => error,
    };
    error!(
        queue = handler.queue_name(),
        delivery_tag = envelope.delivery_tag,
        "Couldn't handle the message: {:#}",
        error
    );

    let verdict = AssertUnwindSafe(handler.on_failure(&message, &error, shutdown))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("failure handler panicked: {}", panic_text(panic.as_ref())))
        });

    match verdict {
        Ok(true) => Disposition::Ack,
        Ok(false) => Disposition::NackRequeue,
        Err(e) => {
            error!(
                queue = handler.queue_name(),
                delivery_tag = envelope.delivery_tag,
                "Couldn't successfully handle the error when processing the message: {:#}",
                e
            );
            Disposition::NackRequeue
        }
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Settles deliveries of one channel.
struct Acknowledger {
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    retry_policy: RetryPolicy,
}

impl Acknowledger {
    async fn attempt(&self, delivery_tag: u64, disposition: Disposition) -> Result<()> {
        // Tags are channel-scoped, a replaced channel cannot settle them
        if self.current_generation.load(Ordering::Acquire) != self.generation {
            return Err(MessageBusError::StaleDelivery { delivery_tag });
        }
        match disposition {
            Disposition::Ack => self.channel.basic_ack(delivery_tag).await,
            Disposition::NackRequeue => self.channel.basic_nack(delivery_tag, true).await,
        }
    }

    async fn settle(&self, delivery_tag: u64, disposition: Disposition, shutdown: &Shutdown) {
        let verb = match disposition {
            Disposition::Ack => "acknowledge",
            Disposition::NackRequeue => "negatively acknowledge",
        };

        // The first attempt ignores shutdown so finished work is not redelivered
        let result = match self.attempt(delivery_tag, disposition).await {
            Err(first) if first.is_transient() => {
                debug!(queue = %self.queue, delivery_tag, "Failed to {} the message: {}", verb, first);
                self.retry_policy
                    .execute(
                        shutdown,
                        |e, retry, delay| {
                            error!(
                                queue = %self.queue,
                                delivery_tag,
                                "Connection failed. {} attempt to {} the message in {} milliseconds: {}",
                                retry,
                                verb,
                                delay.as_millis(),
                                e
                            )
                        },
                        move || self.attempt(delivery_tag, disposition),
                    )
                    .await
            }
            other => other,
        };

        match result {
            Ok(()) => match disposition {
                Disposition::Ack => info!(queue = %self.queue, delivery_tag, "Message acknowledged successfully."),
                Disposition::NackRequeue => warn!(
                    queue = %self.queue,
                    delivery_tag,
                    "Message negatively acknowledged for reprocessing."
                ),
            },
            Err(MessageBusError::StaleDelivery { .. }) => warn!(
                queue = %self.queue,
                delivery_tag,
                "Channel was replaced before the message could be settled, the broker will redeliver it"
            ),
            Err(e) => error!(queue = %self.queue, delivery_tag, "Couldn't {} message: {}", verb, e),
        }
    }
}

async fn pump_deliveries<H: MessageHandler>(
    handler: Arc<H>,
    mut deliveries: DeliveryStream,
    acknowledger: Acknowledger,
    shutdown: Shutdown,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(envelope)) => {
                let disposition = process_delivery(handler.as_ref(), &envelope, &shutdown).await;
                acknowledger
                    .settle(envelope.delivery_tag, disposition, &shutdown)
                    .await;
            }
            Some(Err(e)) => {
                error!(queue = %acknowledger.queue, "Error receiving message: {}", e);
                if !acknowledger.channel.is_open() {
                    break;
                }
            }
            None => break,
        }
    }
    debug!(queue = %acknowledger.queue, generation = acknowledger.generation, "Delivery loop finished");
}

struct Session {
    channel: Arc<dyn BrokerChannel>,
    pump: JoinHandle<()>,
}

/// Supervisory loop for one handler.
pub struct MessageBusConsumer<H: MessageHandler> {
    handler: Arc<H>,
    connection: Arc<ConnectionManager>,
    options: ConsumerOptions,
    session: Option<Session>,
    generation: Arc<AtomicU64>,
    state: watch::Sender<ConsumerState>,
}

impl<H: MessageHandler> MessageBusConsumer<H> {
    pub fn new(handler: H, connection: Arc<ConnectionManager>, options: ConsumerOptions) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            handler: Arc::new(handler),
            connection,
            options,
            session: None,
            generation: Arc::new(AtomicU64::new(0)),
            state,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.handler.queue_name()
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` fires. Returns an error only for configuration
    /// problems, such as a missing queue, that retrying cannot fix.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<()> {
        info!(queue = self.queue_name(), "Consumer starting");

        let outcome = self.supervise(&shutdown).await;

        self.state.send_replace(ConsumerState::Stopped);
        if let Some(session) = self.session.take() {
            if let Err(e) = session.pump.await {
                warn!(queue = self.queue_name(), "Delivery loop ended abnormally: {}", e);
            }
            if session.channel.is_open() {
                if let Err(e) = session.channel.close().await {
                    debug!("Failed to close consumer channel: {}", e);
                }
            }
        }
        info!(queue = self.queue_name(), "Consumer stopped");
        outcome
    }

    async fn supervise(&mut self, shutdown: &Shutdown) -> Result<()> {
        if shutdown.sleep(self.options.startup_delay).await.is_err() {
            return Ok(());
        }

        while !shutdown.is_cancelled() {
            match self.ensure_consuming(shutdown).await {
                Ok(()) => {}
                Err(MessageBusError::Cancelled) => return Ok(()),
                Err(MessageBusError::Disposed) => {
                    warn!(queue = self.queue_name(), "Connection disposed, consumer stops");
                    return Ok(());
                }
                Err(e) if e.is_configuration() => {
                    error!(queue = self.queue_name(), "Consumer cannot start: {}", e);
                    return Err(e);
                }
                Err(e) => error!(queue = self.queue_name(), "Consumer connection attempt failed: {}", e),
            }

            if shutdown.sleep(self.options.connection_check_period).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn ensure_consuming(&mut self, shutdown: &Shutdown) -> Result<()> {
        if let Some(session) = &self.session {
            if session.channel.is_open() {
                return Ok(());
            }
            warn!(queue = self.queue_name(), "Consumer channel is closed, reconnecting");
        }
        // The old pump ends on its own once its stream is exhausted. Moving
        // the generation on makes its pending settlements stale right away.
        if self.session.take().is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.state.send_replace(ConsumerState::Connecting);

        let this = &*self;
        let queue = this.queue_name();
        let session = this
            .options
            .retry_policy
            .execute(
                shutdown,
                |e, retry, delay| {
                    error!(
                        queue,
                        attempt = retry,
                        "Connection failed. {} attempt to reconnect from the consumer in {} milliseconds: {}",
                        retry,
                        delay.as_millis(),
                        e
                    )
                },
                move || this.open_session(shutdown),
            )
            .await?;

        info!(queue = self.queue_name(), "Message bus connection is established");
        self.session = Some(session);
        self.state.send_replace(ConsumerState::Consuming);
        Ok(())
    }

    async fn open_session(&self, shutdown: &Shutdown) -> Result<Session> {
        let channel = self.connection.acquire_channel(shutdown).await?;

        let deliveries = match self.subscribe(channel.as_ref(), shutdown).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    debug!("Failed to close abandoned channel: {}", close_error);
                }
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let acknowledger = Acknowledger {
            queue: self.queue_name().to_string(),
            channel: Arc::clone(&channel),
            generation,
            current_generation: Arc::clone(&self.generation),
            retry_policy: self.options.retry_policy.clone(),
        };
        let pump = tokio::spawn(pump_deliveries(
            Arc::clone(&self.handler),
            deliveries,
            acknowledger,
            shutdown.clone(),
        ));

        Ok(Session { channel, pump })
    }

    async fn subscribe(&self, channel: &dyn BrokerChannel, shutdown: &Shutdown) -> Result<DeliveryStream> {
        let queue = self.queue_name();

        if self.options.prefetch_count > 0 {
            shutdown
                .run_until(channel.basic_qos(self.options.prefetch_count))
                .await?;
        }

        let ready = shutdown.run_until(channel.queue_declare_passive(queue)).await?;
        debug!(queue, ready, "Queue exists");

        let consumer_tag = format!(
            "{}.{}.{}",
            self.connection.config().client_name,
            queue,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let deliveries = shutdown
            .run_until(channel.basic_consume(queue, &consumer_tag))
            .await?;
        info!(queue, consumer_tag = %consumer_tag, "Started consuming");
        Ok(deliveries)
    }
}
