// Payment worker: consumes order.created, publishes payment.processed.
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rabbit_bus::config::{
    find_config_file, load_config, load_or_create_config, BusConfig, CONFIG_FILE_NAME,
};
use rabbit_bus::contracts::{OrderCreatedEvent, PaymentProcessedEvent, PaymentStatus};
use rabbit_bus::env::load_from_env;
use rabbit_bus::rabbitmq::{
    shutdown, MessageBusBuilder, MessageBusPublisher, MessageHandler, RabbitBusPublisher, Shutdown,
};

const ORDER_CREATED_QUEUE: &str = "order.created";

struct OrderCreatedHandler {
    publisher: Arc<OnceLock<Arc<RabbitBusPublisher>>>,
}

#[async_trait]
impl MessageHandler for OrderCreatedHandler {
    type Message = OrderCreatedEvent;

    fn queue_name(&self) -> &str {
        ORDER_CREATED_QUEUE
    }

    async fn handle(&self, order: &OrderCreatedEvent, shutdown: &Shutdown) -> Result<()> {
        let publisher = self
            .publisher
            .get()
            .ok_or_else(|| anyhow!("publisher is not ready yet"))?;

        info!(order_id = %order.order_id, amount = order.amount, "Processing payment");
        let status = if rand::rng().random_bool(0.6) {
            PaymentStatus::Processed
        } else {
            PaymentStatus::Failed
        };

        publisher
            .publish(
                &PaymentProcessedEvent {
                    order_id: order.order_id,
                    status,
                },
                shutdown,
            )
            .await?;
        info!(order_id = %order.order_id, ?status, "Payment processed");
        Ok(())
    }

    async fn on_failure(
        &self,
        order: &OrderCreatedEvent,
        error: &anyhow::Error,
        _shutdown: &Shutdown,
    ) -> Result<bool> {
        error!(order_id = %order.order_id, "Failed to process order: {:#}", error);
        Ok(false)
    }
}

fn load_bus_config() -> Result<BusConfig> {
    if let Ok(path) = find_config_file() {
        info!("Loading configuration from {}", path.display());
        return load_config(&path);
    }
    match load_from_env() {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!("Environment configuration incomplete: {:#}", e);
            load_or_create_config(Path::new(CONFIG_FILE_NAME))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_bus_config()?;
    let (trigger, signal) = shutdown::channel();

    let publisher_slot = Arc::new(OnceLock::new());
    let bus = MessageBusBuilder::from_config(&config)
        .add_publisher::<OrderCreatedEvent>("order.exchange", "order.created")
        .add_publisher::<PaymentProcessedEvent>("payment.exchange", "payment.processed")
        .add_consumer(OrderCreatedHandler {
            publisher: Arc::clone(&publisher_slot),
        })
        .build(&signal)?;

    let publisher = bus
        .publisher()
        .ok_or_else(|| anyhow!("publisher routes were not registered"))?;
    let _ = publisher_slot.set(Arc::clone(&publisher));

    let sample = OrderCreatedEvent {
        order_id: Uuid::new_v4(),
        customer_name: "Sample Customer".to_string(),
        amount: 99.95,
        created_at: Utc::now(),
    };
    publisher.publish(&sample, &signal).await?;

    info!("Payment worker running, press Ctrl+C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down");
        }
        queue = bus.first_stopped() => {
            error!(queue = %queue, "Consumer stopped on its own, shutting down");
        }
    }

    trigger.trigger();
    bus.shutdown().await?;
    Ok(())
}
