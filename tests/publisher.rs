mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use common::{fast_retry, test_config, FakeBroker};
use rabbit_bus::contracts::{OrderCreatedEvent, PaymentProcessedEvent};
use rabbit_bus::rabbitmq::{
    shutdown, ConnectionManager, MessageBusError, MessageBusPublisher, PublishSettings,
    RabbitBusPublisher, RetryPolicy, RouteTable,
};
use serde_json::Value;
use uuid::Uuid;

fn order() -> OrderCreatedEvent {
    OrderCreatedEvent {
        order_id: Uuid::parse_str("6f1c2a4e-8a7b-4c1d-9e2f-3a4b5c6d7e8f").unwrap(),
        customer_name: "Ada Lovelace".to_string(),
        amount: 120.5,
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
}

fn publisher(broker: &FakeBroker, retry_policy: Option<RetryPolicy>) -> RabbitBusPublisher {
    let mut routes = RouteTable::new();
    routes
        .register::<OrderCreatedEvent>("order.exchange", "order.created")
        .unwrap();
    let settings = PublishSettings {
        routes,
        retry_policy,
        ..PublishSettings::default()
    };
    let connection = ConnectionManager::with_transport(test_config(), broker.transport());
    RabbitBusPublisher::new(Arc::new(settings), Arc::new(connection))
}

#[tokio::test]
async fn publishes_persistent_camel_case_json_to_route() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker, Some(fast_retry(Some(5))));
    let (_trigger, signal) = shutdown::channel();

    publisher.publish(&order(), &signal).await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.exchange, "order.exchange");
    assert_eq!(message.routing_key, "order.created");
    assert!(message.properties.persistent);
    assert_eq!(message.properties.content_type, "application/json");

    let body: Value = serde_json::from_slice(&message.body).unwrap();
    assert_eq!(body["orderId"], "6f1c2a4e-8a7b-4c1d-9e2f-3a4b5c6d7e8f");
    assert_eq!(body["customerName"], "Ada Lovelace");
    assert_eq!(body["amount"], 120.5);
}

#[tokio::test]
async fn publish_channel_is_closed_afterwards() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker, None);
    let (_trigger, signal) = shutdown::channel();

    publisher.publish(&order(), &signal).await.unwrap();
    publisher.publish(&order(), &signal).await.unwrap();

    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn unregistered_type_fails_without_touching_broker() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker, Some(fast_retry(Some(5))));
    let (_trigger, signal) = shutdown::channel();

    let event = PaymentProcessedEvent {
        order_id: Uuid::nil(),
        status: rabbit_bus::contracts::PaymentStatus::Processed,
    };
    let result = publisher.publish(&event, &signal).await;

    assert!(matches!(
        result,
        Err(MessageBusError::RouteNotRegistered { .. })
    ));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn bounded_retry_gives_up_quietly() {
    let broker = FakeBroker::new();
    broker.set_reachable(false);
    let publisher = publisher(&broker, Some(fast_retry(Some(2))));
    let (_trigger, signal) = shutdown::channel();

    let result = publisher.publish(&order(), &signal).await;

    assert!(result.is_ok());
    assert_eq!(broker.connect_attempts(), 3);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn without_policy_a_single_attempt_is_made() {
    let broker = FakeBroker::new();
    broker.set_reachable(false);
    let publisher = publisher(&broker, None);
    let (_trigger, signal) = shutdown::channel();

    assert!(publisher.publish(&order(), &signal).await.is_ok());
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn retry_recovers_once_broker_returns() {
    let broker = FakeBroker::new();
    broker.set_reachable(false);
    let publisher = Arc::new(publisher(
        &broker,
        Some(RetryPolicy::bounded(
            10,
            rabbit_bus::rabbitmq::Backoff::Custom(Arc::new(|_| std::time::Duration::from_millis(20))),
        )),
    ));
    let (_trigger, signal) = shutdown::channel();

    let task = {
        let publisher = Arc::clone(&publisher);
        let signal = signal.clone();
        tokio::spawn(async move { publisher.publish(&order(), &signal).await })
    };
    assert!(common::wait_until(|| broker.connect_attempts() >= 2).await);
    broker.set_reachable(true);

    task.await.unwrap().unwrap();
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn shutdown_interrupts_retry_loop() {
    let broker = FakeBroker::new();
    broker.set_reachable(false);
    let publisher = publisher(&broker, Some(RetryPolicy::default_unbounded()));
    let (trigger, signal) = shutdown::channel();

    let message = order();
    let publish = publisher.publish(&message, &signal);
    trigger.trigger();

    assert!(common::with_timeout(publish).await.is_ok());
    assert!(broker.published().is_empty());
}
