// In-memory broker shared by the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};

use rabbit_bus::config::ConnectionConfig;
use rabbit_bus::rabbitmq::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, DeliveryStream, Envelope, MessageProperties,
};
use rabbit_bus::rabbitmq::{Backoff, ConsumerOptions, MessageBusError, Result, RetryPolicy};

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub channel_id: u64,
    pub delivery_tag: u64,
}

struct Subscription {
    channel_id: u64,
    consumer_tag: String,
    sender: UnboundedSender<Result<Envelope>>,
    next_tag: u64,
    unacked: HashMap<u64, Vec<u8>>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<(Vec<u8>, bool)>,
    subscription: Option<Subscription>,
}

impl Queue {
    fn dispatch(&mut self, name: &str) {
        let Some(subscription) = self.subscription.as_mut() else {
            return;
        };
        while let Some((body, redelivered)) = self.pending.pop_front() {
            subscription.next_tag += 1;
            let envelope = Envelope {
                delivery_tag: subscription.next_tag,
                body: body.clone(),
                redelivered,
                routing_key: name.to_string(),
            };
            subscription.unacked.insert(subscription.next_tag, body);
            if subscription.sender.unbounded_send(Ok(envelope)).is_err() {
                break;
            }
        }
    }
}

#[derive(Default)]
struct State {
    reachable: bool,
    queues: HashMap<String, Queue>,
    connections: Vec<Arc<AtomicBool>>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    next_channel_id: u64,
    connect_attempts: usize,
    connects: usize,
    channels_opened: usize,
    failing_settlements: usize,
    settle_attempts: usize,
    published: Vec<Published>,
    acks: Vec<Settled>,
    nacks: Vec<Settled>,
    consumer_tags: Vec<String>,
}

impl State {
    // A broker requeues whatever a closed channel left unacknowledged
    fn release_channel(&mut self, channel_id: u64) {
        for queue in self.queues.values_mut() {
            let owned = matches!(&queue.subscription, Some(s) if s.channel_id == channel_id);
            if !owned {
                continue;
            }
            if let Some(subscription) = queue.subscription.take() {
                let mut unacked: Vec<_> = subscription.unacked.into_iter().collect();
                unacked.sort_by_key(|(tag, _)| *tag);
                for (_, body) in unacked.into_iter().rev() {
                    queue.pending.push_front((body, true));
                }
            }
        }
    }
}

/// Cloneable handle to the in-memory broker.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.lock().reachable = true;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        Arc::new(self.clone())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn declare_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    pub fn deliver(&self, queue: &str, body: &[u8]) {
        let mut state = self.lock();
        let queue_state = state.queues.entry(queue.to_string()).or_default();
        queue_state.pending.push_back((body.to_vec(), false));
        queue_state.dispatch(queue);
    }

    /// Severs every connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        for connection in &state.connections {
            connection.store(false, Ordering::SeqCst);
        }
        let channel_ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in channel_ids {
            if let Some(open) = state.channels.get(&id) {
                open.store(false, Ordering::SeqCst);
            }
            state.release_channel(id);
        }
    }

    pub fn delete_queue(&self, name: &str) {
        self.lock().queues.remove(name);
    }

    /// Every ack or nack call that reached a channel, failed ones included.
    pub fn settle_attempts(&self) -> usize {
        self.lock().settle_attempts
    }

    /// The next `count` acks or nacks fail with a socket error.
    pub fn fail_settlements(&self, count: usize) {
        self.lock().failing_settlements = count;
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub fn acks(&self) -> Vec<Settled> {
        self.lock().acks.clone()
    }

    pub fn nacks(&self) -> Vec<Settled> {
        self.lock().nacks.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn open_channels(&self) -> usize {
        self.lock()
            .channels
            .values()
            .filter(|open| open.load(Ordering::SeqCst))
            .count()
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.lock().consumer_tags.clone()
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    pub fn is_consumed(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.subscription.is_some())
    }
}

#[async_trait]
impl BrokerTransport for FakeBroker {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(MessageBusError::BrokerUnreachable(
                "connection refused".to_string(),
            ));
        }
        state.connects += 1;
        let open = Arc::new(AtomicBool::new(true));
        state.connections.push(Arc::clone(&open));
        Ok(Arc::new(FakeConnection {
            broker: self.clone(),
            open,
        }))
    }
}

struct FakeConnection {
    broker: FakeBroker,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(MessageBusError::AlreadyClosed("connection".to_string()));
        }
        let mut state = self.broker.lock();
        state.next_channel_id += 1;
        state.channels_opened += 1;
        let id = state.next_channel_id;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(id, Arc::clone(&open));
        Ok(Arc::new(FakeChannel {
            id,
            open,
            connection_open: Arc::clone(&self.open),
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeChannel {
    id: u64,
    open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
    broker: FakeBroker,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MessageBusError::AlreadyClosed(format!("channel {}", self.id)))
        }
    }

    fn settle(&self, delivery_tag: u64, requeue: Option<bool>) -> Result<()> {
        self.broker.lock().settle_attempts += 1;
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.failing_settlements > 0 {
            state.failing_settlements -= 1;
            return Err(MessageBusError::Socket("connection reset by peer".to_string()));
        }

        let settled = Settled {
            channel_id: self.id,
            delivery_tag,
        };
        for (name, queue) in state.queues.iter_mut() {
            let Some(subscription) = queue.subscription.as_mut() else {
                continue;
            };
            if subscription.channel_id != self.id {
                continue;
            }
            if let Some(body) = subscription.unacked.remove(&delivery_tag) {
                if requeue == Some(true) {
                    queue.pending.push_back((body, true));
                    queue.dispatch(name);
                }
            }
        }
        match requeue {
            None => state.acks.push(settled),
            Some(_) => state.nacks.push(settled),
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        let state = self.broker.lock();
        match state.queues.get(queue) {
            Some(q) => Ok(q.pending.len() as u32),
            None => {
                // The broker closes the channel on a 404
                self.open.store(false, Ordering::SeqCst);
                Err(MessageBusError::QueueNotFound {
                    queue: queue.to_string(),
                    reason: "NOT_FOUND - no queue".to_string(),
                })
            }
        }
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (sender, receiver) = unbounded();
        let mut state = self.broker.lock();
        state.consumer_tags.push(consumer_tag.to_string());
        let queue_state = state.queues.entry(queue.to_string()).or_default();
        queue_state.subscription = Some(Subscription {
            channel_id: self.id,
            consumer_tag: consumer_tag.to_string(),
            sender,
            next_tag: 0,
            unacked: HashMap::new(),
        });
        queue_state.dispatch(queue);
        Ok(Box::pin(receiver))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag, None)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.settle(delivery_tag, Some(requeue))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.lock().release_channel(self.id);
        Ok(())
    }
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("test-client", "fake-broker", "guest", "guest")
}

pub fn fast_retry(retries: Option<u32>) -> RetryPolicy {
    let backoff = Backoff::capped(Duration::from_millis(1), Duration::from_millis(10));
    match retries {
        Some(retries) => RetryPolicy::bounded(retries, backoff),
        None => RetryPolicy::unbounded(backoff),
    }
}

pub fn fast_consumer_options() -> ConsumerOptions {
    ConsumerOptions {
        startup_delay: Duration::ZERO,
        connection_check_period: Duration::from_millis(10),
        prefetch_count: 10,
        retry_policy: fast_retry(None),
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub async fn with_timeout<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
