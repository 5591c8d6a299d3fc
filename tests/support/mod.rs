//! In-memory broker for end-to-end tests.
//!
//! Implements just enough of the AMQP model for the runtime: fanout exchanges,
//! default-exchange routing by queue name, consumers with manual acknowledgement and
//! dead-letter routing of rejected deliveries. Prefetch is accepted but not enforced.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rabbitmq_messaging::{
    channel::{BrokerChannel, ChannelFactory, DeliveryStream},
    exchange::ExchangeDefinition,
    message::{Delivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
    MessagingError,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{self, UnboundedSender};

#[derive(Default)]
struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Delivery>,
    consumers: Vec<String>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    consumers: HashMap<String, UnboundedSender<Delivery>>,
    unacked: HashMap<u64, (String, Delivery)>,
    published: Vec<OutboundMessage>,
    acked: Vec<u64>,
    rejected: Vec<u64>,
}

#[derive(Default)]
struct BrokerCore {
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
    open_channels: AtomicUsize,
}

impl BrokerCore {
    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    fn route(&self, state: &mut BrokerState, exchange: &str, routing_key: &str, message: &OutboundMessage) -> Result<(), String> {
        if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                self.enqueue(state, routing_key, message);
            }
            return Ok(());
        }

        if !state.exchanges.contains_key(exchange) {
            return Err(format!("no exchange `{exchange}`"));
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange_name() == exchange)
            .map(|b| b.queue_name().to_owned())
            .collect();

        for queue in targets {
            self.enqueue(state, &queue, message);
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut BrokerState, queue: &str, message: &OutboundMessage) {
        let delivery = Delivery {
            delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
            properties: message.properties.clone(),
            payload: message.payload.clone(),
        };

        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(delivery);
        }
        self.dispatch(state, queue);
    }

    fn dispatch(&self, state: &mut BrokerState, queue: &str) {
        loop {
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            if q.consumers.is_empty() || q.ready.is_empty() {
                return;
            }

            let index = q.next_consumer % q.consumers.len();
            q.next_consumer = q.next_consumer.wrapping_add(1);
            let tag = q.consumers[index].clone();
            let Some(delivery) = q.ready.pop_front() else {
                return;
            };

            match state.consumers.get(&tag) {
                Some(sender) if sender.send(delivery.clone()).is_ok() => {
                    state
                        .unacked
                        .insert(delivery.delivery_tag, (queue.to_owned(), delivery));
                }
                _ => {
                    if let Some(q) = state.queues.get_mut(queue) {
                        q.consumers.retain(|t| t != &tag);
                        q.ready.push_front(delivery);
                    }
                }
            }
        }
    }
}

/// Channel factory handing out channels over one shared in-memory broker.
#[derive(Default)]
pub struct InMemoryBroker {
    core: Arc<BrokerCore>,
    channels_created: AtomicUsize,
    shut_down: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::default())
    }

    pub fn channels_created(&self) -> usize {
        self.channels_created.load(Ordering::SeqCst)
    }

    /// Channels created and not closed yet.
    pub fn open_channels(&self) -> usize {
        self.core.open_channels.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.core.state().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.core.state().queues.get(name).map(|q| q.def.clone())
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.core.state().bindings.clone()
    }

    /// Messages waiting in a queue without a consumer.
    pub fn ready(&self, queue: &str) -> Vec<Delivery> {
        self.core
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.core
            .state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Every message published to `target`, an exchange or (through the default
    /// exchange) a queue.
    pub fn published_to(&self, target: &str) -> Vec<OutboundMessage> {
        self.core
            .state()
            .published
            .iter()
            .filter(|m| m.exchange == target || (m.exchange.is_empty() && m.routing_key == target))
            .cloned()
            .collect()
    }

    pub fn acked(&self) -> usize {
        self.core.state().acked.len()
    }

    pub fn rejected(&self) -> usize {
        self.core.state().rejected.len()
    }

    pub fn unacked(&self) -> usize {
        self.core.state().unacked.len()
    }
}

#[async_trait]
impl ChannelFactory for InMemoryBroker {
    type Channel = InMemoryChannel;

    async fn create_channel(&self) -> Result<Arc<InMemoryChannel>, MessagingError> {
        if self.is_shut_down() {
            return Err(MessagingError::Connection("broker shut down".to_owned()));
        }

        self.channels_created.fetch_add(1, Ordering::SeqCst);
        self.core.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryChannel {
            core: self.core.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

pub struct InMemoryChannel {
    core: Arc<BrokerCore>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), MessagingError> {
        let mut state = self.core.state();
        match state.exchanges.get(def.name()) {
            Some(existing) if existing != def => {
                Err(MessagingError::DeclareExchange(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), MessagingError> {
        let mut state = self.core.state();
        match state.queues.get(def.name()) {
            Some(existing) if &existing.def != def => {
                Err(MessagingError::DeclareQueue(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    QueueState {
                        def: def.clone(),
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), MessagingError> {
        let mut state = self.core.state();
        if !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue_name())
        {
            return Err(MessagingError::BindQueue {
                queue: binding.queue_name().to_owned(),
                exchange: binding.exchange_name().to_owned(),
            });
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, MessagingError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut state = self.core.state();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(MessagingError::Consumer(queue.to_owned()));
            };
            q.consumers.push(consumer_tag.to_owned());
            state.consumers.insert(consumer_tag.to_owned(), sender);
            self.core.dispatch(&mut state, queue);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        let mut state = self.core.state();
        state.consumers.remove(consumer_tag);
        for q in state.queues.values_mut() {
            q.consumers.retain(|t| t != consumer_tag);
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), MessagingError> {
        let core = self.core.clone();
        let mut state = core.state();
        state.published.push(message.clone());

        core.route(&mut state, &message.exchange, &message.routing_key, &message)
            .map_err(|reason| MessagingError::Publish {
                message_type: message.properties.message_type.clone(),
                reason,
            })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let mut state = self.core.state();
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(MessagingError::Ack(delivery_tag));
        }
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let core = self.core.clone();
        let mut state = core.state();
        let Some((queue, delivery)) = state.unacked.remove(&delivery_tag) else {
            return Err(MessagingError::Reject(delivery_tag));
        };
        state.rejected.push(delivery_tag);

        let dead_letter = state.queues.get(&queue).and_then(|q| {
            q.def
                .dead_letter_exchange()
                .map(|exchange| (exchange.to_owned(), q.def.dead_letter_routing_key().unwrap_or_default().to_owned()))
        });

        if let Some((exchange, routing_key)) = dead_letter {
            let message = OutboundMessage {
                exchange: exchange.clone(),
                routing_key: routing_key.clone(),
                mandatory: false,
                payload: delivery.payload,
                properties: delivery.properties,
            };
            let _ = core.route(&mut state, &exchange, &routing_key, &message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.core.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses; returns the last outcome.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
