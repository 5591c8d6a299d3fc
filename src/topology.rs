// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module describes and installs the broker topology the runtime relies on:
//!
//! - the durable fanout transport error exchange
//! - the dead-letter exchange and its bounded, lazy dead-letter queue
//! - one fanout exchange per message type that is published or subscribed to
//! - per consumer, a main queue and a retry queue dead-lettering to the shared
//!   dead-letter exchange, with the main queue bound to every subscribed type
//!
//! Every declaration is idempotent, so provisioning can run on each startup.

use crate::{
    channel::BrokerChannel,
    configuration::{ConsumerConfiguration, MessagingConfiguration, PublisherConfiguration},
    errors::MessagingError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport_error::TRANSPORT_ERROR_MESSAGE_TYPE,
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

/// Exchange receiving rejected and expired messages
pub const DEAD_LETTER_EXCHANGE: &str = "messaging.DeadLetterExchange";
/// Terminal queue of rejected and expired messages
pub const DEAD_LETTER_QUEUE: &str = "messaging.DeadLetter";

const DEAD_LETTER_QUEUE_MAX_LENGTH: u32 = 1_000;
const DEAD_LETTER_QUEUE_TTL_MILLIS: u32 = 86_400_000;

/// A set of exchanges, queues and bindings installed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange; an exchange with the same name is only declared once.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.iter().any(|e| e.name == def.name) {
            self.exchanges.push(def);
        }
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Topology shared by every consumer and publisher.
    pub fn defaults() -> Topology {
        Topology::new()
            .exchange(
                ExchangeDefinition::new(TRANSPORT_ERROR_MESSAGE_TYPE).durable(),
            )
            .exchange(ExchangeDefinition::new(DEAD_LETTER_EXCHANGE).durable())
            .queue(
                QueueDefinition::new(DEAD_LETTER_QUEUE)
                    .durable()
                    .lazy()
                    .max_length(DEAD_LETTER_QUEUE_MAX_LENGTH)
                    .ttl(DEAD_LETTER_QUEUE_TTL_MILLIS),
            )
            .queue_binding(QueueBinding::new(DEAD_LETTER_QUEUE).exchange(DEAD_LETTER_EXCHANGE))
    }

    /// One fanout exchange per message type published or subscribed to.
    ///
    /// The transport error exchange is left out; it belongs to the defaults.
    pub fn message_exchanges(config: &MessagingConfiguration) -> Topology {
        let message_types: BTreeSet<&str> = config
            .publisher()
            .message_types()
            .chain(
                config
                    .consumers()
                    .iter()
                    .flat_map(|consumer| consumer.subscribed_types()),
            )
            .filter(|message_type| *message_type != TRANSPORT_ERROR_MESSAGE_TYPE)
            .collect();

        message_types
            .into_iter()
            .fold(Topology::new(), |topology, message_type| {
                topology.exchange(message_exchange(message_type, config.publisher()))
            })
    }

    /// Main and retry queues of a consumer.
    ///
    /// Only the main queue is bound to the message exchanges; the retry queue is fed
    /// by direct republishing.
    pub fn consumer_queues(consumer: &ConsumerConfiguration) -> Topology {
        let mut subscribed: Vec<&str> = consumer.subscribed_types().collect();
        subscribed.sort_unstable();

        let topology = Topology::new()
            .queue(consumer_queue(consumer.queue_name(), consumer))
            .queue(consumer_queue(consumer.retry_queue_name(), consumer));

        subscribed.into_iter().fold(topology, |topology, message_type| {
            topology.queue_binding(QueueBinding::new(consumer.queue_name()).exchange(message_type))
        })
    }

    /// Declares the exchanges, then the queues, then the bindings.
    pub async fn install<C: BrokerChannel + ?Sized>(&self, channel: &C) -> Result<(), MessagingError> {
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await?;
            debug!("exchange: {} was created", exchange.name);
        }

        for queue in &self.queues {
            channel.declare_queue(queue).await?;
            debug!("queue: {} was created", queue.name);
        }

        for binding in &self.bindings {
            channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Fanout exchange of a message type, declared identically by provisioner and publisher.
pub(crate) fn message_exchange(
    message_type: &str,
    publisher: &PublisherConfiguration,
) -> ExchangeDefinition {
    let auto_delete =
        publisher.auto_delete_exchanges() && message_type != TRANSPORT_ERROR_MESSAGE_TYPE;

    ExchangeDefinition::new(message_type)
        .durable()
        .auto_delete(auto_delete)
}

fn consumer_queue(name: &str, consumer: &ConsumerConfiguration) -> QueueDefinition {
    let mut def = QueueDefinition::new(name)
        .durable()
        .lazy()
        .auto_delete(consumer.auto_delete())
        .dead_letter(DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE);

    if !consumer.message_ttl().is_zero() {
        let millis = u32::try_from(consumer.message_ttl().as_millis()).unwrap_or(u32::MAX);
        def = def.ttl(millis);
    }

    if consumer.max_message_count() > 0 {
        def = def.max_length(consumer.max_message_count());
    }

    def
}

/// Installs the runtime topology over one channel.
pub struct TopologyProvisioner<C: BrokerChannel> {
    channel: Arc<C>,
}

impl<C: BrokerChannel> TopologyProvisioner<C> {
    pub fn new(channel: Arc<C>) -> TopologyProvisioner<C> {
        TopologyProvisioner { channel }
    }

    /// Declares the transport error exchange, the dead-letter exchange and queue.
    pub async fn provision_defaults(&self) -> Result<(), MessagingError> {
        Topology::defaults().install(self.channel.as_ref()).await
    }

    /// Declares one fanout exchange per published or subscribed message type.
    pub async fn provision_message_exchanges(
        &self,
        config: &MessagingConfiguration,
    ) -> Result<(), MessagingError> {
        Topology::message_exchanges(config)
            .install(self.channel.as_ref())
            .await
    }

    /// Declares the main and retry queues of `consumer` and binds the main queue.
    ///
    /// # Parameters
    /// * `consumer` - Consumer whose queues are declared
    ///
    /// # Returns
    /// Ok(()) on success or the first declare or bind error
    pub async fn provision_consumer_queues(
        &self,
        consumer: &ConsumerConfiguration,
    ) -> Result<(), MessagingError> {
        Topology::consumer_queues(consumer)
            .install(self.channel.as_ref())
            .await
    }
}
