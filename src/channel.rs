// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channels
//!
//! This module defines the broker operations the messaging runtime relies on and
//! implements them over lapin channels. `BrokerChannel` is the only seam between
//! the runtime and the AMQP transport: topology declaration, consuming, publishing,
//! acknowledging and rejecting all go through it.

use crate::{
    errors::MessagingError,
    exchange::ExchangeDefinition,
    message::{Delivery, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// Reply code used when closing a channel normally
const AMQP_REPLY_SUCCESS: u16 = 200;

/// Stream of deliveries produced by a consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, MessagingError>>;

/// Broker operations used by the messaging runtime.
///
/// Implementations must not interleave writes on the underlying channel; callers
/// may share one instance between concurrently processed deliveries.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Reports whether the channel can still be used.
    fn is_open(&self) -> bool;

    /// Declares an exchange; a no-op if it already exists with the same attributes.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), MessagingError>;

    /// Declares a queue; a no-op if it already exists with the same attributes.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), MessagingError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), MessagingError>;

    /// Caps the number of unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError>;

    /// Starts consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, MessagingError>;

    /// Cancels a consumer subscription, ending its delivery stream.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    async fn publish(&self, message: OutboundMessage) -> Result<(), MessagingError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    /// Rejects a delivery without requeueing it, letting the broker dead-letter it.
    async fn reject(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

/// Creates channels for publishers, consumers and topology provisioning.
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Arc<Self::Channel>, MessagingError>;

    /// Releases every broker resource the factory holds.
    async fn shutdown(&self) {}
}

/// `BrokerChannel` implementation over a lapin channel.
///
/// Every write is serialized through an async mutex so that acknowledgements and
/// publishes issued by concurrent processing tasks never interleave on the wire.
pub struct AmqpChannel {
    channel: Channel,
    writer: Mutex<()>,
}

impl AmqpChannel {
    /// Wraps an open lapin channel.
    pub fn new(channel: Channel) -> Arc<AmqpChannel> {
        Arc::new(AmqpChannel {
            channel,
            writer: Mutex::new(()),
        })
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), MessagingError> {
        debug!("creating exchange: {}", def.name);

        let _guard = self.writer.lock().await;
        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(MessagingError::DeclareExchange(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), MessagingError> {
        debug!("creating queue: {}", def.name);

        let _guard = self.writer.lock().await;
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(MessagingError::DeclareQueue(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), MessagingError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        let _guard = self.writer.lock().await;
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                MessagingError::BindQueue {
                    queue: binding.queue_name.clone(),
                    exchange: binding.exchange_name.clone(),
                }
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        let _guard = self.writer.lock().await;
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                MessagingError::QoS(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, MessagingError> {
        let _guard = self.writer.lock().await;
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(MessagingError::Consumer(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |result| {
                result.map(Delivery::from).map_err(|err| {
                    error!(error = err.to_string(), "errors consume msg");
                    MessagingError::Consumer(queue.clone())
                })
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        let _guard = self.writer.lock().await;
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                MessagingError::Consumer(consumer_tag.to_owned())
            })
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), MessagingError> {
        let _guard = self.writer.lock().await;
        match self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: message.mandatory,
                },
                &message.payload,
                message.properties.to_amqp(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(MessagingError::Publish {
                    message_type: message.properties.message_type.clone(),
                    reason: err.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let _guard = self.writer.lock().await;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                MessagingError::Ack(delivery_tag)
            })
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        let _guard = self.writer.lock().await;
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                MessagingError::Reject(delivery_tag)
            })
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.is_open() {
            return Ok(());
        }

        let _guard = self.writer.lock().await;
        self.channel
            .close(AMQP_REPLY_SUCCESS, "closing channel")
            .await
            .map_err(|err| MessagingError::Channel(err.to_string()))
    }
}
