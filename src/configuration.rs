// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Configuration
//!
//! This module provides the configuration model of the runtime and the builders
//! used to assemble it. Every configuration is validated in `build()` and is
//! read-only afterwards; consumers and their subscription tables are shared with the
//! processing tasks without locking.

use crate::{
    errors::MessagingError,
    message::Message,
    serializer::{JsonSerializer, MessageSerializer},
    settings::{ConsumerSettings, MessagingSettings},
    subscription::{MessageHandler, SubscriptionBinding},
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

/// Suffix appended to a consumer queue name to form its retry queue name
pub const RETRY_QUEUE_SUFFIX: &str = ".Retry";

const DEFAULT_MAX_CONCURRENCY: u16 = 10;
const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What the publisher does when a payload cannot be serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublisherSerializerErrorPolicy {
    /// Drop the message silently
    #[default]
    Ignore,
    /// Return the serialization error to the caller
    Throw,
}

/// What a consumer does with a delivery whose payload cannot be deserialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerSerializerErrorPolicy {
    /// Acknowledge and drop the delivery
    #[default]
    Ignore,
    /// Reject the delivery so the broker moves it to the dead-letter queue
    DeadLetter,
}

/// Publisher settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherConfiguration {
    serializer_error_policy: PublisherSerializerErrorPolicy,
    auto_delete_exchanges: bool,
    message_types: BTreeSet<String>,
}

impl PublisherConfiguration {
    /// Starts a publisher configuration with the default policies.
    pub fn builder() -> PublisherConfigurationBuilder {
        PublisherConfigurationBuilder::default()
    }

    /// What to do with a message that cannot be serialized.
    pub fn serializer_error_policy(&self) -> PublisherSerializerErrorPolicy {
        self.serializer_error_policy
    }

    /// Whether message exchanges are deleted once their last queue is unbound.
    pub fn auto_delete_exchanges(&self) -> bool {
        self.auto_delete_exchanges
    }

    /// Message types whose exchanges are provisioned at startup.
    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.message_types.iter().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct PublisherConfigurationBuilder {
    configuration: PublisherConfiguration,
}

impl PublisherConfigurationBuilder {
    /// Sets the policy applied when a message cannot be serialized.
    pub fn on_serialization_error(mut self, policy: PublisherSerializerErrorPolicy) -> Self {
        self.configuration.serializer_error_policy = policy;
        self
    }

    /// Deletes message exchanges when the last subscriber queue is unbound from them.
    pub fn auto_delete(mut self) -> Self {
        self.configuration.auto_delete_exchanges = true;
        self
    }

    /// Declares the exchange of `M` at startup instead of on first broadcast.
    pub fn publishes<M: Message>(mut self) -> Self {
        self.configuration
            .message_types
            .insert(M::MESSAGE_TYPE.to_owned());
        self
    }

    pub fn build(self) -> PublisherConfiguration {
        self.configuration
    }
}

/// Settings of one consumer: its queues, flow control, retry policy and the
/// message-type → handler table.
#[derive(Debug, Clone)]
pub struct ConsumerConfiguration {
    name: String,
    queue_name: String,
    retry_queue_name: String,
    message_ttl: Duration,
    max_message_count: u32,
    max_concurrency: u16,
    max_retry_count: u32,
    retry_delay: Duration,
    auto_delete: bool,
    serializer_error_policy: ConsumerSerializerErrorPolicy,
    subscriptions: HashMap<String, SubscriptionBinding>,
}

impl ConsumerConfiguration {
    /// Starts a consumer configuration; the queue is named after the consumer.
    pub fn builder(name: &str) -> ConsumerConfigurationBuilder {
        ConsumerConfigurationBuilder {
            name: name.to_owned(),
            queue_name: name.to_owned(),
            message_ttl: Duration::ZERO,
            max_message_count: 0,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            auto_delete: false,
            serializer_error_policy: ConsumerSerializerErrorPolicy::default(),
            subscriptions: HashMap::default(),
            duplicates: vec![],
        }
    }

    /// Unique consumer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Main queue consumed, bound to every subscribed message exchange.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Queue receiving deliveries scheduled for another attempt.
    pub fn retry_queue_name(&self) -> &str {
        &self.retry_queue_name
    }

    /// Time-to-live of messages in the queues; zero means no expiry.
    pub fn message_ttl(&self) -> Duration {
        self.message_ttl
    }

    /// Maximum queue length; zero means unbounded.
    pub fn max_message_count(&self) -> u32 {
        self.max_message_count
    }

    /// Number of deliveries processed at once, applied as the channel prefetch.
    pub fn max_concurrency(&self) -> u16 {
        self.max_concurrency
    }

    /// Maximum number of retries; zero disables retrying.
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Delay before a failed delivery is republished to the retry queue.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// What to do with a delivery whose payload cannot be decoded.
    pub fn serializer_error_policy(&self) -> ConsumerSerializerErrorPolicy {
        self.serializer_error_policy
    }

    /// Handler registered for `message_type`, if any.
    pub fn subscription(&self, message_type: &str) -> Option<&SubscriptionBinding> {
        self.subscriptions.get(message_type)
    }

    pub fn subscribed_types(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }
}

/// Builder returned by `ConsumerConfiguration::builder`.
pub struct ConsumerConfigurationBuilder {
    name: String,
    queue_name: String,
    message_ttl: Duration,
    max_message_count: u32,
    max_concurrency: u16,
    max_retry_count: u32,
    retry_delay: Duration,
    auto_delete: bool,
    serializer_error_policy: ConsumerSerializerErrorPolicy,
    subscriptions: HashMap<String, SubscriptionBinding>,
    duplicates: Vec<String>,
}

impl ConsumerConfigurationBuilder {
    /// Sets the queue name; the retry queue name follows it.
    pub fn queue(mut self, queue_name: &str) -> Self {
        self.queue_name = queue_name.to_owned();
        self
    }

    /// Messages older than the TTL are dead-lettered.
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    /// Caps the number of messages the queue holds.
    pub fn max_message_count(mut self, max_count: u32) -> Self {
        self.max_message_count = max_count;
        self
    }

    /// Max number of deliveries processed concurrently, enforced as broker prefetch.
    pub fn max_concurrency(mut self, max_concurrency: u16) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets how often and how late a failed delivery is retried before it is dead-lettered.
    pub fn retries(mut self, max_retry_count: u32, retry_delay: Duration) -> Self {
        self.max_retry_count = max_retry_count;
        self.retry_delay = retry_delay;
        self
    }

    /// Deletes the queues once no consumer is connected to them.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the policy applied when a payload cannot be decoded.
    pub fn on_serialization_error(mut self, policy: ConsumerSerializerErrorPolicy) -> Self {
        self.serializer_error_policy = policy;
        self
    }

    /// Overrides queue and flow settings with the values present in `settings`.
    pub fn with_settings(mut self, settings: &ConsumerSettings) -> Self {
        if let Some(queue) = &settings.queue {
            self.queue_name = queue.clone();
        }
        if let Some(ttl) = settings.message_ttl_ms {
            self.message_ttl = Duration::from_millis(ttl);
        }
        if let Some(max_count) = settings.max_message_count {
            self.max_message_count = max_count;
        }
        if let Some(max_concurrency) = settings.max_concurrency {
            self.max_concurrency = max_concurrency;
        }
        if let Some(max_retry_count) = settings.max_retry_count {
            self.max_retry_count = max_retry_count;
        }
        if let Some(delay) = settings.retry_delay_ms {
            self.retry_delay = Duration::from_millis(delay);
        }
        self
    }

    /// Subscribes `handler` to messages of type `M`, decoded as JSON.
    pub fn subscribe<M, H>(self, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.subscribe_with::<M, H, JsonSerializer>(handler, JsonSerializer)
    }

    /// Subscribes `handler` to messages of type `M`, decoded with `serializer`.
    ///
    /// A second subscription for the same type is reported by `build()`.
    pub fn subscribe_with<M, H, S>(mut self, handler: H, serializer: S) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
        S: MessageSerializer,
    {
        if self.subscriptions.contains_key(M::MESSAGE_TYPE) {
            self.duplicates.push(M::MESSAGE_TYPE.to_owned());
            return self;
        }

        self.subscriptions.insert(
            M::MESSAGE_TYPE.to_owned(),
            SubscriptionBinding::new::<M, H, S>(handler, serializer),
        );
        self
    }

    /// Validates the settings and freezes the configuration.
    pub fn build(self) -> Result<ConsumerConfiguration, MessagingError> {
        if self.name.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "consumer name must not be empty".to_owned(),
            ));
        }

        if let Some(message_type) = self.duplicates.first() {
            return Err(MessagingError::Configuration(format!(
                "consumer `{}` is already subscribed to message type `{}`",
                self.name, message_type
            )));
        }

        if self.queue_name.trim().is_empty() {
            return Err(MessagingError::Configuration(format!(
                "consumer `{}` has an empty queue name",
                self.name
            )));
        }

        if self.max_concurrency < 1 {
            return Err(MessagingError::Configuration(format!(
                "consumer `{}` must allow at least one concurrent delivery",
                self.name
            )));
        }

        if self.max_retry_count > 0 && self.retry_delay.is_zero() {
            return Err(MessagingError::Configuration(format!(
                "consumer `{}` retries messages and needs a positive retry delay",
                self.name
            )));
        }

        Ok(ConsumerConfiguration {
            retry_queue_name: format!("{}{}", self.queue_name, RETRY_QUEUE_SUFFIX),
            name: self.name,
            queue_name: self.queue_name,
            message_ttl: self.message_ttl,
            max_message_count: self.max_message_count,
            max_concurrency: self.max_concurrency,
            max_retry_count: self.max_retry_count,
            retry_delay: self.retry_delay,
            auto_delete: self.auto_delete,
            serializer_error_policy: self.serializer_error_policy,
            subscriptions: self.subscriptions,
        })
    }
}

/// Root configuration of the runtime, built once at startup.
#[derive(Debug, Clone)]
pub struct MessagingConfiguration {
    connection_string: String,
    connection_pool_size: usize,
    publisher: PublisherConfiguration,
    consumers: Vec<Arc<ConsumerConfiguration>>,
}

impl MessagingConfiguration {
    /// Starts a configuration with the default pool size and publisher settings.
    pub fn builder() -> MessagingConfigurationBuilder {
        MessagingConfigurationBuilder {
            connection_string: None,
            connection_pool_size: default_pool_size(),
            publisher: PublisherConfiguration::default(),
            consumers: vec![],
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn connection_pool_size(&self) -> usize {
        self.connection_pool_size
    }

    pub fn publisher(&self) -> &PublisherConfiguration {
        &self.publisher
    }

    /// Consumers in registration order.
    pub fn consumers(&self) -> &[Arc<ConsumerConfiguration>] {
        &self.consumers
    }

    /// Looks a consumer up by name.
    pub fn consumer(&self, name: &str) -> Option<&Arc<ConsumerConfiguration>> {
        self.consumers.iter().find(|consumer| consumer.name == name)
    }
}

/// Builder returned by `MessagingConfiguration::builder`.
pub struct MessagingConfigurationBuilder {
    connection_string: Option<String>,
    connection_pool_size: usize,
    publisher: PublisherConfiguration,
    consumers: Vec<ConsumerConfiguration>,
}

impl MessagingConfigurationBuilder {
    /// Sets the AMQP connection string. Required.
    pub fn connection_string(mut self, connection_string: &str) -> Self {
        self.connection_string = Some(connection_string.to_owned());
        self
    }

    /// Maximum number of broker connections; defaults to the available parallelism.
    pub fn connection_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = size;
        self
    }

    /// Takes the connection string and pool size from environment-sourced settings.
    pub fn with_settings(mut self, settings: &MessagingSettings) -> Self {
        self.connection_string = Some(settings.connection_string.clone());
        if let Some(size) = settings.connection_pool_size {
            self.connection_pool_size = size;
        }
        self
    }

    pub fn publisher(mut self, publisher: PublisherConfiguration) -> Self {
        self.publisher = publisher;
        self
    }

    /// Registers a consumer; names must be unique.
    pub fn consumer(mut self, consumer: ConsumerConfiguration) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Validates the settings and freezes the configuration.
    pub fn build(self) -> Result<MessagingConfiguration, MessagingError> {
        let connection_string = match self.connection_string {
            Some(value) if !value.trim().is_empty() => value,
            _ => {
                return Err(MessagingError::Configuration(
                    "connection string is required".to_owned(),
                ))
            }
        };

        if self.connection_pool_size < 1 {
            return Err(MessagingError::Configuration(
                "connection pool size must be at least 1".to_owned(),
            ));
        }

        let mut names = BTreeSet::new();
        for consumer in &self.consumers {
            if !names.insert(consumer.name.as_str()) {
                return Err(MessagingError::Configuration(format!(
                    "consumer `{}` is configured more than once",
                    consumer.name
                )));
            }
        }

        Ok(MessagingConfiguration {
            connection_string,
            connection_pool_size: self.connection_pool_size,
            publisher: self.publisher,
            consumers: self.consumers.into_iter().map(Arc::new).collect(),
        })
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
