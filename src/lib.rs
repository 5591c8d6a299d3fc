// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Messaging
//!
//! Typed publish/subscribe on top of RabbitMQ: broadcast and direct-send publishing,
//! declarative consumers with delayed retries, dead-lettering and transport error
//! reporting.

mod otel;

pub mod channel;
pub mod configuration;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod serializer;
pub mod settings;
pub mod subscription;
pub mod topology;
pub mod transport_error;

pub use configuration::{
    ConsumerConfiguration, ConsumerSerializerErrorPolicy, MessagingConfiguration,
    PublisherConfiguration, PublisherSerializerErrorPolicy,
};
pub use errors::{MessagingError, SerializationError};
pub use message::Message;
pub use publisher::MessagePublisher;
pub use runtime::MessagingRuntime;
pub use settings::{ConsumerSettings, MessagingSettings};
pub use subscription::{HandlerError, MessageHandler};
pub use transport_error::TransportError;
