// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Runtime
//!
//! This module provides the error types shared by every messaging component.
//! `MessagingError` covers configuration, connection, topology, publishing and
//! acknowledgement failures. `SerializationError` is kept apart so that the
//! publisher and the processor can apply their serializer policies to it.

use thiserror::Error;

/// Represents errors that can occur while configuring or running the messaging layer.
///
/// Only `Configuration` and `Connection` errors are fatal for the process; everything
/// else is local to a single publish or delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Missing or invalid settings, detected at startup
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    Connection(String),

    /// Error creating or using a channel
    #[error("failure to create a channel: {0}")]
    Channel(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchange(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueue(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{queue}` to exchange `{exchange}`")]
    BindQueue { queue: String, exchange: String },

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoS(String),

    /// Error declaring or cancelling a consumer
    #[error("failure to consume from `{0}`")]
    Consumer(String),

    /// Error publishing a message of the given type
    #[error("failure to publish message of type `{message_type}`: {reason}")]
    Publish {
        message_type: String,
        reason: String,
    },

    /// Error acknowledging a delivery
    #[error("failure to ack delivery `{0}`")]
    Ack(u64),

    /// Error rejecting a delivery
    #[error("failure to reject delivery `{0}`")]
    Reject(u64),

    /// Error encoding or decoding a payload
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The operation observed the cancellation signal
    #[error("operation cancelled")]
    Cancelled,
}

/// Raised by a serializer on malformed input or unencodable values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("failure to serialize payload: {0}")]
    Serialize(String),

    #[error("failure to deserialize payload: {0}")]
    Deserialize(String),
}
