// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Errors
//!
//! Handler failures are reported as `TransportError` records on a shared fanout
//! exchange. Reporting is fire-and-forget: a failure to publish the record is
//! logged and never changes how the failed delivery is settled.

use crate::{
    channel::BrokerChannel,
    message::{Message, MessageProperties, OutboundMessage},
    otel,
    serializer::{JsonSerializer, MessageSerializer},
};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::error::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Message type and exchange name of transport error records
pub const TRANSPORT_ERROR_MESSAGE_TYPE: &str = "messaging.TransportError";

/// Structured description of a failure, including its chain of causes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportError {
    /// Consumer or publisher that observed the failure
    pub origin: String,
    pub message: String,
    pub stack_trace: String,
    pub inner_error: Option<Box<TransportError>>,
}

impl TransportError {
    /// Captures `err` and every error in its `source()` chain.
    pub fn from_error(origin: &str, err: &(dyn Error + 'static)) -> TransportError {
        TransportError {
            origin: origin.to_owned(),
            message: err.to_string(),
            stack_trace: format!("{err:?}"),
            inner_error: err
                .source()
                .map(|source| Box::new(TransportError::from_error(origin, source))),
        }
    }
}

impl Message for TransportError {
    const MESSAGE_TYPE: &'static str = TRANSPORT_ERROR_MESSAGE_TYPE;
}

/// Publishes transport error records to the transport error exchange.
#[derive(Debug, Clone, Default)]
pub struct TransportErrorPublisher<S: MessageSerializer = JsonSerializer> {
    serializer: S,
}

impl<S: MessageSerializer> TransportErrorPublisher<S> {
    pub fn new(serializer: S) -> TransportErrorPublisher<S> {
        TransportErrorPublisher { serializer }
    }

    /// Reports `err` on behalf of `origin`. Never fails.
    pub async fn publish<C: BrokerChannel + ?Sized>(
        &self,
        origin: &str,
        err: &(dyn Error + Send + Sync + 'static),
        channel: &C,
        token: &CancellationToken,
    ) {
        let record = TransportError::from_error(origin, err);

        let payload = match self.serializer.serialize(&record) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), origin, "failure to encode transport error");
                return;
            }
        };

        let mut props = MessageProperties::persistent(TRANSPORT_ERROR_MESSAGE_TYPE);
        otel::inject_context(&Context::current(), &mut props);

        let outbound = OutboundMessage::broadcast(TRANSPORT_ERROR_MESSAGE_TYPE, payload, props);

        tokio::select! {
            result = channel.publish(outbound) => match result {
                Ok(()) => debug!(origin, "transport error published"),
                Err(err) => error!(error = err.to_string(), origin, "failure to publish transport error"),
            },
            _ = token.cancelled() => warn!(origin, "transport error dropped on cancellation"),
        }
    }
}
