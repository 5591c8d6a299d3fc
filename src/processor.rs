// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Processing
//!
//! A `MessageProcessor` owns one delivery from reception to its terminal
//! disposition. The steps always run in the same order:
//!
//! 1. retry limit check, rejecting exhausted deliveries so the broker dead-letters them
//! 2. subscription lookup by type, acknowledging unaddressed deliveries
//! 3. payload decoding, settled by the consumer's serializer policy on failure
//! 4. handler invocation, followed by an ack, a retry or (retries disabled) an ack
//!
//! Every delivery is settled exactly once: acknowledged, rejected, or acknowledged
//! and republished for retry.

use crate::{
    channel::BrokerChannel,
    configuration::{ConsumerConfiguration, ConsumerSerializerErrorPolicy},
    errors::MessagingError,
    message::Delivery,
    otel,
    retry::RetryScheduler,
    transport_error::TransportErrorPublisher,
};
use opentelemetry::trace::{Span, Status};
use std::{borrow::Cow, fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Why a delivery was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    Handled,
    NoSubscription,
    UndecodablePayload,
    /// The handler failed and the consumer does not retry
    RetriesDisabled,
}

/// Why a delivery was rejected without requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    RetryLimitExceeded,
    UndecodablePayload,
}

/// Terminal outcome of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked(AckReason),
    Rejected(RejectReason),
    /// Acknowledged and republished to the retry queue as the given attempt
    Retried { attempt: u32 },
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Acked(reason) => write!(f, "acked ({reason:?})"),
            Disposition::Rejected(reason) => write!(f, "rejected ({reason:?})"),
            Disposition::Retried { attempt } => write!(f, "retried (attempt {attempt})"),
        }
    }
}

/// Processes a single delivery of one consumer.
pub struct MessageProcessor<C: BrokerChannel> {
    config: Arc<ConsumerConfiguration>,
    channel: Arc<C>,
    transport_errors: TransportErrorPublisher,
    retry: RetryScheduler,
}

impl<C: BrokerChannel> MessageProcessor<C> {
    /// Creates a processor settling deliveries on `channel`.
    pub fn new(config: Arc<ConsumerConfiguration>, channel: Arc<C>) -> MessageProcessor<C> {
        MessageProcessor {
            config,
            channel,
            transport_errors: TransportErrorPublisher::default(),
            retry: RetryScheduler,
        }
    }

    /// Runs the delivery to its terminal disposition.
    ///
    /// An error means the broker refused the ack, reject or republish; the delivery
    /// then stays unacknowledged and the broker redelivers it once the channel closes.
    pub async fn process(
        self,
        delivery: Delivery,
        token: CancellationToken,
    ) -> Result<Disposition, MessagingError> {
        let span_name = match delivery.properties.message_type.as_str() {
            "" => "unknown",
            name => name,
        };
        let (_ctx, mut span) =
            otel::new_span(&delivery.properties, &otel::tracer(), span_name);

        debug!(
            consumer = self.config.name(),
            message_type = delivery.properties.message_type.as_str(),
            retry_count = delivery.properties.retry_count,
            "received"
        );

        let result = self.settle(delivery, &token).await;

        match &result {
            Ok(disposition) => {
                debug!(consumer = self.config.name(), "message {}", disposition);
                span.set_status(Status::Ok);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    consumer = self.config.name(),
                    "failure to settle delivery"
                );
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();

        result
    }

    async fn settle(
        &self,
        delivery: Delivery,
        token: &CancellationToken,
    ) -> Result<Disposition, MessagingError> {
        let tag = delivery.delivery_tag;
        let retry_count = delivery.properties.retry_count;
        let max_retry_count = self.config.max_retry_count();

        if max_retry_count > 0 && retry_count >= max_retry_count {
            warn!(
                consumer = self.config.name(),
                retry_count, "too many attempts, sending to dlq"
            );
            self.channel.reject(tag).await?;
            return Ok(Disposition::Rejected(RejectReason::RetryLimitExceeded));
        }

        let Some(binding) = self.config.subscription(&delivery.properties.message_type) else {
            debug!(
                consumer = self.config.name(),
                message_type = delivery.properties.message_type.as_str(),
                "removing message from queue - reason: unsupported msg type"
            );
            self.channel.ack(tag).await?;
            return Ok(Disposition::Acked(AckReason::NoSubscription));
        };

        let invocation = match binding.decode(&delivery.payload) {
            Ok(invocation) => invocation,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    consumer = self.config.name(),
                    "undecodable payload"
                );
                return match self.config.serializer_error_policy() {
                    ConsumerSerializerErrorPolicy::Ignore => {
                        self.channel.ack(tag).await?;
                        Ok(Disposition::Acked(AckReason::UndecodablePayload))
                    }
                    ConsumerSerializerErrorPolicy::DeadLetter => {
                        self.channel.reject(tag).await?;
                        Ok(Disposition::Rejected(RejectReason::UndecodablePayload))
                    }
                };
            }
        };

        match invocation.invoke(token.clone()).await {
            Ok(()) => {
                self.channel.ack(tag).await?;
                Ok(Disposition::Acked(AckReason::Handled))
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    consumer = self.config.name(),
                    "error whiling handling msg"
                );
                self.transport_errors
                    .publish(self.config.name(), &*err, self.channel.as_ref(), token)
                    .await;

                if max_retry_count == 0 {
                    self.channel.ack(tag).await?;
                    return Ok(Disposition::Acked(AckReason::RetriesDisabled));
                }

                self.retry
                    .retry(delivery, &self.config, self.channel.as_ref(), token)
                    .await?;
                Ok(Disposition::Retried {
                    attempt: retry_count + 1,
                })
            }
        }
    }
}
