// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Retries
//!
//! A failed delivery is acknowledged, held for the retry delay and republished to the
//! consumer's retry queue with its retry count incremented. The retry queue is
//! consumed like the main queue, so the next attempt goes through the same
//! processing steps and sees the updated count.

use crate::{
    channel::BrokerChannel,
    configuration::ConsumerConfiguration,
    errors::MessagingError,
    message::{Delivery, OutboundMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryScheduler;

impl RetryScheduler {
    /// Settles `delivery` by scheduling its next attempt.
    ///
    /// If cancellation fires during the delay the message is republished right away
    /// so the pending attempt is not lost.
    pub async fn retry<C: BrokerChannel + ?Sized>(
        &self,
        delivery: Delivery,
        config: &ConsumerConfiguration,
        channel: &C,
        token: &CancellationToken,
    ) -> Result<(), MessagingError> {
        channel.ack(delivery.delivery_tag).await?;

        tokio::select! {
            _ = tokio::time::sleep(config.retry_delay()) => {},
            _ = token.cancelled() => {
                warn!(
                    queue = config.retry_queue_name(),
                    "cancelled while waiting to retry, republishing now"
                );
            },
        }

        let props = delivery.properties.next_attempt();
        debug!(
            queue = config.retry_queue_name(),
            retry_count = props.retry_count,
            "republishing message for retry"
        );

        channel
            .publish(OutboundMessage::direct(
                config.retry_queue_name(),
                delivery.payload,
                props,
            ))
            .await
    }
}
