// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A `MessageConsumer` consumes the main queue and the retry queue of one consumer
//! configuration on a dedicated channel. Every delivery is processed on its own task;
//! the broker prefetch set to the configured max concurrency bounds how many are in
//! flight at once.

use crate::{
    channel::BrokerChannel,
    configuration::ConsumerConfiguration,
    errors::MessagingError,
    message::Delivery,
    processor::MessageProcessor,
};
use futures_util::{future::join_all, Stream, StreamExt};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

struct ActiveSubscription {
    consumer_tag: String,
    handle: JoinHandle<()>,
}

/// Runs the subscriptions of one consumer configuration on a dedicated channel.
///
/// The consumer owns its channel: `dispose` closes it once in-flight deliveries
/// settle.
pub struct MessageConsumer<C: BrokerChannel> {
    config: Arc<ConsumerConfiguration>,
    channel: Arc<C>,
    token: CancellationToken,
    subscriptions: Vec<ActiveSubscription>,
}

impl<C: BrokerChannel> MessageConsumer<C> {
    /// Creates an idle consumer; nothing is consumed until `start` is called.
    ///
    /// # Parameters
    /// * `config` - Consumer configuration naming the queues and handlers
    /// * `channel` - Channel reserved for this consumer
    pub fn new(config: Arc<ConsumerConfiguration>, channel: Arc<C>) -> MessageConsumer<C> {
        MessageConsumer {
            config,
            channel,
            token: CancellationToken::new(),
            subscriptions: vec![],
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Starts consuming the main and retry queues with manual acknowledgement.
    ///
    /// Deliveries are processed until `token` is cancelled or the consumer is disposed.
    ///
    /// # Parameters
    /// * `token` - Parent signal; the consumer listens on a child of it
    ///
    /// # Returns
    /// Ok(()) once both subscriptions are active, or the broker error met while
    /// setting the prefetch or subscribing
    pub async fn start(&mut self, token: &CancellationToken) -> Result<(), MessagingError> {
        self.token = token.child_token();

        let queues = [
            self.config.queue_name().to_owned(),
            self.config.retry_queue_name().to_owned(),
        ];

        for queue in queues {
            self.channel
                .set_prefetch(self.config.max_concurrency())
                .await?;

            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
            let deliveries = self.channel.consume(&queue, &consumer_tag).await?;

            debug!(consumer = self.config.name(), queue = queue.as_str(), "consuming");

            let handle = tokio::spawn(consume_deliveries(
                deliveries,
                self.config.clone(),
                self.channel.clone(),
                self.token.clone(),
            ));

            self.subscriptions.push(ActiveSubscription {
                consumer_tag,
                handle,
            });
        }

        Ok(())
    }

    /// Cancels both subscriptions, waits for in-flight deliveries and closes the channel.
    pub async fn dispose(&mut self) {
        let subscriptions: Vec<ActiveSubscription> = self.subscriptions.drain(..).collect();

        for subscription in &subscriptions {
            if let Err(err) = self.channel.cancel(&subscription.consumer_tag).await {
                warn!(
                    error = err.to_string(),
                    consumer = self.config.name(),
                    "error to cancel the consumer"
                );
            }
        }

        self.token.cancel();

        for res in join_all(subscriptions.into_iter().map(|s| s.handle)).await {
            if let Err(err) = res {
                error!(error = err.to_string(), "tokio process error");
            }
        }

        if let Err(err) = self.channel.close().await {
            warn!(error = err.to_string(), "error closing consumer channel");
        }

        debug!(consumer = self.config.name(), "consumer disposed");
    }
}

/// Spawns one processing task per delivery until the stream ends or `token` fires,
/// then waits for the tasks still in flight.
pub(crate) async fn consume_deliveries<C, St>(
    mut deliveries: St,
    config: Arc<ConsumerConfiguration>,
    channel: Arc<C>,
    token: CancellationToken,
) where
    C: BrokerChannel,
    St: Stream<Item = Result<Delivery, MessagingError>> + Unpin + Send,
{
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    let processor = MessageProcessor::new(config.clone(), channel.clone());
                    in_flight.spawn(processor.process(delivery, token.clone()));
                }
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    error!(error = err.to_string(), "processing task failed");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(error = err.to_string(), "processing task failed");
        }
    }
}
