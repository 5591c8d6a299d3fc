// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Runtime
//!
//! The composition root: owns the channel factory, provisions the topology on
//! startup, runs one `MessageConsumer` per configured consumer and exposes the
//! shared publisher.
//!
//! ```ignore
//! let config = MessagingConfiguration::builder()
//!     .with_settings(&MessagingSettings::from_env()?)
//!     .consumer(
//!         ConsumerConfiguration::builder("billing")
//!             .subscribe::<OrderPlaced, _>(|msg: OrderPlaced, _token| async move {
//!                 charge(msg).await
//!             })
//!             .build()?,
//!     )
//!     .build()?;
//!
//! let runtime = MessagingRuntime::new(config);
//! runtime.start().await?;
//! runtime.publisher().broadcast(&OrderPlaced { id: 1 }, &token).await?;
//! runtime.stop().await;
//! ```

use crate::{
    channel::{BrokerChannel, ChannelFactory},
    configuration::MessagingConfiguration,
    connection::{AmqpConnector, ConnectionPool},
    consumer::MessageConsumer,
    errors::MessagingError,
    publisher::MessagePublisher,
    topology::TopologyProvisioner,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection name reported to the broker
pub const CONNECTION_NAME: &str = "rabbitmq-messaging";

/// Lifecycle of a runtime. A stopped runtime cannot be started again.
enum RuntimeState<C: BrokerChannel> {
    Idle,
    Running(Vec<MessageConsumer<C>>),
    Stopped,
}

/// Owns the broker resources of an application and runs its consumers.
///
/// A runtime is started once and stopped once. A start that fails partway releases
/// whatever it created and leaves the runtime idle, so the start can be retried.
pub struct MessagingRuntime<F: ChannelFactory = ConnectionPool> {
    config: MessagingConfiguration,
    factory: Arc<F>,
    publisher: Arc<MessagePublisher<F>>,
    state: Mutex<RuntimeState<F::Channel>>,
    token: CancellationToken,
}

impl MessagingRuntime<ConnectionPool> {
    /// Creates a runtime connected through a pool of AMQP connections.
    ///
    /// # Parameters
    /// * `config` - Validated configuration; its connection string and pool size
    ///   shape the connection pool
    pub fn new(config: MessagingConfiguration) -> MessagingRuntime<ConnectionPool> {
        let connector = AmqpConnector::new(config.connection_string(), CONNECTION_NAME);
        let pool = ConnectionPool::new(connector, config.connection_pool_size());

        MessagingRuntime::with_channel_factory(config, Arc::new(pool))
    }
}

impl<F: ChannelFactory> MessagingRuntime<F> {
    /// Creates a runtime over any channel factory.
    ///
    /// # Parameters
    /// * `config` - Validated configuration
    /// * `factory` - Source of every channel the runtime and its publisher use
    pub fn with_channel_factory(config: MessagingConfiguration, factory: Arc<F>) -> Self {
        let publisher = Arc::new(MessagePublisher::new(
            factory.clone(),
            config.publisher().clone(),
        ));

        MessagingRuntime {
            config,
            factory,
            publisher,
            state: Mutex::new(RuntimeState::Idle),
            token: CancellationToken::new(),
        }
    }

    /// Configuration the runtime was built from.
    pub fn configuration(&self) -> &MessagingConfiguration {
        &self.config
    }

    /// Shared publisher; it stops working once the runtime is stopped.
    pub fn publisher(&self) -> Arc<MessagePublisher<F>> {
        self.publisher.clone()
    }

    /// Signal cancelled when the runtime stops; handed to every handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Reports whether `start` succeeded and `stop` was not called yet.
    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, RuntimeState::Running(_))
    }

    /// Provisions the topology and starts every consumer.
    ///
    /// # Returns
    /// `MessagingError::Configuration` if the runtime is running or was stopped,
    /// otherwise the first broker error met while provisioning or consuming. On
    /// error every consumer created so far is disposed.
    pub async fn start(&self) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        match *state {
            RuntimeState::Running(_) => {
                return Err(MessagingError::Configuration(
                    "messaging runtime already started".to_owned(),
                ))
            }
            RuntimeState::Stopped => {
                return Err(MessagingError::Configuration(
                    "messaging runtime was stopped".to_owned(),
                ))
            }
            RuntimeState::Idle => {}
        }

        self.provision_exchanges().await?;

        let mut consumers = Vec::with_capacity(self.config.consumers().len());
        if let Err(err) = self.start_consumers(&mut consumers).await {
            error!(error = err.to_string(), "failure to start messaging runtime");
            for mut consumer in consumers {
                consumer.dispose().await;
            }
            return Err(err);
        }

        info!(consumers = consumers.len(), "messaging runtime started");
        *state = RuntimeState::Running(consumers);
        Ok(())
    }

    /// Stops every consumer, then releases the publisher and the connections.
    ///
    /// The runtime cannot be started again afterwards.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, RuntimeState::Stopped);
        if let RuntimeState::Running(consumers) = previous {
            for mut consumer in consumers {
                consumer.dispose().await;
            }
        }

        self.token.cancel();
        self.publisher.close().await;
        self.factory.shutdown().await;

        info!("messaging runtime stopped");
    }

    /// Declares the defaults and the message exchanges over a short-lived channel.
    async fn provision_exchanges(&self) -> Result<(), MessagingError> {
        let startup = self.factory.create_channel().await?;
        let provisioner = TopologyProvisioner::new(startup.clone());

        let result = match provisioner.provision_defaults().await {
            Ok(()) => provisioner.provision_message_exchanges(&self.config).await,
            Err(err) => Err(err),
        };

        if let Err(err) = startup.close().await {
            warn!(error = err.to_string(), "error closing startup channel");
        }
        result
    }

    /// Provisions the queues of every consumer, then starts them all.
    ///
    /// Consumers are pushed as soon as their channel exists so the caller can
    /// dispose them if a later step fails.
    async fn start_consumers(
        &self,
        consumers: &mut Vec<MessageConsumer<F::Channel>>,
    ) -> Result<(), MessagingError> {
        for consumer_config in self.config.consumers() {
            let channel = self.factory.create_channel().await?;
            consumers.push(MessageConsumer::new(consumer_config.clone(), channel.clone()));

            TopologyProvisioner::new(channel)
                .provision_consumer_queues(consumer_config)
                .await?;
        }

        for consumer in consumers.iter_mut() {
            consumer.start(&self.token).await?;
            debug!(consumer = consumer.name(), "consumer started");
        }

        Ok(())
    }
}
