// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriptions and Handlers
//!
//! A subscription binds one message type to one handler. Bindings are built once at
//! configuration time and capture the decode-and-invoke steps for their type in a
//! closure, so the processor dispatches on the type header with a plain map lookup.

use crate::{errors::SerializationError, message::Message, serializer::MessageSerializer};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{fmt, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Error returned by a message handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Handles messages of one type.
///
/// Closures of the form `Fn(M, CancellationToken) -> impl Future<Output = Result<(), HandlerError>>`
/// implement this trait, so most handlers never name it. Handlers are expected to
/// observe the cancellation token cooperatively.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M, token: CancellationToken) -> Result<(), HandlerError>;
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Message,
    F: Fn(M, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: M, token: CancellationToken) -> Result<(), HandlerError> {
        (self)(message, token).await
    }
}

/// A decoded message ready to be handed to its handler.
pub struct PendingInvocation {
    invoke: Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), HandlerError>> + Send>,
}

impl PendingInvocation {
    /// Runs the handler with the decoded message.
    pub async fn invoke(self, token: CancellationToken) -> Result<(), HandlerError> {
        (self.invoke)(token).await
    }
}

type Decoder =
    dyn Fn(&[u8]) -> Result<PendingInvocation, SerializationError> + Send + Sync + 'static;

/// Binds exactly one handler to one message type.
#[derive(Clone)]
pub struct SubscriptionBinding {
    message_type: String,
    decoder: Arc<Decoder>,
}

impl SubscriptionBinding {
    /// Creates a binding that decodes payloads of `M` with the given serializer.
    pub fn new<M, H, S>(handler: H, serializer: S) -> SubscriptionBinding
    where
        M: Message,
        H: MessageHandler<M>,
        S: MessageSerializer,
    {
        let handler = Arc::new(handler);

        let decoder = move |payload: &[u8]| -> Result<PendingInvocation, SerializationError> {
            let message: M = serializer.deserialize(payload)?;
            let handler = handler.clone();

            Ok(PendingInvocation {
                invoke: Box::new(move |token: CancellationToken| {
                    Box::pin(async move { handler.handle(message, token).await })
                        as BoxFuture<'static, Result<(), HandlerError>>
                }),
            })
        };

        SubscriptionBinding {
            message_type: M::MESSAGE_TYPE.to_owned(),
            decoder: Arc::new(decoder),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Decodes a payload into a pending handler invocation.
    ///
    /// The handler is not run here; a decode failure means it never runs.
    pub fn decode(&self, payload: &[u8]) -> Result<PendingInvocation, SerializationError> {
        (self.decoder)(payload)
    }
}

impl fmt::Debug for SubscriptionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBinding")
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}
