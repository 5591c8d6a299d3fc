// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages, Deliveries and Properties
//!
//! This module defines the broker-independent view of a message: the `Message` trait
//! implemented by typed payloads, the `MessageProperties` carried on every publish,
//! the inbound `Delivery` and the outbound `OutboundMessage`. It also converts those
//! types to and from lapin's AMQP properties.

use crate::serializer::JSON_CONTENT_TYPE;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header carrying the number of times a delivery was retried
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// AMQP delivery mode marking a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode marking a message as transient
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// A typed payload that can be broadcast, sent and subscribed to.
///
/// `MESSAGE_TYPE` is the stable identifier of the payload on the wire. It names the
/// fanout exchange of the type and travels in the `type` property of every message.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { id: u64 }
///
/// impl Message for OrderPlaced {
///     const MESSAGE_TYPE: &'static str = "orders.OrderPlaced";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// Properties attached to a message.
///
/// The retry count is threaded explicitly through each republish with
/// [`MessageProperties::next_attempt`] instead of being mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_type: String,
    pub persistent: bool,
    pub retry_count: u32,
    pub message_id: Option<String>,
    /// Trace context propagated through the message headers
    pub trace_headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Creates persistent properties for a fresh message of the given type.
    pub fn persistent(message_type: &str) -> Self {
        MessageProperties {
            message_type: message_type.to_owned(),
            persistent: true,
            retry_count: 0,
            message_id: Some(Uuid::new_v4().to_string()),
            trace_headers: BTreeMap::default(),
        }
    }

    /// Returns a copy of these properties for the next retry attempt.
    pub fn next_attempt(&self) -> Self {
        MessageProperties {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Converts the properties into lapin's AMQP properties.
    pub(crate) fn to_amqp(&self) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        for (key, value) in &self.trace_headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        if self.retry_count > 0 {
            headers.insert(
                ShortString::from(AMQP_HEADERS_RETRY_COUNT),
                AMQPValue::LongInt(LongInt::try_from(self.retry_count).unwrap_or(LongInt::MAX)),
            );
        }

        let delivery_mode = if self.persistent {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(self.message_type.clone()))
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(headers))
    }

    /// Extracts the properties of an inbound AMQP message.
    ///
    /// A missing retry header means the message was never retried.
    pub(crate) fn from_amqp(props: &AMQPProperties) -> Self {
        let headers = match props.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };

        let retry_count = headers
            .inner()
            .get(AMQP_HEADERS_RETRY_COUNT)
            .and_then(header_as_count)
            .unwrap_or_default();

        let trace_headers = headers
            .inner()
            .iter()
            .filter(|(key, _)| key.as_str() != AMQP_HEADERS_RETRY_COUNT)
            .filter_map(|(key, value)| match value {
                AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                    .ok()
                    .map(|value| (key.to_string(), value.to_owned())),
                _ => None,
            })
            .collect();

        let message_type = match props.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        };

        MessageProperties {
            message_type,
            persistent: (*props.delivery_mode()).unwrap_or_default() == PERSISTENT_DELIVERY_MODE,
            retry_count,
            message_id: props.message_id().as_ref().map(|id| id.to_string()),
            trace_headers,
        }
    }
}

/// Reads a retry counter from whichever integer width the publisher used.
fn header_as_count(value: &AMQPValue) -> Option<u32> {
    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    u32::try_from(count.max(0)).ok()
}

/// One broker-delivered message awaiting a terminal disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            properties: MessageProperties::from_amqp(&delivery.properties),
            payload: delivery.data,
        }
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Target exchange; empty for the default exchange
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    /// Fans the payload out to every queue bound to the exchange.
    pub fn broadcast(exchange: &str, payload: Vec<u8>, properties: MessageProperties) -> Self {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: String::new(),
            mandatory: false,
            payload,
            properties,
        }
    }

    /// Routes the payload straight to the named queue through the default exchange.
    pub fn direct(queue: &str, payload: Vec<u8>, properties: MessageProperties) -> Self {
        OutboundMessage {
            exchange: String::new(),
            routing_key: queue.to_owned(),
            mandatory: true,
            payload,
            properties,
        }
    }
}
