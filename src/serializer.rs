// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! Converts typed payloads to bytes and back. The serializer is pluggable; the
//! runtime ships with a JSON implementation backed by `serde_json`.

use crate::errors::SerializationError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes and decodes message payloads.
///
/// Implementations must report malformed input as `SerializationError` so that the
/// configured serializer policies can tell it apart from handler and broker failures.
pub trait MessageSerializer: Clone + Send + Sync + 'static {
    /// Serializes the value into the bytes that travel as the message body.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    /// Deserializes a message body into the requested type.
    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, SerializationError>;
}

/// JSON serializer with compact output.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|err| SerializationError::Serialize(err.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(payload)
            .map_err(|err| SerializationError::Deserialize(err.to_string()))
    }
}
