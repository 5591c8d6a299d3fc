// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Environment Settings
//!
//! Loads broker coordinates and per-consumer tuning from environment variables.
//!
//! Broker variables:
//! - `RABBITMQ_URL` - full AMQP URI; when set, the other broker variables are ignored
//! - `RABBITMQ_HOST` (required without `RABBITMQ_URL`)
//! - `RABBITMQ_PORT` (default `5672`)
//! - `RABBITMQ_USER` / `RABBITMQ_PASSWORD` (default `guest` / `guest`)
//! - `RABBITMQ_VHOST` (default `/`)
//! - `MESSAGING_CONNECTION_POOL_SIZE` (optional)
//!
//! Consumer variables are prefixed with `MESSAGING_<CONSUMER>_`, where `<CONSUMER>`
//! is the consumer name upper-cased with every other character replaced by `_`:
//! `QUEUE`, `MESSAGE_TTL_MS`, `MAX_MESSAGE_COUNT`, `MAX_CONCURRENCY`,
//! `MAX_RETRY_COUNT` and `RETRY_DELAY_MS`.

use crate::errors::MessagingError;
use std::{env, str::FromStr};

const DEFAULT_PORT: u16 = 5672;
const DEFAULT_USER: &str = "guest";
const DEFAULT_PASSWORD: &str = "guest";
const DEFAULT_VHOST: &str = "/";

/// Broker-level settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingSettings {
    pub connection_string: String,
    pub connection_pool_size: Option<usize>,
}

impl MessagingSettings {
    /// Reads `RABBITMQ_URL`, or builds the URL from the `RABBITMQ_HOST` family of
    /// variables, plus the optional pool size.
    ///
    /// # Returns
    /// The settings, or `MessagingError::Configuration` when no host is set or a
    /// value does not parse
    pub fn from_env() -> Result<MessagingSettings, MessagingError> {
        let connection_string = match env::var("RABBITMQ_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => {
                let host = env_required("RABBITMQ_HOST")?;
                let port = env_parse("RABBITMQ_PORT")?.unwrap_or(DEFAULT_PORT);
                let user = env::var("RABBITMQ_USER").unwrap_or_else(|_| DEFAULT_USER.to_owned());
                let password =
                    env::var("RABBITMQ_PASSWORD").unwrap_or_else(|_| DEFAULT_PASSWORD.to_owned());
                let vhost =
                    env::var("RABBITMQ_VHOST").unwrap_or_else(|_| DEFAULT_VHOST.to_owned());

                format!(
                    "amqp://{}:{}@{}:{}/{}",
                    user,
                    password,
                    host,
                    port,
                    encode_vhost(&vhost)
                )
            }
        };

        Ok(MessagingSettings {
            connection_string,
            connection_pool_size: env_parse("MESSAGING_CONNECTION_POOL_SIZE")?,
        })
    }
}

/// Per-consumer overrides read from the environment; absent variables keep the
/// builder's values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub queue: Option<String>,
    pub message_ttl_ms: Option<u64>,
    pub max_message_count: Option<u32>,
    pub max_concurrency: Option<u16>,
    pub max_retry_count: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

impl ConsumerSettings {
    /// Reads the overrides of one consumer; unset variables stay `None`.
    ///
    /// # Parameters
    /// * `consumer_name` - Consumer whose variables are read
    pub fn from_env(consumer_name: &str) -> Result<ConsumerSettings, MessagingError> {
        let prefix = consumer_prefix(consumer_name);
        let key = |suffix: &str| format!("{prefix}_{suffix}");

        Ok(ConsumerSettings {
            queue: env::var(key("QUEUE")).ok().filter(|q| !q.trim().is_empty()),
            message_ttl_ms: env_parse(&key("MESSAGE_TTL_MS"))?,
            max_message_count: env_parse(&key("MAX_MESSAGE_COUNT"))?,
            max_concurrency: env_parse(&key("MAX_CONCURRENCY"))?,
            max_retry_count: env_parse(&key("MAX_RETRY_COUNT"))?,
            retry_delay_ms: env_parse(&key("RETRY_DELAY_MS"))?,
        })
    }
}

fn consumer_prefix(consumer_name: &str) -> String {
    let normalized: String = consumer_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();

    format!("MESSAGING_{normalized}")
}

fn env_required(key: &str) -> Result<String, MessagingError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(MessagingError::Configuration(format!(
            "missing environment variable `{key}`"
        ))),
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, MessagingError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|err| {
            MessagingError::Configuration(format!("invalid value for `{key}`: {err}"))
        }),
        Err(_) => Ok(None),
    }
}

// The default vhost `/` must be percent-encoded in an AMQP URI.
fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2f")
}
