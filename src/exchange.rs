// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the type used to describe the exchanges the runtime
//! declares. Every exchange is a fanout exchange: message types are broadcast to all
//! bound queues and dead letters reach the dead-letter queue whatever their key.

/// Definition of a fanout exchange with its declare parameters.
///
/// Definitions are built with chained setters:
///
/// ```ignore
/// let def = ExchangeDefinition::new("orders.OrderPlaced").durable();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) auto_delete: bool,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable fanout exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            auto_delete: false,
            durable: false,
        }
    }

    /// Deletes the exchange once the last queue is unbound from it.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}
