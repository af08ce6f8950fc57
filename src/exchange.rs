// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Options
//!
//! Exchange kinds and the declare options a publisher uses when it resolves a
//! named exchange. An absent or empty exchange name always resolves to the
//! broker's default exchange, which needs no declaration.

use crate::message::HeaderValue;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Name of the broker's default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Whether `name` designates the broker's default exchange.
pub fn is_default_exchange(name: Option<&str>) -> bool {
    name.map_or(true, str::is_empty)
}

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Declare options for a named exchange.
///
/// Built with chained setters; the default is a non-durable direct exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl ExchangeOptions {
    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - How the exchange routes messages to bound queues
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Routes on exact routing keys.
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Routes to every bound queue.
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Routes on routing key patterns.
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed exchange routing like `inner` once the delay expires.
    ///
    /// This requires the x-delayed-message plugin to be installed on the broker.
    pub fn delayed(mut self, inner: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::LongString(inner.to_owned()),
        );
        self
    }

    /// Adds a declare argument.
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the exchange once no queue is bound to it anymore.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Only checks that the exchange exists, never creates it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Accepts messages from other exchanges only.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Declares without waiting for the broker's confirmation.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}
