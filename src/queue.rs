// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options
//!
//! Declare options for the queues this crate creates on its own: the queue a
//! returned message is republished into, and the exclusive RPC reply queue.

use crate::{errors::AmqpError, message::HeaderValue};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declare options of a queue.
///
/// The defaults match a plain broker declaration: non-durable, non-exclusive,
/// not auto-deleted, no extra arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
    pub no_wait: bool,
    pub ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl QueueOptions {
    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a declare argument; it wins over a derived one with the same key.
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// All declare arguments, the explicit ones merged with the `x-` arguments
    /// derived from ttl and length limits.
    pub fn declare_arguments(&self) -> BTreeMap<String, HeaderValue> {
        let mut args = self.arguments.clone();

        if let Some(ttl) = self.ttl {
            args.insert(
                AMQP_HEADERS_MESSAGE_TTL.to_owned(),
                HeaderValue::LongInt(ttl),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::LongInt(max));
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::LongInt(max_bytes),
            );
        }

        args
    }
}

/// The queue a returned message is republished into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepublishQueueSpec {
    pub name: String,
    pub options: QueueOptions,
}

impl RepublishQueueSpec {
    /// Resolves the queue name from the configured name, falling back to the
    /// routing key of the returned message.
    ///
    /// Fails with `CannotCreateQueue` when neither is available, before any
    /// broker interaction takes place.
    pub fn resolve(
        configured: Option<&str>,
        routing_key: &str,
        options: &QueueOptions,
    ) -> Result<Self, AmqpError> {
        let name = configured
            .filter(|name| !name.is_empty())
            .or(Some(routing_key).filter(|key| !key.is_empty()))
            .ok_or(AmqpError::CannotCreateQueue)?;

        Ok(RepublishQueueSpec {
            name: name.to_owned(),
            options: options.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_queue_name_wins_over_routing_key() {
        let spec = RepublishQueueSpec::resolve(Some("baz"), "foobar", &QueueOptions::default())
            .unwrap();

        assert_eq!(spec.name, "baz");
    }

    #[test]
    fn routing_key_names_the_queue_when_none_is_configured() {
        let options = QueueOptions::default().durable();
        let spec = RepublishQueueSpec::resolve(None, "foobar", &options).unwrap();

        assert_eq!(spec.name, "foobar");
        assert!(spec.options.durable);
    }

    #[test]
    fn no_name_and_no_routing_key_cannot_create_queue() {
        assert_eq!(
            RepublishQueueSpec::resolve(None, "", &QueueOptions::default()),
            Err(AmqpError::CannotCreateQueue)
        );
        assert_eq!(
            RepublishQueueSpec::resolve(Some(""), "", &QueueOptions::default()),
            Err(AmqpError::CannotCreateQueue)
        );
    }

    #[test]
    fn limits_become_declare_arguments() {
        let args = QueueOptions::default()
            .ttl(1000)
            .max_length(10)
            .argument("x-something", "custom")
            .declare_arguments();

        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&HeaderValue::LongInt(1000)));
        assert_eq!(args.get(AMQP_HEADERS_MAX_LENGTH), Some(&HeaderValue::LongInt(10)));
        assert_eq!(
            args.get("x-something"),
            Some(&HeaderValue::LongString("custom".to_owned()))
        );
        assert!(!args.contains_key(AMQP_HEADERS_MAX_LENGTH_BYTES));
    }
}
