// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! The envelope handed to a publish call, the property bag passed through to the
//! broker client, and the notifications the broker client produces
//! asynchronously: returned (unroutable) messages and consumer deliveries.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Reply text the broker uses when a mandatory message matched no queue.
pub const NO_ROUTE: &str = "NO_ROUTE";

/// Reply code the broker uses together with [`NO_ROUTE`].
pub const NO_ROUTE_CODE: u16 = 312;

/// Persistent delivery mode, assigned by the broker client when none is set.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A typed header or argument value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::LongInt(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

/// Message properties passed through to the broker client.
///
/// All fields are optional. The publishing layers only ever write
/// `correlation_id` and `reply_to`; everything else is the caller's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub app_id: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl MessageProperties {
    /// Sets the MIME type of the payload.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the delivery mode; 2 is persistent.
    pub fn with_delivery_mode(mut self, mode: u8) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    /// Sets the message priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the id tying a reply to its request.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the queue replies should be sent to.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Sets the application message id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Sets the message type property.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Adds an application header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Fills the defaults a broker client assigns to an outgoing message:
    /// persistent delivery mode and priority 0.
    pub fn with_broker_defaults(mut self) -> Self {
        self.delivery_mode.get_or_insert(PERSISTENT_DELIVERY_MODE);
        self.priority.get_or_insert(0);
        self
    }
}

/// One message to publish: payload, publish options and properties.
///
/// An envelope lives for the duration of a single publish call. Hooks see it by
/// reference; the broker client receives a copy of its properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub payload: Vec<u8>,
    pub routing_key: Option<String>,
    pub mandatory: bool,
    pub properties: MessageProperties,
}

impl MessageEnvelope {
    /// Creates a non-mandatory message without routing key.
    ///
    /// # Parameters
    /// * `payload` - Message body
    ///
    /// # Returns
    /// A new MessageEnvelope instance
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        MessageEnvelope {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Serializes `value` as the payload and marks the message as JSON.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, AmqpError> {
        let payload = serde_json::to_vec(value)?;
        Ok(MessageEnvelope::new(payload).content_type(JSON_CONTENT_TYPE))
    }

    /// Sets the routing key.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Asks the broker to return the message when no queue matches.
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Sets the MIME type of the payload.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Adds an application header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    /// Replaces all message properties.
    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// The routing key sent to the broker; absent keys publish with `""`.
    pub fn routing_key_or_default(&self) -> &str {
        self.routing_key.as_deref().unwrap_or_default()
    }
}

/// A mandatory message the broker could not route, handed back by the broker
/// client from its delivery context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnNotification {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

impl ReturnNotification {
    /// Whether the broker returned the message because no queue matched.
    pub fn is_no_route(&self) -> bool {
        self.reply_text == NO_ROUTE
    }
}

/// A message delivered to a consumer subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}
