// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Abstraction
//!
//! The connection, channel and exchange primitives the publishing layers are
//! written against. The wire protocol lives entirely behind these traits; the
//! [`crate::amqp`] module implements them with lapin.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::ExchangeOptions,
    message::{Delivery, MessageProperties, ReturnNotification},
    queue::QueueOptions,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives messages the broker returned as unroutable.
///
/// Invoked from the broker client's delivery context: implementations must not
/// perform broker operations on the same connection and must not block.
pub type ReturnHandler = Arc<dyn Fn(ReturnNotification) + Send + Sync>;

/// Receives messages delivered to a consumer subscription.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Lifecycle state reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Open,
    Closed,
    Disconnected,
}

/// A broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    /// Whether the underlying transport is actually usable. May lag behind an
    /// `Open` status while the transport is still negotiating.
    fn transport_open(&self) -> bool;

    /// Whether the connection recovers by itself after a transport failure.
    fn automatically_recover(&self) -> bool;

    /// Whether another recovery attempt is currently allowed.
    fn should_retry_recovery(&self) -> bool;

    /// Negotiated heartbeat in seconds, if any.
    fn heartbeat(&self) -> Option<u16>;

    async fn start(&self) -> Result<(), AmqpError>;

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// A fresh, unstarted connection built from the same configuration.
    fn duplicate(&self) -> Arc<dyn Connection>;
}

/// A channel opened on a connection.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> u16;

    fn default_exchange(&self) -> Arc<dyn Exchange>;

    /// Declares (or fetches) the named exchange.
    async fn exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn Exchange>, AmqpError>;

    /// Declares a queue and returns its name. An empty name lets the broker
    /// pick one.
    async fn queue(&self, name: &str, options: &QueueOptions) -> Result<String, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Forgets a queue declared on this channel without touching the broker.
    fn deregister_queue(&self, queue: &str);

    /// Subscribes `handler` to every message delivered to `queue`.
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), AmqpError>;
}

/// An exchange resolved on a channel.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Publishes one message. `properties` is the caller's copy; the client may
    /// fill in defaults on it.
    async fn publish(
        &self,
        payload: &[u8],
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Registers the handler for messages the broker returns as unroutable.
    fn on_return(&self, handler: ReturnHandler);
}

/// Builds connections when the caller supplied none.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> Arc<dyn Connection>;
}
