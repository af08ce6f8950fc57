// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! The base publisher: one mutex-guarded publish pipeline per instance.
//!
//! A publish runs, under the publisher's mutex:
//!
//! 1. the `before` publish hooks
//! 2. [`ConnectionManager::ensure_ready`]
//! 3. the `around` publish hooks wrapping the actual send
//! 4. the `after` publish hooks
//!
//! Both step 2 and the send recover the same way: a closed channel is dropped
//! and rebuilt, a transient transport error on a recovering connection drops
//! the channel too, and the step is retried once. Every other error reaches the
//! caller unchanged.
//!
//! The layered publishers ([`crate::mandatory::MandatoryPublisher`],
//! [`crate::rpc::RpcPublisher`]) implement the same [`Publish`] trait and
//! forward to the publisher they wrap.

use crate::{
    amqp::AmqpConnector,
    callbacks::{Callbacks, Next},
    config::{ConnectionConfig, PublisherConfig},
    connection::ConnectionManager,
    errors::AmqpError,
    exchange::ExchangeOptions,
    message::{MessageEnvelope, ReturnNotification},
    queue::{QueueOptions, RepublishQueueSpec},
    transport::{Channel, Connection, Connector, DeliveryHandler, Exchange, ReturnHandler},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Event name of the publish hooks.
pub const PUBLISH_EVENT: &str = "publish";

/// The publish contract shared by every publisher layer.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), AmqpError>;

    /// Closes the connections owned by this layer and the layers below.
    async fn close(&self) -> Result<(), AmqpError>;

    /// The base publisher at the bottom of the layer stack.
    fn base(&self) -> &Publisher;
}

#[async_trait]
impl<P: Publish + ?Sized> Publish for Arc<P> {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), AmqpError> {
        (**self).publish(envelope).await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        (**self).close().await
    }

    fn base(&self) -> &Publisher {
        (**self).base()
    }
}

/// Publishes messages to one exchange over a lazily created connection.
///
/// Publishes on one instance are strictly serialized: the connection, channel
/// and exchange are only touched while the publish mutex is held.
pub struct Publisher {
    manager: Mutex<ConnectionManager>,
    callbacks: Callbacks<MessageEnvelope, ()>,
}

/// A subscribed reply queue and the channel generation it was declared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyQueue {
    pub(crate) name: String,
    pub(crate) generation: u64,
}

impl Publisher {
    /// Starts a [`PublisherBuilder`].
    pub fn builder() -> PublisherBuilder {
        PublisherBuilder::new()
    }

    /// Creates a publisher from loaded settings, connecting through lapin.
    ///
    /// # Parameters
    /// * `config` - Connection and exchange settings
    ///
    /// # Returns
    /// A publisher that connects on its first publish
    pub fn from_config(config: PublisherConfig) -> Publisher {
        PublisherBuilder::new().config(config).build()
    }

    /// The publish hooks.
    pub fn callbacks(&self) -> &Callbacks<MessageEnvelope, ()> {
        &self.callbacks
    }

    /// The connection, `None` until the first publish builds one.
    pub async fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.manager.lock().await.current_connection()
    }

    /// The channel in use, `None` before the first publish or after close.
    pub async fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.manager.lock().await.channel()
    }

    /// The exchange in use, `None` before the first publish or after close.
    pub async fn exchange(&self) -> Option<Arc<dyn Exchange>> {
        self.manager.lock().await.exchange()
    }

    /// Publishes `envelope` with `callbacks` wrapped around the send, each hook
    /// seeing `args`.
    pub async fn publish_with<A>(
        &self,
        callbacks: &Callbacks<A, ()>,
        args: &A,
        envelope: &MessageEnvelope,
    ) -> Result<(), AmqpError>
    where
        A: Send + Sync + 'static,
    {
        let mut manager = self.manager.lock().await;
        publish_locked(&mut manager, callbacks, args, envelope).await
    }

    /// Republishes a returned message into the queue described by `queue`.
    ///
    /// Declares the queue, binds it to the exchange with the original routing
    /// key (on the default exchange the queue name becomes the routing key),
    /// releases it from the publisher channel and publishes `envelope` through
    /// the republish hooks, all under one hold of the publish mutex.
    pub(crate) async fn republish(
        &self,
        callbacks: &Callbacks<ReturnNotification, ()>,
        returned: &ReturnNotification,
        queue: &RepublishQueueSpec,
        envelope: MessageEnvelope,
    ) -> Result<(), AmqpError> {
        let mut manager = self.manager.lock().await;

        ensure_ready_with_recovery(&mut manager).await?;
        let channel = manager.channel().ok_or(AmqpError::ChannelAlreadyClosed)?;

        let declared = channel.queue(&queue.name, &queue.options).await?;
        let routing_key = if manager.uses_default_exchange() {
            declared.clone()
        } else {
            channel
                .queue_bind(&declared, manager.exchange_name(), &returned.routing_key)
                .await?;
            returned.routing_key.clone()
        };
        channel.deregister_queue(&declared);

        let envelope = envelope.routing_key(routing_key);
        publish_locked(&mut manager, callbacks, returned, &envelope).await
    }

    /// Returns a reply queue subscribed on the current channel.
    ///
    /// `current` is kept while the channel it was declared on is still the
    /// publisher's channel. Otherwise the exclusive queue and its consumer went
    /// away with the old channel, so a new broker-named queue is declared and
    /// `handler` subscribed to it.
    ///
    /// # Parameters
    /// * `handler` - Receives every delivery to the reply queue
    /// * `current` - The reply queue handed out last time, if any
    ///
    /// # Returns
    /// The reply queue valid for the next request
    pub(crate) async fn subscribe_reply_queue(
        &self,
        handler: DeliveryHandler,
        current: Option<&ReplyQueue>,
    ) -> Result<ReplyQueue, AmqpError> {
        let mut manager = self.manager.lock().await;

        ensure_ready_with_recovery(&mut manager).await?;
        let generation = manager.channel_generation();

        if let Some(current) = current.filter(|queue| queue.generation == generation) {
            return Ok(current.clone());
        }

        let channel = manager.channel().ok_or(AmqpError::ChannelAlreadyClosed)?;
        let name = channel
            .queue("", &QueueOptions::default().exclusive())
            .await?;
        channel.consume(&name, handler).await?;
        debug!(queue = name, generation, "reply queue subscribed");

        Ok(ReplyQueue { name, generation })
    }

    /// A publisher for the same exchange on `connection`, or on a duplicate of
    /// this publisher's connection.
    pub(crate) async fn republisher(&self, connection: Option<Arc<dyn Connection>>) -> Publisher {
        let mut manager = self.manager.lock().await;
        let connection = connection.unwrap_or_else(|| manager.connection().duplicate());

        Publisher {
            manager: Mutex::new(manager.fork(connection)),
            callbacks: Callbacks::new(PUBLISH_EVENT),
        }
    }
}

#[async_trait]
impl Publish for Publisher {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), AmqpError> {
        self.publish_with(&self.callbacks, &envelope, &envelope)
            .await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.manager.lock().await.close().await
    }

    fn base(&self) -> &Publisher {
        self
    }
}

async fn publish_locked<A>(
    manager: &mut ConnectionManager,
    callbacks: &Callbacks<A, ()>,
    args: &A,
    envelope: &MessageEnvelope,
) -> Result<(), AmqpError>
where
    A: Send + Sync + 'static,
{
    callbacks.run_before(args)?;
    ensure_ready_with_recovery(manager).await?;

    callbacks
        .run_around(args, move || Box::pin(send_with_recovery(manager, envelope)))
        .await?;

    callbacks.run_after(args, &())
}

/// Decides whether a failed broker step is worth one more attempt, dropping the
/// cached channel when it is. Returns the error when it is not.
fn prepare_retry(manager: &mut ConnectionManager, err: AmqpError) -> Result<(), AmqpError> {
    match err {
        AmqpError::ChannelAlreadyClosed => {
            debug!("channel already closed, rebuilding it");
            manager.forget_channel();
            Ok(())
        }
        err if err.is_retriable() && manager.can_recover() => {
            warn!(error = err.to_string(), "retrying after connection recovery");
            manager.forget_channel();
            Ok(())
        }
        err => {
            error!(error = err.to_string(), "error publishing message");
            Err(err)
        }
    }
}

async fn ensure_ready_with_recovery(
    manager: &mut ConnectionManager,
) -> Result<Arc<dyn Exchange>, AmqpError> {
    match manager.ensure_ready().await {
        Ok(exchange) => Ok(exchange),
        Err(err) => {
            prepare_retry(manager, err)?;
            manager.ensure_ready().await.map_err(|err| {
                error!(error = err.to_string(), "connection not ready after retry");
                err
            })
        }
    }
}

async fn send_with_recovery(
    manager: &mut ConnectionManager,
    envelope: &MessageEnvelope,
) -> Result<(), AmqpError> {
    match send(manager, envelope).await {
        Ok(()) => Ok(()),
        Err(err) => {
            prepare_retry(manager, err)?;
            send(manager, envelope).await.map_err(|err| {
                error!(error = err.to_string(), "publish failed after retry");
                err
            })
        }
    }
}

async fn send(manager: &mut ConnectionManager, envelope: &MessageEnvelope) -> Result<(), AmqpError> {
    let exchange = manager.ensure_ready().await?;

    exchange
        .publish(
            &envelope.payload,
            envelope.routing_key_or_default(),
            envelope.mandatory,
            envelope.properties.clone(),
        )
        .await
}

/// Builds a [`Publisher`].
///
/// ```
/// use rabbitmq_publisher::publisher::Publisher;
///
/// let publisher = Publisher::builder()
///     .exchange("events")
///     .before_publish(|envelope| {
///         println!("publishing to {:?}", envelope.routing_key);
///         Ok(())
///     })
///     .build();
/// ```
pub struct PublisherBuilder {
    config: PublisherConfig,
    connection: Option<Arc<dyn Connection>>,
    publish_connection: Option<Arc<dyn Connection>>,
    connector: Option<Arc<dyn Connector>>,
    callbacks: Callbacks<MessageEnvelope, ()>,
    return_handler: Option<ReturnHandler>,
}

impl Default for PublisherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PublisherBuilder {
    /// Creates a builder for the default exchange, connecting through lapin.
    pub fn new() -> Self {
        PublisherBuilder {
            config: PublisherConfig::default(),
            connection: None,
            publish_connection: None,
            connector: None,
            callbacks: Callbacks::new(PUBLISH_EVENT),
            return_handler: None,
        }
    }

    /// Replaces connection and exchange settings at once.
    ///
    /// # Parameters
    /// * `config` - Settings, e.g. from [`PublisherConfig::from_json`]
    ///
    /// # Returns
    /// Self for method chaining
    pub fn config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the connection settings only.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Sets the exchange to publish to; `""` selects the default exchange.
    ///
    /// # Parameters
    /// * `name` - Exchange name, declared on the first publish
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, name: impl Into<String>) -> Self {
        self.config.exchange = Some(name.into());
        self
    }

    /// Declare options of a named exchange.
    pub fn exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.config.exchange_options = options;
        self
    }

    /// An externally owned connection, possibly shared with consumers.
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// A connection dedicated to publishing. Takes precedence over
    /// [`PublisherBuilder::connection`].
    pub fn publish_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.publish_connection = Some(connection);
        self
    }

    /// Builds the connection when none is supplied. Defaults to lapin.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Adds a hook run before every publish. An error skips the publish.
    pub fn before_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MessageEnvelope) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.callbacks.push_before(Arc::new(hook), None);
        self
    }

    /// Adds a hook wrapped around the send; it decides whether to call
    /// [`Next::run`].
    ///
    /// # Parameters
    /// * `hook` - Receives the envelope and the rest of the chain
    ///
    /// # Returns
    /// Self for method chaining
    pub fn around_publish<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(
                &'a MessageEnvelope,
                Next<'a, ()>,
            ) -> BoxFuture<'a, Result<(), AmqpError>>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.push_around(Arc::new(hook), None);
        self
    }

    /// Adds a hook run after a successful send.
    pub fn after_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MessageEnvelope, &()) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.callbacks.push_after(Arc::new(hook), None);
        self
    }

    /// Replaces the publish hooks, e.g. with filtered ones.
    pub fn callbacks(mut self, callbacks: Callbacks<MessageEnvelope, ()>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Handler for messages the broker returns as unroutable.
    pub(crate) fn return_handler(mut self, handler: ReturnHandler) -> Self {
        self.return_handler = Some(handler);
        self
    }

    /// Builds the publisher. Nothing touches the broker until the first publish.
    pub fn build(self) -> Publisher {
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(AmqpConnector),
        };

        let mut manager = ConnectionManager::new(self.config.connection, connector)
            .with_exchange(self.config.exchange, self.config.exchange_options);

        if let Some(connection) = self.publish_connection.or(self.connection) {
            manager = manager.with_connection(connection);
        }

        if let Some(handler) = self.return_handler {
            manager = manager.with_return_handler(handler);
        }

        Publisher {
            manager: Mutex::new(manager),
            callbacks: self.callbacks,
        }
    }
}
