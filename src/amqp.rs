// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Client
//!
//! Implements the [`crate::transport`] traits on top of lapin.
//!
//! - Connections are built lazily: `start()` performs the actual
//!   `Connection::connect`, and starting a closed connection again is how a
//!   recovery happens, bounded by `recovery_attempts`.
//! - Every channel runs in confirm mode, so a `basic.return` for a mandatory
//!   message surfaces with its publisher confirm and is handed to the exchange's
//!   return handler.
//! - Reply subscriptions consume on a spawned task, one consumer span per
//!   delivery.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::{ExchangeOptions, DEFAULT_EXCHANGE},
    message::{Delivery, HeaderValue, MessageProperties, ReturnNotification},
    otel,
    queue::QueueOptions,
    transport::{
        Channel, Connection, ConnectionStatus, Connector, DeliveryHandler, Exchange,
        ReturnHandler,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::BasicReturnMessage,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ConnectionProperties, ConnectionState,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Reply code sent when this side closes a connection.
const CLOSE_REPLY_CODE: u16 = 200;

/// Builds [`AmqpConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

impl Connector for AmqpConnector {
    fn connect(&self, config: &ConnectionConfig) -> Arc<dyn Connection> {
        Arc::new(AmqpConnection::new(config.clone()))
    }
}

/// A lazily started lapin connection.
pub struct AmqpConnection {
    config: ConnectionConfig,
    inner: Mutex<Option<Arc<lapin::Connection>>>,
    closed: AtomicBool,
    recoveries: AtomicU32,
}

impl AmqpConnection {
    /// Creates a connection that dials the broker on `start()`.
    ///
    /// # Parameters
    /// * `config` - Broker address, credentials and heartbeat
    ///
    /// # Returns
    /// A connection in the `NotConnected` state
    pub fn new(config: ConnectionConfig) -> Self {
        AmqpConnection {
            config,
            inner: Mutex::new(None),
            closed: AtomicBool::new(false),
            recoveries: AtomicU32::new(0),
        }
    }

    fn current(&self) -> Option<Arc<lapin::Connection>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    fn status(&self) -> ConnectionStatus {
        match self.current() {
            None if self.closed.load(Ordering::SeqCst) => ConnectionStatus::Closed,
            None => ConnectionStatus::NotConnected,
            Some(conn) => match conn.status().state() {
                ConnectionState::Initial | ConnectionState::Connecting => {
                    ConnectionStatus::Connecting
                }
                ConnectionState::Connected => ConnectionStatus::Open,
                // lapin never recovers on its own: a failed connection is
                // restarted by the next `start()`.
                _ => ConnectionStatus::Closed,
            },
        }
    }

    fn transport_open(&self) -> bool {
        self.current()
            .map_or(false, |conn| conn.status().connected())
    }

    fn automatically_recover(&self) -> bool {
        self.config.automatically_recover && !self.closed.load(Ordering::SeqCst)
    }

    fn should_retry_recovery(&self) -> bool {
        self.config
            .recovery_attempts
            .map_or(true, |max| self.recoveries.load(Ordering::SeqCst) < max)
    }

    fn heartbeat(&self) -> Option<u16> {
        self.current()
            .map(|conn| conn.configuration().heartbeat())
            .filter(|heartbeat| *heartbeat > 0)
            .or(self.config.heartbeat)
    }

    async fn start(&self) -> Result<(), AmqpError> {
        if self.status() == ConnectionStatus::Open {
            return Ok(());
        }

        if self.current().is_some() {
            if !self.automatically_recover() || !self.should_retry_recovery() {
                return Err(AmqpError::ConnectionClosed);
            }

            let attempt = self.recoveries.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(attempt, "recovering amqp connection");
        }

        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.config.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match lapin::Connection::connect(&self.config.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        self.recoveries.store(0, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(conn));

        Ok(())
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        let conn = self.current().ok_or(AmqpError::ConnectionClosed)?;

        debug!("creating amqp channel...");
        let channel = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            classify(err, |e| AmqpError::ChannelError(e.to_string()))
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                classify(err, |e| AmqpError::ChannelError(e.to_string()))
            })?;
        debug!(id = channel.id(), "channel created");

        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        let conn = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(conn) = conn {
            debug!("closing amqp connection");
            conn.close(CLOSE_REPLY_CODE, "Goodbye")
                .await
                .map_err(AmqpError::from)?;
        }

        Ok(())
    }

    fn duplicate(&self) -> Arc<dyn Connection> {
        Arc::new(AmqpConnection::new(self.config.clone()))
    }
}

/// A lapin channel in confirm mode.
pub struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn default_exchange(&self) -> Arc<dyn Exchange> {
        Arc::new(AmqpExchange::new(self.inner.clone(), DEFAULT_EXCHANGE))
    }

    async fn exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn Exchange>, AmqpError> {
        debug!("creating exchange: {}", name);

        self.inner
            .exchange_declare(
                name,
                (&options.kind).into(),
                ExchangeDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: options.no_wait,
                },
                FieldTable::from(amqp_table(&options.arguments)),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                classify(err, |_| AmqpError::DeclareExchangeError(name.to_owned()))
            })?;

        Ok(Arc::new(AmqpExchange::new(self.inner.clone(), name)))
    }

    async fn queue(&self, name: &str, options: &QueueOptions) -> Result<String, AmqpError> {
        debug!("creating queue: {}", name);

        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                },
                FieldTable::from(amqp_table(&options.declare_arguments())),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                classify(err, |_| AmqpError::DeclareQueueError(name.to_owned()))
            })?;

        let declared = queue.name().to_string();
        debug!("queue: {} was created", declared);

        Ok(declared)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                classify(err, |_| {
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
                })
            })
    }

    fn deregister_queue(&self, queue: &str) {
        // lapin keeps no per-channel queue registry.
        debug!(queue = queue, "queue released from publisher channel");
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), AmqpError> {
        let tag = format!("reply-{}", Uuid::new_v4());

        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        let queue = queue.to_owned();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let _span = otel::delivery_span(&delivery.properties, &queue);
                        handler(Delivery {
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            properties: message_properties(&delivery.properties),
                            payload: delivery.data.clone(),
                        });
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            debug!(queue = queue, "consumer stream ended");
        });

        Ok(())
    }
}

/// An exchange bound to a lapin channel.
pub struct AmqpExchange {
    channel: lapin::Channel,
    name: String,
    return_handler: Mutex<Option<ReturnHandler>>,
}

impl AmqpExchange {
    fn new(channel: lapin::Channel, name: &str) -> Self {
        AmqpExchange {
            channel,
            name: name.to_owned(),
            return_handler: Mutex::new(None),
        }
    }

    fn dispatch_return(&self, returned: &BasicReturnMessage) {
        let handler = self
            .return_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let notification = ReturnNotification {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.to_string(),
            exchange: returned.delivery.exchange.to_string(),
            routing_key: returned.delivery.routing_key.to_string(),
            properties: message_properties(&returned.delivery.properties),
            payload: returned.delivery.data.clone(),
        };

        match handler {
            Some(handler) => handler(notification),
            None => warn!(
                exchange = notification.exchange,
                routing_key = notification.routing_key,
                "returned message dropped, no return handler registered"
            ),
        }
    }
}

#[async_trait]
impl Exchange for AmqpExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        payload: &[u8],
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut properties = properties.with_broker_defaults();
        properties
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());

        let confirm = self
            .channel
            .basic_publish(
                &self.name,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::from(err)
            })?;

        match confirm.await.map_err(AmqpError::from)? {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                self.dispatch_return(&returned);
                Ok(())
            }
            Confirmation::Nack(None) => Err(AmqpError::PublishingError(
                "message nacked by the broker".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    fn on_return(&self, handler: ReturnHandler) {
        *self
            .return_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

/// Keeps the transport classification of a lapin error (stale channel,
/// transient connection fault) and otherwise reports `fallback`.
fn classify(err: lapin::Error, fallback: impl FnOnce(&lapin::Error) -> AmqpError) -> AmqpError {
    let fallback = fallback(&err);
    match AmqpError::from(err) {
        e @ AmqpError::ChannelAlreadyClosed => e,
        e if e.is_retriable() => e,
        _ => fallback,
    }
}

fn amqp_table(values: &BTreeMap<String, HeaderValue>) -> BTreeMap<ShortString, AMQPValue> {
    values
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect()
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.clone())),
        HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::ShortInt(*v),
        HeaderValue::LongInt(v) => AMQPValue::LongInt(*v),
        HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Uint(v) => AMQPValue::ShortUInt(*v),
        HeaderValue::LongUint(v) => AMQPValue::LongUInt(*v),
    }
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::ShortString(v) => Some(HeaderValue::ShortString(v.to_string())),
        AMQPValue::LongString(v) => Some(HeaderValue::LongString(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::LongInt(v) => Some(HeaderValue::LongInt(*v)),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::LongLongInt(*v)),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Uint(*v)),
        AMQPValue::LongUInt(v) => Some(HeaderValue::LongUint(*v)),
        _ => None,
    }
}

fn basic_properties(props: MessageProperties) -> BasicProperties {
    let mut headers = amqp_table(&props.headers);
    otel::inject_current_context(&mut headers);

    let mut basic = BasicProperties::default().with_headers(FieldTable::from(headers));

    if let Some(v) = props.content_type {
        basic = basic.with_content_type(ShortString::from(v));
    }
    if let Some(v) = props.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(v));
    }
    if let Some(v) = props.delivery_mode {
        basic = basic.with_delivery_mode(v);
    }
    if let Some(v) = props.priority {
        basic = basic.with_priority(v);
    }
    if let Some(v) = props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(v));
    }
    if let Some(v) = props.reply_to {
        basic = basic.with_reply_to(ShortString::from(v));
    }
    if let Some(v) = props.expiration {
        basic = basic.with_expiration(ShortString::from(v));
    }
    if let Some(v) = props.message_id {
        basic = basic.with_message_id(ShortString::from(v));
    }
    if let Some(v) = props.kind {
        basic = basic.with_kind(ShortString::from(v));
    }
    if let Some(v) = props.app_id {
        basic = basic.with_app_id(ShortString::from(v));
    }

    basic
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(ToString::to_string);

    MessageProperties {
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        expiration: text(props.expiration()),
        message_id: text(props.message_id()),
        kind: text(props.kind()),
        app_id: text(props.app_id()),
        headers: props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(key, value)| header_value(value).map(|v| (key.to_string(), v)))
                    .collect()
            })
            .unwrap_or_default(),
    }
}
