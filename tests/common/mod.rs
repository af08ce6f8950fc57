// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits.
//!
//! Routing follows the broker rules the publishers rely on: the default
//! exchange routes by queue name, named exchanges route through bindings on
//! exact routing keys, and an unroutable mandatory message is handed back to
//! the exchange's return handler with `NO_ROUTE`. Messages routed to a queue
//! with a live consumer are delivered on a spawned task, otherwise they are
//! stored.
//!
//! Channels, exchanges and consumers belong to the connection session they were
//! opened in. Restarting a connection or failing a channel leaves them dead:
//! they answer with `ChannelAlreadyClosed` like a real broker client would.

#![allow(dead_code)]

use async_trait::async_trait;
use rabbitmq_publisher::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::{ExchangeOptions, DEFAULT_EXCHANGE},
    message::{Delivery, MessageProperties, ReturnNotification, NO_ROUTE, NO_ROUTE_CODE},
    queue::QueueOptions,
    transport::{
        Channel, Connection, ConnectionStatus, Connector, DeliveryHandler, Exchange,
        ReturnHandler,
    },
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// A message as the broker received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Vec<Published>>,
    bindings: Vec<(String, String, String)>,
    exchanges: HashSet<String>,
    consumers: HashMap<String, (DeliveryHandler, Option<Liveness>)>,
    ops: Vec<String>,
    published: Vec<Published>,
    channels_created: usize,
    connections_started: usize,
    publish_failures: VecDeque<AmqpError>,
    channel_failures: VecDeque<AmqpError>,
    return_reason: Option<(u16, String)>,
    generated_queues: usize,
}

/// Status of one connection, shared with the channels opened on it.
struct Session {
    status: Mutex<ConnectionStatus>,
    transport_open: AtomicBool,
    /// Bumped by every `start()`.
    generation: AtomicUsize,
}

impl Session {
    fn drop_transport(&self) {
        *self.status.lock().unwrap() = ConnectionStatus::Closed;
        self.transport_open.store(false, Ordering::SeqCst);
    }
}

/// Whether a channel, or anything opened on it, can still be used.
#[derive(Clone)]
struct Liveness {
    session: Arc<Session>,
    generation: usize,
    channel_open: Arc<AtomicBool>,
}

impl Liveness {
    fn is_alive(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
            && self.session.transport_open.load(Ordering::SeqCst)
            && self.session.generation.load(Ordering::SeqCst) == self.generation
    }

    fn check(&self) -> Result<(), AmqpError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(AmqpError::ChannelAlreadyClosed)
        }
    }

    /// What a failed broker call does to the channel and its connection.
    fn fail(&self, err: &AmqpError) {
        if *err == AmqpError::ChannelAlreadyClosed {
            self.channel_open.store(false, Ordering::SeqCst);
        } else if err.is_retriable() {
            self.session.drop_transport();
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// Behavior of a [`FakeConnection`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionBehavior {
    /// Whether `start()` makes the connection usable.
    pub ready_on_start: bool,
    pub automatically_recover: bool,
    pub heartbeat: Option<u16>,
}

impl Default for ConnectionBehavior {
    fn default() -> Self {
        ConnectionBehavior {
            ready_on_start: true,
            automatically_recover: true,
            heartbeat: Some(5),
        }
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> Arc<FakeConnection> {
        self.connection_with(ConnectionBehavior::default())
    }

    pub fn connection_with(&self, behavior: ConnectionBehavior) -> Arc<FakeConnection> {
        Arc::new(FakeConnection::new(self.clone(), behavior))
    }

    pub fn connector(&self) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    pub fn declare_queue(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(name.to_owned())
            .or_default();
    }

    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        self.state.lock().unwrap().bindings.push((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(name)
    }

    /// Messages stored in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<Published> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Every message the broker accepted, in order.
    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    /// Queue and exchange operations, e.g. `queue.declare foobar`.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        self.ops().iter().filter(|op| op.starts_with(prefix)).count()
    }

    pub fn channels_created(&self) -> usize {
        self.state.lock().unwrap().channels_created
    }

    pub fn connections_started(&self) -> usize {
        self.state.lock().unwrap().connections_started
    }

    /// Makes the next publish fail with `err` before it reaches any queue. A
    /// closed channel error kills the publishing channel, a transient one drops
    /// its connection.
    pub fn fail_next_publish(&self, err: AmqpError) {
        self.state.lock().unwrap().publish_failures.push_back(err);
    }

    /// Makes the next `create_channel` fail with `err`.
    pub fn fail_next_channel(&self, err: AmqpError) {
        self.state.lock().unwrap().channel_failures.push_back(err);
    }

    /// Returns unroutable mandatory messages with this reply instead of
    /// `NO_ROUTE`.
    pub fn return_with(&self, reply_code: u16, reply_text: &str) {
        self.state.lock().unwrap().return_reason = Some((reply_code, reply_text.to_owned()));
    }

    /// Answers every message on `queue` to its `reply_to` queue with the same
    /// correlation id.
    pub fn respond<F>(&self, queue: &str, reply: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.declare_queue(queue);

        let broker = self.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let Some(reply_to) = delivery.properties.reply_to.clone() else {
                return;
            };

            let mut properties = MessageProperties::default();
            properties.correlation_id = delivery.properties.correlation_id.clone();

            let response = Published {
                exchange: DEFAULT_EXCHANGE.to_owned(),
                routing_key: reply_to,
                mandatory: false,
                properties,
                payload: reply(&delivery.payload),
            };
            let _ = broker.route(response, None);
        });

        self.state
            .lock()
            .unwrap()
            .consumers
            .insert(queue.to_owned(), (handler, None));
    }

    fn record(&self, op: String) {
        self.state.lock().unwrap().ops.push(op);
    }

    fn route(&self, message: Published, returns: Option<ReturnHandler>) -> Result<(), AmqpError> {
        let (routed, deliveries, return_reason) = {
            let mut state = self.state.lock().unwrap();

            if let Some(err) = state.publish_failures.pop_front() {
                return Err(err);
            }
            state.published.push(message.clone());

            let targets: Vec<String> = if message.exchange == DEFAULT_EXCHANGE {
                state
                    .queues
                    .contains_key(&message.routing_key)
                    .then(|| vec![message.routing_key.clone()])
                    .unwrap_or_default()
            } else {
                state
                    .bindings
                    .iter()
                    .filter(|(_, exchange, key)| {
                        *exchange == message.exchange && *key == message.routing_key
                    })
                    .map(|(queue, _, _)| queue.clone())
                    .collect()
            };

            let mut deliveries = Vec::new();
            for queue in &targets {
                let consumer = state
                    .consumers
                    .get(queue)
                    .filter(|(_, liveness)| liveness.as_ref().map_or(true, Liveness::is_alive))
                    .map(|(consumer, _)| consumer.clone());

                match consumer {
                    Some(consumer) => deliveries.push(consumer),
                    None => state
                        .queues
                        .entry(queue.clone())
                        .or_default()
                        .push(message.clone()),
                }
            }

            let return_reason = state
                .return_reason
                .clone()
                .unwrap_or_else(|| (NO_ROUTE_CODE, NO_ROUTE.to_owned()));

            (!targets.is_empty(), deliveries, return_reason)
        };

        if !routed && message.mandatory {
            if let Some(returns) = returns {
                let (reply_code, reply_text) = return_reason;
                returns(ReturnNotification {
                    reply_code,
                    reply_text,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    properties: message.properties.clone(),
                    payload: message.payload.clone(),
                });
            }
        }

        for consumer in deliveries {
            let delivery = Delivery {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                payload: message.payload.clone(),
            };
            tokio::spawn(async move { consumer(delivery) });
        }

        Ok(())
    }
}

pub struct FakeConnector {
    broker: FakeBroker,
}

impl Connector for FakeConnector {
    fn connect(&self, _config: &ConnectionConfig) -> Arc<dyn Connection> {
        self.broker.connection()
    }
}

pub struct FakeConnection {
    broker: FakeBroker,
    behavior: ConnectionBehavior,
    session: Arc<Session>,
    channel_ids: AtomicU16,
}

impl FakeConnection {
    fn new(broker: FakeBroker, behavior: ConnectionBehavior) -> Self {
        FakeConnection {
            broker,
            behavior,
            session: Arc::new(Session {
                status: Mutex::new(ConnectionStatus::NotConnected),
                transport_open: AtomicBool::new(false),
                generation: AtomicUsize::new(0),
            }),
            channel_ids: AtomicU16::new(0),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.session.status.lock().unwrap() = status;
    }

    /// Simulates the broker dropping the connection.
    pub fn drop_transport(&self) {
        self.session.drop_transport();
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn status(&self) -> ConnectionStatus {
        *self.session.status.lock().unwrap()
    }

    fn transport_open(&self) -> bool {
        self.session.transport_open.load(Ordering::SeqCst)
    }

    fn automatically_recover(&self) -> bool {
        self.behavior.automatically_recover
    }

    fn should_retry_recovery(&self) -> bool {
        self.behavior.automatically_recover
    }

    fn heartbeat(&self) -> Option<u16> {
        self.behavior.heartbeat
    }

    async fn start(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().unwrap().connections_started += 1;
        self.session.generation.fetch_add(1, Ordering::SeqCst);

        if self.behavior.ready_on_start {
            self.set_status(ConnectionStatus::Open);
            self.session.transport_open.store(true, Ordering::SeqCst);
        } else {
            self.set_status(ConnectionStatus::Connecting);
        }

        Ok(())
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        if let Some(err) = self.broker.state.lock().unwrap().channel_failures.pop_front() {
            return Err(err);
        }

        if self.status() != ConnectionStatus::Open || !self.transport_open() {
            return Err(AmqpError::ConnectionClosed);
        }

        self.broker.state.lock().unwrap().channels_created += 1;
        let id = self.channel_ids.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            id,
            liveness: Liveness {
                session: self.session.clone(),
                generation: self.session.generation.load(Ordering::SeqCst),
                channel_open: Arc::new(AtomicBool::new(true)),
            },
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.session.drop_transport();
        Ok(())
    }

    fn duplicate(&self) -> Arc<dyn Connection> {
        Arc::new(FakeConnection::new(self.broker.clone(), self.behavior))
    }
}

pub struct FakeChannel {
    broker: FakeBroker,
    id: u16,
    liveness: Liveness,
}

impl FakeChannel {
    fn exchange_named(&self, name: &str) -> Arc<dyn Exchange> {
        Arc::new(FakeExchange {
            broker: self.broker.clone(),
            name: name.to_owned(),
            returns: Mutex::new(None),
            liveness: self.liveness.clone(),
        })
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn default_exchange(&self) -> Arc<dyn Exchange> {
        self.exchange_named(DEFAULT_EXCHANGE)
    }

    async fn exchange(
        &self,
        name: &str,
        _options: &ExchangeOptions,
    ) -> Result<Arc<dyn Exchange>, AmqpError> {
        self.liveness.check()?;
        self.broker.record(format!("exchange.declare {name}"));
        self.broker
            .state
            .lock()
            .unwrap()
            .exchanges
            .insert(name.to_owned());

        Ok(self.exchange_named(name))
    }

    async fn queue(&self, name: &str, _options: &QueueOptions) -> Result<String, AmqpError> {
        self.liveness.check()?;
        let name = if name.is_empty() {
            let mut state = self.broker.state.lock().unwrap();
            state.generated_queues += 1;
            format!("amq.gen-{}", state.generated_queues)
        } else {
            name.to_owned()
        };

        self.broker.record(format!("queue.declare {name}"));
        self.broker.declare_queue(&name);

        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.liveness.check()?;
        self.broker
            .record(format!("queue.bind {queue} {exchange} {routing_key}"));
        self.broker.bind(queue, exchange, routing_key);
        Ok(())
    }

    fn deregister_queue(&self, queue: &str) {
        self.broker.record(format!("queue.deregister {queue}"));
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), AmqpError> {
        self.liveness.check()?;
        self.broker.record(format!("basic.consume {queue}"));
        self.broker
            .state
            .lock()
            .unwrap()
            .consumers
            .insert(queue.to_owned(), (handler, Some(self.liveness.clone())));
        Ok(())
    }
}

pub struct FakeExchange {
    broker: FakeBroker,
    name: String,
    returns: Mutex<Option<ReturnHandler>>,
    liveness: Liveness,
}

#[async_trait]
impl Exchange for FakeExchange {
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
        self.liveness.check()?;
        let returns = self.returns.lock().unwrap().clone();

        self.broker
            .route(
                Published {
                    exchange: self.name.clone(),
                    routing_key: routing_key.to_owned(),
                    mandatory,
                    properties: properties.with_broker_defaults(),
                    payload: payload.to_vec(),
                },
                returns,
            )
            .map_err(|err| {
                self.liveness.fail(&err);
                err
            })
    }

    fn on_return(&self, handler: ReturnHandler) {
        *self.returns.lock().unwrap() = Some(handler);
    }
}
