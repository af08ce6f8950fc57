// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the lazily created connection, channel and exchange of one publisher.
//!
//! [`ConnectionManager::ensure_ready`] is called before every publish:
//!
//! - builds the connection through the [`Connector`] when none was supplied
//! - starts it when it is not connected yet (or was closed)
//! - waits, bounded, until the connection is open *and* its transport is usable
//! - creates and caches the channel and exchange
//!
//! The manager is not synchronized itself; callers keep it behind the publish
//! mutex.

use crate::{
    config::ConnectionConfig,
    errors::AmqpError,
    exchange::{is_default_exchange, ExchangeOptions, DEFAULT_EXCHANGE},
    transport::{Channel, Connection, ConnectionStatus, Connector, Exchange, ReturnHandler},
};
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::debug;

/// Heartbeat assumed when the connection reports none, in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;

/// Lower bound applied to the heartbeat, in seconds.
pub const MIN_HEARTBEAT_SECS: u64 = 5;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lazily built connection, channel and exchange of a publisher.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    exchange_name: Option<String>,
    exchange_options: ExchangeOptions,
    return_handler: Option<ReturnHandler>,
    connection: Option<Arc<dyn Connection>>,
    channel: Option<Arc<dyn Channel>>,
    exchange: Option<Arc<dyn Exchange>>,
    channel_generation: u64,
}

impl ConnectionManager {
    /// Creates a manager that builds its connection on first use.
    ///
    /// # Parameters
    /// * `config` - Settings handed to the connector
    /// * `connector` - Builds the connection when none was supplied
    ///
    /// # Returns
    /// A manager publishing to the default exchange
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        ConnectionManager {
            config,
            connector,
            exchange_name: None,
            exchange_options: ExchangeOptions::default(),
            return_handler: None,
            connection: None,
            channel: None,
            exchange: None,
            channel_generation: 0,
        }
    }

    /// Uses an externally supplied connection instead of building one.
    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Publishes to `name`; `None` or `""` selects the default exchange.
    ///
    /// # Parameters
    /// * `name` - Exchange name, declared on first use
    /// * `options` - Declare options of a named exchange
    pub fn with_exchange(mut self, name: Option<String>, options: ExchangeOptions) -> Self {
        self.exchange_name = name;
        self.exchange_options = options;
        self
    }

    /// Handler attached to every exchange this manager builds.
    pub fn with_return_handler(mut self, handler: ReturnHandler) -> Self {
        self.return_handler = Some(handler);
        self
    }

    /// A manager for the same exchange on another connection. The return
    /// handler is not carried over.
    ///
    /// # Parameters
    /// * `connection` - Connection the new manager uses
    ///
    /// # Returns
    /// A manager with nothing cached yet
    pub fn fork(&self, connection: Arc<dyn Connection>) -> ConnectionManager {
        ConnectionManager::new(self.config.clone(), self.connector.clone())
            .with_connection(connection)
            .with_exchange(self.exchange_name.clone(), self.exchange_options.clone())
    }

    /// The connection, building it through the connector on first use.
    pub fn connection(&mut self) -> Arc<dyn Connection> {
        match &self.connection {
            Some(connection) => connection.clone(),
            None => {
                debug!("building connection");
                let connection = self.connector.connect(&self.config);
                self.connection = Some(connection.clone());
                connection
            }
        }
    }

    /// The connection if one was supplied or already built.
    pub fn current_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.clone()
    }

    /// The cached channel, `None` before the first publish or after a reset.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.clone()
    }

    /// The cached exchange, `None` before the first publish or after a reset.
    pub fn exchange(&self) -> Option<Arc<dyn Exchange>> {
        self.exchange.clone()
    }

    /// Counts the channels opened so far. Anything tied to a channel, such as
    /// a consumer, is gone once this number changes.
    pub fn channel_generation(&self) -> u64 {
        self.channel_generation
    }

    /// Name of the exchange messages are published to, `""` for the default.
    pub fn exchange_name(&self) -> &str {
        self.exchange_name.as_deref().unwrap_or(DEFAULT_EXCHANGE)
    }

    /// Whether messages go to the broker's default exchange.
    pub fn uses_default_exchange(&self) -> bool {
        is_default_exchange(self.exchange_name.as_deref())
    }

    /// Makes the connection usable and returns the cached exchange.
    ///
    /// Starting the connection, the first time or after it closed, drops the
    /// cached channel and exchange: they belonged to the previous session.
    ///
    /// A connection that does not become ready within the wait budget is not an
    /// error here; the channel creation that follows fails with the transport's
    /// own error instead.
    ///
    /// # Returns
    /// The exchange to publish to, or the error of the failed broker step
    pub async fn ensure_ready(&mut self) -> Result<Arc<dyn Exchange>, AmqpError> {
        let connection = self.connection();

        if matches!(
            connection.status(),
            ConnectionStatus::NotConnected | ConnectionStatus::Closed
        ) {
            self.forget_channel();
            connection.start().await?;
        }

        wait_until_ready(connection.as_ref()).await;

        let channel = match &self.channel {
            Some(channel) => channel.clone(),
            None => {
                let channel = connection.create_channel().await?;
                self.channel_generation += 1;
                debug!(
                    channel = channel.id(),
                    generation = self.channel_generation,
                    "publisher channel opened"
                );
                self.channel = Some(channel.clone());
                channel
            }
        };

        match &self.exchange {
            Some(exchange) => Ok(exchange.clone()),
            None => {
                let exchange = self.build_exchange(channel.as_ref()).await?;
                self.exchange = Some(exchange.clone());
                Ok(exchange)
            }
        }
    }

    /// Drops the cached channel and exchange; the next
    /// [`ConnectionManager::ensure_ready`] opens fresh ones.
    pub fn forget_channel(&mut self) {
        if self.channel.take().is_some() {
            debug!("dropping cached channel and exchange");
        }
        self.exchange = None;
    }

    /// Drops the cached channel and exchange and builds fresh ones.
    pub async fn reset_exchange(&mut self) -> Result<Arc<dyn Exchange>, AmqpError> {
        self.forget_channel();
        self.ensure_ready().await
    }

    /// Whether the connection recovers by itself and may still try to.
    pub fn can_recover(&self) -> bool {
        self.connection.as_ref().map_or(false, |connection| {
            connection.automatically_recover() && connection.should_retry_recovery()
        })
    }

    /// Drops the cached channel and exchange and closes the connection.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        self.forget_channel();

        match &self.connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }

    async fn build_exchange(&self, channel: &dyn Channel) -> Result<Arc<dyn Exchange>, AmqpError> {
        let exchange = if self.uses_default_exchange() {
            channel.default_exchange()
        } else {
            channel
                .exchange(self.exchange_name(), &self.exchange_options)
                .await?
        };

        if let Some(handler) = &self.return_handler {
            exchange.on_return(handler.clone());
        }

        Ok(exchange)
    }
}

/// Open status alone is not enough: the transport may still be negotiating.
pub fn connection_ready(connection: &dyn Connection) -> bool {
    connection.status() == ConnectionStatus::Open && connection.transport_open()
}

/// How long [`wait_until_ready`] polls: twice the heartbeat, which defaults to
/// 60 seconds and is floored at 5.
pub fn ready_wait_budget(connection: &dyn Connection) -> Duration {
    let heartbeat = connection
        .heartbeat()
        .map(u64::from)
        .unwrap_or(DEFAULT_HEARTBEAT_SECS)
        .max(MIN_HEARTBEAT_SECS);

    Duration::from_secs(heartbeat * 2)
}

/// Polls until the connection is ready, or returns at once when it will never
/// recover by itself. Gives up silently after [`ready_wait_budget`].
pub async fn wait_until_ready(connection: &dyn Connection) {
    let budget = ready_wait_budget(connection);

    let poll = async {
        while !connection_ready(connection) && connection.automatically_recover() {
            time::sleep(READY_POLL_INTERVAL).await;
        }
    };

    if time::timeout(budget, poll).await.is_err() {
        debug!(
            budget_secs = budget.as_secs(),
            "connection not ready in time, letting the next operation fail"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amqp::AmqpConnector,
        message::{MessageProperties, ReturnNotification},
        queue::QueueOptions,
        transport::DeliveryHandler,
    };
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    mock! {
        pub Conn {}

        #[async_trait]
        impl Connection for Conn {
            fn status(&self) -> ConnectionStatus;
            fn transport_open(&self) -> bool;
            fn automatically_recover(&self) -> bool;
            fn should_retry_recovery(&self) -> bool;
            fn heartbeat(&self) -> Option<u16>;
            async fn start(&self) -> Result<(), AmqpError>;
            async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError>;
            async fn close(&self) -> Result<(), AmqpError>;
            fn duplicate(&self) -> Arc<dyn Connection>;
        }
    }

    mock! {
        pub Chan {}

        #[async_trait]
        impl Channel for Chan {
            fn id(&self) -> u16;
            fn default_exchange(&self) -> Arc<dyn Exchange>;
            async fn exchange(
                &self,
                name: &str,
                options: &ExchangeOptions,
            ) -> Result<Arc<dyn Exchange>, AmqpError>;
            async fn queue(&self, name: &str, options: &QueueOptions) -> Result<String, AmqpError>;
            async fn queue_bind(
                &self,
                queue: &str,
                exchange: &str,
                routing_key: &str,
            ) -> Result<(), AmqpError>;
            fn deregister_queue(&self, queue: &str);
            async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), AmqpError>;
        }
    }

    #[derive(Default)]
    struct StubExchange {
        name: String,
        return_handlers: AtomicUsize,
    }

    #[async_trait]
    impl Exchange for StubExchange {
        fn name(&self) -> &str {
            &self.name
        }

        async fn publish(
            &self,
            _payload: &[u8],
            _routing_key: &str,
            _mandatory: bool,
            _properties: MessageProperties,
        ) -> Result<(), AmqpError> {
            Ok(())
        }

        fn on_return(&self, _handler: ReturnHandler) {
            self.return_handlers.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A connection that becomes ready once started.
    fn lazy_connection(channels: usize, channel: Arc<dyn Channel>) -> MockConn {
        let started = Arc::new(AtomicBool::new(false));
        let mut conn = MockConn::new();

        let status_started = started.clone();
        conn.expect_status().returning(move || {
            if status_started.load(Ordering::SeqCst) {
                ConnectionStatus::Open
            } else {
                ConnectionStatus::NotConnected
            }
        });
        conn.expect_transport_open().return_const(true);
        conn.expect_automatically_recover().return_const(true);
        conn.expect_heartbeat().return_const(None::<u16>);
        conn.expect_start().times(1).returning(move || {
            started.store(true, Ordering::SeqCst);
            Ok(())
        });
        conn.expect_create_channel()
            .times(channels)
            .returning(move || Ok(channel.clone()));
        conn
    }

    fn manager(conn: MockConn) -> ConnectionManager {
        ConnectionManager::new(ConnectionConfig::default(), Arc::new(AmqpConnector))
            .with_connection(Arc::new(conn))
    }

    #[tokio::test]
    async fn starts_once_and_caches_channel_and_exchange() {
        let exchange: Arc<dyn Exchange> = Arc::new(StubExchange::default());
        let mut chan = MockChan::new();
        chan.expect_id().return_const(1u16);
        let default_exchange = exchange.clone();
        chan.expect_default_exchange()
            .times(1)
            .returning(move || default_exchange.clone());

        let mut manager = manager(lazy_connection(1, Arc::new(chan)));

        let first = manager.ensure_ready().await.unwrap();
        let second = manager.ensure_ready().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &exchange));
        assert!(manager.uses_default_exchange());
        assert_eq!(manager.exchange_name(), "");
    }

    #[tokio::test]
    async fn named_exchange_is_declared_with_its_options() {
        let exchange = Arc::new(StubExchange {
            name: "events".to_owned(),
            ..Default::default()
        });
        let mut chan = MockChan::new();
        chan.expect_id().return_const(1u16);
        let declared: Arc<dyn Exchange> = exchange.clone();
        chan.expect_exchange()
            .withf(|name, options| name.to_string() == "events" && options.durable)
            .times(1)
            .returning(move |_, _| Ok(declared.clone()));

        let handler: ReturnHandler = Arc::new(|_: ReturnNotification| {});
        let mut manager = manager(lazy_connection(1, Arc::new(chan)))
            .with_exchange(
                Some("events".to_owned()),
                ExchangeOptions::default().durable(),
            )
            .with_return_handler(handler);

        let ready = manager.ensure_ready().await.unwrap();

        assert_eq!(ready.name(), "events");
        assert_eq!(exchange.return_handlers.load(Ordering::SeqCst), 1);
        assert!(!manager.uses_default_exchange());
    }

    #[tokio::test]
    async fn reset_builds_a_fresh_channel() {
        let mut chan = MockChan::new();
        chan.expect_id().return_const(1u16);
        chan.expect_default_exchange()
            .times(2)
            .returning(|| Arc::new(StubExchange::default()));

        let mut manager = manager(lazy_connection(2, Arc::new(chan)));

        let first = manager.ensure_ready().await.unwrap();
        let second = manager.reset_exchange().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn restarted_connection_gets_a_fresh_channel() {
        let status = Arc::new(std::sync::Mutex::new(ConnectionStatus::NotConnected));
        let mut conn = MockConn::new();

        let current = status.clone();
        conn.expect_status()
            .returning(move || *current.lock().unwrap());
        conn.expect_transport_open().return_const(true);
        conn.expect_automatically_recover().return_const(true);
        conn.expect_heartbeat().return_const(None::<u16>);
        let started = status.clone();
        conn.expect_start().times(2).returning(move || {
            *started.lock().unwrap() = ConnectionStatus::Open;
            Ok(())
        });
        conn.expect_create_channel().times(2).returning(|| {
            let mut chan = MockChan::new();
            chan.expect_id().return_const(1u16);
            chan.expect_default_exchange()
                .times(1)
                .returning(|| Arc::new(StubExchange::default()));
            let chan: Arc<dyn Channel> = Arc::new(chan);
            Ok(chan)
        });

        let mut manager = manager(conn);

        let first = manager.ensure_ready().await.unwrap();
        assert_eq!(manager.channel_generation(), 1);

        *status.lock().unwrap() = ConnectionStatus::Closed;
        let second = manager.ensure_ready().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.channel_generation(), 2);
    }

    #[tokio::test]
    async fn non_recovering_connection_is_not_waited_for() {
        let mut conn = MockConn::new();
        conn.expect_status().return_const(ConnectionStatus::Connecting);
        conn.expect_transport_open().return_const(false);
        conn.expect_automatically_recover().return_const(false);
        conn.expect_should_retry_recovery().return_const(false);
        conn.expect_heartbeat().return_const(None::<u16>);
        conn.expect_start().never();
        conn.expect_create_channel()
            .times(1)
            .returning(|| Err(AmqpError::ConnectionClosed));

        let mut manager = manager(conn);

        assert_eq!(
            manager.ensure_ready().await.err(),
            Some(AmqpError::ConnectionClosed)
        );
        assert!(!manager.can_recover());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_after_twice_the_heartbeat() {
        let mut conn = MockConn::new();
        conn.expect_status().return_const(ConnectionStatus::Connecting);
        conn.expect_transport_open().return_const(false);
        conn.expect_automatically_recover().return_const(true);
        conn.expect_heartbeat().return_const(Some(5u16));
        conn.expect_create_channel()
            .times(1)
            .returning(|| Err(AmqpError::ConnectionClosed));

        let mut manager = manager(conn);
        let started = time::Instant::now();

        let result = manager.ensure_ready().await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(result.err(), Some(AmqpError::ConnectionClosed));
    }

    #[test]
    fn wait_budget_follows_the_heartbeat() {
        let budget = |heartbeat: Option<u16>| {
            let mut conn = MockConn::new();
            conn.expect_heartbeat().return_const(heartbeat);
            ready_wait_budget(&conn)
        };

        assert_eq!(budget(None), Duration::from_secs(120));
        assert_eq!(budget(Some(1)), Duration::from_secs(10));
        assert_eq!(budget(Some(30)), Duration::from_secs(60));
    }
}
