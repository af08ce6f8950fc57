// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Mandatory Publisher
//!
//! Publishes every message with the `mandatory` flag and recovers the ones the
//! broker returns as unroutable: a queue is declared (and bound) for them and
//! they are published again.
//!
//! The broker client calls the return handler from inside its own delivery
//! context, where no broker operation on the same connection may happen. The
//! handler therefore only queues the returned message; a worker task does the
//! declare/bind/republish, by default on a duplicate of the primary connection.
//!
//! Errors on that path never reach application code. They are logged, handed
//! to the optional `on_republish_failure` callback, and the message is lost.
//!
//! [`Publish::close`] is the orderly shutdown: it waits for returned messages
//! still in flight before closing the connections. Dropping the publisher
//! without closing it leaves the worker running in the background until those
//! messages are handled or the exit timeout passes.

use crate::{
    callbacks::{Callbacks, Next},
    config::MandatoryConfig,
    errors::AmqpError,
    message::{MessageEnvelope, ReturnNotification},
    publisher::{Publish, Publisher, PublisherBuilder},
    queue::{QueueOptions, RepublishQueueSpec},
    transport::{Connection, ReturnHandler},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, OnceCell},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

/// Event name of the republish hooks.
pub const REPUBLISH_EVENT: &str = "republish";

/// Capacity of the hand-off queue between the return handler and the worker.
const RETURN_QUEUE_CAPACITY: usize = 1024;

/// Pause before draining, leaving a just-published message time to come back.
const RETURN_GRACE: Duration = Duration::from_millis(50);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Replaces the default processing of returned messages.
pub type ReturnCallback =
    Arc<dyn Fn(ReturnNotification) -> BoxFuture<'static, Result<(), AmqpError>> + Send + Sync>;

/// Told about every returned message that could not be republished.
pub type RepublishFailureHandler = Arc<dyn Fn(&ReturnNotification, &AmqpError) + Send + Sync>;

/// Fails with `UnsupportedReturnReason` unless the broker returned the message
/// because no queue matched.
pub fn ensure_unrouted(returned: &ReturnNotification) -> Result<(), AmqpError> {
    if returned.is_no_route() {
        Ok(())
    } else {
        Err(AmqpError::UnsupportedReturnReason {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.clone(),
        })
    }
}

/// A [`Publisher`] that never silently drops an unroutable message.
pub struct MandatoryPublisher {
    primary: Arc<Publisher>,
    republisher: Arc<Republisher>,
    in_flight: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
    timeout_at_exit: Duration,
}

impl MandatoryPublisher {
    /// Starts a [`MandatoryPublisherBuilder`] around the given publisher settings.
    pub fn builder(publisher: PublisherBuilder) -> MandatoryPublisherBuilder {
        MandatoryPublisherBuilder::new(publisher)
    }

    /// Returned messages queued or being republished right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for in-flight returned messages to be handled.
    ///
    /// Pauses briefly first so a message published just before can still be
    /// returned, then waits up to the exit timeout. Giving up is reported with
    /// a warning and `ShutdownDrainTimeout`; the messages still in flight may
    /// be lost.
    pub async fn drain_returns(&self) -> Result<(), AmqpError> {
        time::sleep(RETURN_GRACE).await;

        if self.in_flight() == 0 {
            return Ok(());
        }

        info!(
            timeout_secs = self.timeout_at_exit.as_secs_f64(),
            "waiting for unrouted messages handling"
        );

        time::timeout(self.timeout_at_exit, wait_for_drain(&self.in_flight))
            .await
            .map_err(|_| {
                let err = AmqpError::ShutdownDrainTimeout(self.timeout_at_exit);
                warn!(
                    error = err.to_string(),
                    in_flight = self.in_flight(),
                    "some unrouted messages are lost on exit"
                );
                err
            })
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn stop_worker(&self) {
        if let Some(worker) = self.take_worker() {
            worker.abort();
        }
    }
}

async fn wait_for_drain(in_flight: &AtomicUsize) {
    while in_flight.load(Ordering::SeqCst) > 0 {
        time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl Publish for MandatoryPublisher {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), AmqpError> {
        self.primary.publish(envelope.mandatory(true)).await
    }

    /// Drains in-flight returns, then closes the republish connection and the
    /// primary one.
    async fn close(&self) -> Result<(), AmqpError> {
        if self.drain_returns().await.is_err() {
            debug!("closing with unrouted messages still in flight");
        }
        self.stop_worker();

        if let Some(republisher) = self.republisher.publisher.get() {
            if !Arc::ptr_eq(republisher, &self.primary) {
                republisher.close().await?;
            }
        }

        self.primary.close().await
    }

    fn base(&self) -> &Publisher {
        &self.primary
    }
}

impl Drop for MandatoryPublisher {
    /// Stops the worker once no returned message is in flight. Messages still
    /// in flight are handled in the background for up to the exit timeout.
    fn drop(&mut self) {
        let Some(worker) = self.take_worker() else {
            return;
        };

        let in_flight = self.in_flight();
        if in_flight == 0 {
            worker.abort();
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(in_flight, "dropped outside a runtime, unrouted messages are lost");
            worker.abort();
            return;
        };

        warn!(
            in_flight,
            "mandatory publisher dropped without close, draining in background"
        );

        let counter = self.in_flight.clone();
        let timeout_at_exit = self.timeout_at_exit;
        runtime.spawn(async move {
            if time::timeout(timeout_at_exit, wait_for_drain(&counter))
                .await
                .is_err()
            {
                warn!(
                    in_flight = counter.load(Ordering::SeqCst),
                    "some unrouted messages are lost on exit"
                );
            }
            worker.abort();
        });
    }
}

/// Worker side: turns returned messages into republished ones.
struct Republisher {
    primary: Arc<Publisher>,
    connection: Option<Arc<dyn Connection>>,
    isolate: bool,
    publisher: OnceCell<Arc<Publisher>>,
    queue: Option<String>,
    queue_options: QueueOptions,
    callbacks: Callbacks<ReturnNotification, ()>,
    on_message_return: Option<ReturnCallback>,
    on_failure: Option<RepublishFailureHandler>,
}

impl Republisher {
    async fn run(
        self: Arc<Self>,
        mut returns: mpsc::Receiver<ReturnNotification>,
        in_flight: Arc<AtomicUsize>,
    ) {
        while let Some(returned) = returns.recv().await {
            if let Err(err) = self.handle(&returned).await {
                self.report(&returned, &err);
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        debug!("return queue closed, republish worker stopped");
    }

    async fn handle(&self, returned: &ReturnNotification) -> Result<(), AmqpError> {
        if let Some(callback) = &self.on_message_return {
            return callback(returned.clone()).await;
        }

        ensure_unrouted(returned)?;

        let queue = RepublishQueueSpec::resolve(
            self.queue.as_deref(),
            &returned.routing_key,
            &self.queue_options,
        )?;

        let envelope = MessageEnvelope::new(returned.payload.clone())
            .mandatory(true)
            .properties(returned.properties.clone());

        debug!(
            queue = queue.name,
            routing_key = returned.routing_key,
            "republishing unrouted message"
        );

        self.publisher()
            .await
            .republish(&self.callbacks, returned, &queue, envelope)
            .await
    }

    /// The publisher republished messages go through, created on first use.
    async fn publisher(&self) -> Arc<Publisher> {
        self.publisher
            .get_or_init(|| async {
                match (&self.connection, self.isolate) {
                    (Some(connection), _) => Arc::new(
                        self.primary
                            .republisher(Some(connection.clone()))
                            .await,
                    ),
                    (None, true) => Arc::new(self.primary.republisher(None).await),
                    (None, false) => self.primary.clone(),
                }
            })
            .await
            .clone()
    }

    fn report(&self, returned: &ReturnNotification, err: &AmqpError) {
        match err {
            AmqpError::UnsupportedReturnReason { .. } => warn!(
                error = err.to_string(),
                exchange = returned.exchange,
                routing_key = returned.routing_key,
                "returned message is lost"
            ),
            _ => error!(
                error = err.to_string(),
                exchange = returned.exchange,
                routing_key = returned.routing_key,
                "failed to republish returned message, it is lost"
            ),
        }

        if let Some(on_failure) = &self.on_failure {
            on_failure(returned, err);
        }
    }
}

/// Builds a [`MandatoryPublisher`] on top of a [`PublisherBuilder`].
pub struct MandatoryPublisherBuilder {
    publisher: PublisherBuilder,
    queue: Option<String>,
    queue_options: QueueOptions,
    timeout_at_exit: Duration,
    isolate: bool,
    republish_connection: Option<Arc<dyn Connection>>,
    callbacks: Callbacks<ReturnNotification, ()>,
    on_message_return: Option<ReturnCallback>,
    on_failure: Option<RepublishFailureHandler>,
}

impl MandatoryPublisherBuilder {
    /// Creates a builder that forces `mandatory` on every publish.
    ///
    /// # Parameters
    /// * `publisher` - Settings and publish hooks of the primary publisher
    ///
    /// # Returns
    /// A builder republishing to a queue named by the routing key
    pub fn new(publisher: PublisherBuilder) -> Self {
        MandatoryPublisherBuilder {
            publisher,
            queue: None,
            queue_options: QueueOptions::default(),
            timeout_at_exit: MandatoryConfig::default().timeout_at_exit(),
            isolate: true,
            republish_connection: None,
            callbacks: Callbacks::new(REPUBLISH_EVENT),
            on_message_return: None,
            on_failure: None,
        }
    }

    /// Applies queue, exit timeout and isolation settings.
    ///
    /// # Parameters
    /// * `config` - Loaded mandatory publisher settings
    ///
    /// # Returns
    /// Self for method chaining
    pub fn config(mut self, config: MandatoryConfig) -> Self {
        self.timeout_at_exit = config.timeout_at_exit();
        self.queue = config.queue;
        self.queue_options = config.queue_options;
        self.isolate = config.isolate_republish;
        self
    }

    /// Queue unroutable messages go to; defaults to their routing key.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    /// Declare options of the republish queue.
    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// How long closing waits for returned messages still in flight.
    ///
    /// # Parameters
    /// * `timeout` - Upper bound of the drain on close or drop
    ///
    /// # Returns
    /// Self for method chaining
    pub fn timeout_at_exit(mut self, timeout: Duration) -> Self {
        self.timeout_at_exit = timeout;
        self
    }

    /// `false` republishes through the primary publisher instead of a
    /// duplicated connection.
    pub fn isolate_republish(mut self, isolate: bool) -> Self {
        self.isolate = isolate;
        self
    }

    /// Connection republished messages go through.
    pub fn republish_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.republish_connection = Some(connection);
        self
    }

    /// Adds a hook run before each republish.
    pub fn before_republish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ReturnNotification) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.callbacks.push_before(Arc::new(hook), None);
        self
    }

    /// Adds a hook wrapped around each republish.
    pub fn around_republish<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(
                &'a ReturnNotification,
                Next<'a, ()>,
            ) -> BoxFuture<'a, Result<(), AmqpError>>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.push_around(Arc::new(hook), None);
        self
    }

    /// Adds a hook run after each successful republish.
    pub fn after_republish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ReturnNotification, &()) -> Result<(), AmqpError> + Send + Sync + 'static,
    {
        self.callbacks.push_after(Arc::new(hook), None);
        self
    }

    /// Replaces the republish hooks.
    pub fn republish_callbacks(mut self, callbacks: Callbacks<ReturnNotification, ()>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Handles returned messages with `callback` instead of republishing them.
    pub fn on_message_return<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReturnNotification) -> BoxFuture<'static, Result<(), AmqpError>>
            + Send
            + Sync
            + 'static,
    {
        self.on_message_return = Some(Arc::new(callback));
        self
    }

    /// Tells `handler` about every returned message that is lost.
    ///
    /// # Parameters
    /// * `handler` - Receives the returned message and why it was not republished
    ///
    /// # Returns
    /// Self for method chaining
    pub fn on_republish_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ReturnNotification, &AmqpError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(handler));
        self
    }

    /// Builds the publisher and spawns its republish worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> MandatoryPublisher {
        let (sender, returns) = mpsc::channel(RETURN_QUEUE_CAPACITY);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let counter = in_flight.clone();
        let handler: ReturnHandler = Arc::new(move |returned: ReturnNotification| {
            counter.fetch_add(1, Ordering::SeqCst);

            if let Err(err) = sender.try_send(returned) {
                counter.fetch_sub(1, Ordering::SeqCst);
                warn!(
                    error = err.to_string(),
                    "return queue unavailable, unrouted message is lost"
                );
            }
        });

        let primary = Arc::new(self.publisher.return_handler(handler).build());

        let republisher = Arc::new(Republisher {
            primary: primary.clone(),
            connection: self.republish_connection,
            isolate: self.isolate,
            publisher: OnceCell::new(),
            queue: self.queue,
            queue_options: self.queue_options,
            callbacks: self.callbacks,
            on_message_return: self.on_message_return,
            on_failure: self.on_failure,
        });

        let worker = tokio::spawn(republisher.clone().run(returns, in_flight.clone()));

        MandatoryPublisher {
            primary,
            republisher,
            in_flight,
            worker: Mutex::new(Some(worker)),
            timeout_at_exit: self.timeout_at_exit,
        }
    }
}
