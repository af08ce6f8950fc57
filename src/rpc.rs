// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Publisher
//!
//! Request/response over the broker: [`RpcPublisher::call`] publishes a request
//! carrying a fresh correlation id and the name of an exclusive reply queue,
//! then suspends until the reply with the same correlation id arrives.
//!
//! The reply queue is declared and subscribed on first use. It is exclusive to
//! the channel it was declared on, so once the publisher opens a new channel
//! (after a closed channel or a reconnect) the next call declares and
//! subscribes a fresh one. Pending calls are kept in a table keyed by correlation id, so concurrent
//! calls on one instance never receive each other's replies. Each entry is
//! registered before its request is published.
//!
//! Calls wait forever unless a timeout is configured.

use crate::{
    callbacks::Callbacks,
    config::RpcConfig,
    errors::AmqpError,
    message::{Delivery, MessageEnvelope},
    publisher::{Publish, Publisher, ReplyQueue},
    transport::DeliveryHandler,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::oneshot, time};
use tracing::debug;
use uuid::Uuid;

/// Event name of the RPC hooks.
pub const RPC_EVENT: &str = "rpc";

/// One request as seen by the RPC hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    /// The request, with `correlation_id` and `reply_to` already set.
    pub envelope: MessageEnvelope,
    pub correlation_id: String,
}

type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>>;

/// Removes its pending call from the table when dropped, whether the call got
/// its reply, failed or was cancelled.
struct PendingSlot {
    pending: PendingCalls,
    correlation_id: String,
}

impl PendingSlot {
    fn register(
        pending: &PendingCalls,
        correlation_id: &str,
        reply: oneshot::Sender<Vec<u8>>,
    ) -> Self {
        pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.to_owned(), reply);

        PendingSlot {
            pending: pending.clone(),
            correlation_id: correlation_id.to_owned(),
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.correlation_id);
    }
}

/// Hands a reply to the call waiting for its correlation id.
fn resolve(pending: &PendingCalls, delivery: Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
        debug!("reply without correlation id dropped");
        return;
    };

    let waiting = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(correlation_id);

    match waiting {
        Some(reply) => {
            if reply.send(delivery.payload).is_err() {
                debug!(correlation_id, "caller stopped waiting for its reply");
            }
        }
        None => debug!(correlation_id, "reply for an unknown call dropped"),
    }
}

/// Request/response on top of any [`Publish`] layer.
///
/// Wrapping a [`crate::mandatory::MandatoryPublisher`] keeps a request from
/// being dropped while no server queue exists yet.
pub struct RpcPublisher<P> {
    inner: P,
    reply_queue: tokio::sync::Mutex<Option<ReplyQueue>>,
    pending: PendingCalls,
    callbacks: Callbacks<RpcCall, Vec<u8>>,
    timeout: Option<Duration>,
}

impl<P: Publish> RpcPublisher<P> {
    /// Wraps `inner`; calls wait for their reply without a time limit.
    ///
    /// # Parameters
    /// * `inner` - Layer requests are published through
    ///
    /// # Returns
    /// A new RpcPublisher instance
    pub fn new(inner: P) -> Self {
        RpcPublisher {
            inner,
            reply_queue: tokio::sync::Mutex::new(None),
            pending: PendingCalls::default(),
            callbacks: Callbacks::new(RPC_EVENT),
            timeout: None,
        }
    }

    /// Applies loaded settings; a missing timeout keeps calls waiting forever.
    pub fn with_config(mut self, config: RpcConfig) -> Self {
        self.timeout = config.timeout();
        self
    }

    /// Fails calls with `RpcTimeout` when no reply arrives in time.
    ///
    /// # Parameters
    /// * `timeout` - How long a call waits after its request was published
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the `rpc` hooks.
    pub fn with_callbacks(mut self, callbacks: Callbacks<RpcCall, Vec<u8>>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// The `rpc` hooks; `after` hooks receive the reply payload.
    pub fn callbacks_mut(&mut self) -> &mut Callbacks<RpcCall, Vec<u8>> {
        &mut self.callbacks
    }

    /// The wrapped layer.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Calls currently waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Name of the reply queue replies are consumed from.
    ///
    /// Declares and subscribes the queue on first use, and again whenever the
    /// publisher's channel changed since the last subscription.
    ///
    /// # Returns
    /// The queue name to put into `reply_to`
    pub async fn reply_queue(&self) -> Result<String, AmqpError> {
        let mut current = self.reply_queue.lock().await;

        let pending = self.pending.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery| resolve(&pending, delivery));
        let queue = self
            .inner
            .base()
            .subscribe_reply_queue(handler, current.as_ref())
            .await?;

        if let Some(previous) = current.as_ref().filter(|previous| **previous != queue) {
            debug!(
                previous = previous.name,
                queue = queue.name,
                "reply queue renewed on a new channel"
            );
        }

        let name = queue.name.clone();
        *current = Some(queue);
        Ok(name)
    }

    /// Publishes `envelope` as a request and returns the reply payload.
    ///
    /// # Parameters
    /// * `envelope` - The request; its `correlation_id` and `reply_to` are
    ///   overwritten
    ///
    /// # Returns
    /// The payload of the matching reply
    pub async fn call(&self, mut envelope: MessageEnvelope) -> Result<Vec<u8>, AmqpError> {
        let reply_to = self.reply_queue().await?;
        let correlation_id = Uuid::new_v4().to_string();

        envelope.properties.correlation_id = Some(correlation_id.clone());
        envelope.properties.reply_to = Some(reply_to);

        let call = RpcCall {
            envelope,
            correlation_id,
        };

        self.callbacks
            .run(&call, || Box::pin(self.send_and_wait(&call)))
            .await
    }

    async fn send_and_wait(&self, call: &RpcCall) -> Result<Vec<u8>, AmqpError> {
        let (reply, waiting) = oneshot::channel();
        let _slot = PendingSlot::register(&self.pending, &call.correlation_id, reply);

        self.inner.publish(call.envelope.clone()).await?;
        debug!(correlation_id = call.correlation_id, "rpc request published");

        match self.timeout {
            Some(limit) => time::timeout(limit, waiting)
                .await
                .map_err(|_| AmqpError::RpcTimeout(limit))?
                .map_err(|_| AmqpError::RpcReplyDropped),
            None => waiting.await.map_err(|_| AmqpError::RpcReplyDropped),
        }
    }
}

#[async_trait]
impl<P: Publish> Publish for RpcPublisher<P> {
    /// Publishes without waiting for a reply.
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), AmqpError> {
        self.inner.publish(envelope).await
    }

    /// Closes the inner layers. Calls still waiting fail with
    /// `RpcReplyDropped`.
    async fn close(&self) -> Result<(), AmqpError> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.inner.close().await
    }

    fn base(&self) -> &Publisher {
        self.inner.base()
    }
}
