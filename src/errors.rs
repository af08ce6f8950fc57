// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable Publisher
//!
//! This module provides the error taxonomy shared by every publishing layer.
//! The `AmqpError` enum separates transient transport faults (retried once when
//! the connection can recover), stale channels (always rebuilt locally), and the
//! failures of the mandatory-republish and RPC paths.

use lapin::protocol::AMQPErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur while publishing through the broker client.
///
/// Errors raised from the broker's asynchronous return/delivery context are never
/// handed back to application code; they are logged and the message is treated
/// as lost. Everything else propagates to the caller of `publish` or `call`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection was closed while it was being used
    #[error("connection closed")]
    ConnectionClosed,

    /// The network transport failed underneath the connection
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The broker closed the connection with a connection-level protocol error
    #[error("connection level exception: {0}")]
    ConnectionLevel(String),

    /// A broker operation did not complete while the connection was recovering
    #[error("timed out waiting for connection recovery")]
    RecoveryTimeout,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The cached channel was already closed by the broker
    #[error("channel already closed")]
    ChannelAlreadyClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// No queue name or routing key was available to republish a returned message
    #[error(
        "can not create queue for re-publishing, set a queue name or publish with a routing key"
    )]
    CannotCreateQueue,

    /// The broker returned a message for a reason other than `NO_ROUTE`
    #[error("message returned with unsupported reason {reply_code} `{reply_text}`")]
    UnsupportedReturnReason { reply_code: u16, reply_text: String },

    /// In-flight returned messages were still being handled when shutdown gave up
    #[error("unrouted messages still in flight after {0:?}")]
    ShutdownDrainTimeout(Duration),

    /// No reply arrived for an RPC call within the configured bound
    #[error("rpc call timed out after {0:?}")]
    RpcTimeout(Duration),

    /// The reply slot of an RPC call was dropped before a reply arrived
    #[error("rpc reply slot dropped before a reply arrived")]
    RpcReplyDropped,

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// A hook was registered for a phase its event does not define
    #[error("event `{event}` does not define a `{phase}` phase")]
    UndefinedCallbackPhase { event: String, phase: String },

    /// A callback hook failed and aborted the guarded operation
    #[error("callback `{0}` failed: {1}")]
    HookError(String, String),

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),
}

impl AmqpError {
    /// Whether the error belongs to the transient transport set that a
    /// connection recovery can fix.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionClosed
                | AmqpError::NetworkFailure(_)
                | AmqpError::ConnectionLevel(_)
                | AmqpError::RecoveryTimeout
        )
    }
}

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
                AmqpError::ChannelAlreadyClosed
            }
            lapin::Error::InvalidConnectionState(_) => AmqpError::ConnectionClosed,
            lapin::Error::IOError(e) => AmqpError::NetworkFailure(e.to_string()),
            lapin::Error::MissingHeartbeatError => {
                AmqpError::NetworkFailure("missed heartbeats from the broker".to_owned())
            }
            lapin::Error::ProtocolError(e) => match e.kind() {
                AMQPErrorKind::Hard(_) => AmqpError::ConnectionLevel(e.to_string()),
                AMQPErrorKind::Soft(_) => AmqpError::ChannelError(e.to_string()),
            },
            other => AmqpError::PublishingError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_transport_errors_are_retriable() {
        assert!(AmqpError::ConnectionClosed.is_retriable());
        assert!(AmqpError::NetworkFailure("reset".into()).is_retriable());
        assert!(AmqpError::ConnectionLevel("541".into()).is_retriable());
        assert!(AmqpError::RecoveryTimeout.is_retriable());
    }

    #[test]
    fn stale_channel_and_republish_errors_are_not_retriable() {
        assert!(!AmqpError::ChannelAlreadyClosed.is_retriable());
        assert!(!AmqpError::CannotCreateQueue.is_retriable());
        assert!(!AmqpError::PublishingError("nack".into()).is_retriable());
    }

    #[test]
    fn lapin_state_errors_are_classified() {
        let err: AmqpError =
            lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed).into();
        assert_eq!(err, AmqpError::ConnectionClosed);

        let err: AmqpError = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed).into();
        assert_eq!(err, AmqpError::ChannelAlreadyClosed);

        let err: AmqpError = lapin::Error::MissingHeartbeatError.into();
        assert!(err.is_retriable());
    }

    #[test]
    fn cannot_create_queue_explains_how_to_fix_it() {
        let msg = AmqpError::CannotCreateQueue.to_string();
        assert!(msg.contains("queue name"));
        assert!(msg.contains("routing key"));
    }
}
