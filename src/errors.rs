// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Runtime
//!
//! This module provides the error type shared by every member of the runtime.
//! The `AmqpError` enum covers configuration mistakes, broker/protocol failures,
//! publisher-confirm failures and failures raised by message handlers.

use thiserror::Error;

/// Represents errors that can occur while declaring fabric, publishing or consuming.
///
/// Configuration variants are raised before any network call is made and are never
/// retried. Broker variants carry the broker/client message so callers can decide on
/// a reconnection policy. `Timeout` is only ever produced by the idle-timeout wait and
/// is recovered by the runner.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or incomplete declarative configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel stopped delivering (closed by the broker or the connection dropped)
    #[error("channel closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error switching the channel into publisher-confirm mode
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmSelectError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively acknowledged a confirmed publish
    #[error("failure to publish message to exchange `{exchange}`")]
    FailedToPublishMessage { exchange: String },

    /// The broker returned a confirmed publish because no queue matched
    #[error("unroutable message to exchange `{exchange}` with routing key `{routing_key}`")]
    UnroutableMessage {
        exchange: String,
        routing_key: String,
    },

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Nothing arrived on the channel within the idle timeout
    #[error("timed out waiting for the next delivery")]
    Timeout,

    /// A message handler failed; the delivery was rejected and requeued
    #[error("message handler failure `{0}`")]
    HandlerError(String),

    /// A raw outcome code that maps to no acknowledgement action
    #[error("invalid process outcome `{0}`")]
    InvalidProcessOutcome(i32),

    /// A multiple consumer received a delivery for a queue it never registered
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// A delivery arrived for a consumer tag no attached consumer owns
    #[error("no consumer registered for tag `{0}`")]
    UnknownConsumerTag(String),

    /// The registry has no consumer with the given name
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),

    /// The registry has no producer with the given name
    #[error("unknown producer `{0}`")]
    UnknownProducer(String),

    /// A definition references a handler that was never registered
    #[error("unknown handler `{0}`")]
    UnknownHandler(String),

    /// The runner was used outside of the state the operation requires
    #[error("invalid runner state: {0}")]
    InvalidRunnerState(String),
}

impl AmqpError {
    /// Whether the error is a fail-fast configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AmqpError::Configuration(_)
                | AmqpError::InvalidProcessOutcome(_)
                | AmqpError::QueueNotFound(_)
                | AmqpError::UnknownConsumer(_)
                | AmqpError::UnknownProducer(_)
                | AmqpError::UnknownHandler(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("orders".to_owned(), "billing".to_owned());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `orders` to queue `billing`"
        );
    }

    #[test]
    fn test_is_configuration() {
        assert!(AmqpError::Configuration("x".to_owned()).is_configuration());
        assert!(AmqpError::InvalidProcessOutcome(7).is_configuration());
        assert!(!AmqpError::Timeout.is_configuration());
        assert!(!AmqpError::ChannelClosed.is_configuration());
    }
}
