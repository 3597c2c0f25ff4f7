// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Boundary
//!
//! The runtime talks to the broker only through the two traits in this module:
//! [`AmqpConnection`] opens channels and [`AmqpChannel`] exposes the handful of
//! protocol primitives the producers, consumers and the runner need. The lapin
//! implementation lives in [`crate::client`]; tests use the in-memory doubles of `mocks`.
//!
//! A channel is not meant to be driven from two places at once: exactly one runner
//! (or bare consumer) waits on a channel at a time.

use crate::{
    errors::AmqpError,
    exchange::ExchangeSpec,
    message::Delivery,
    queue::{QosSpec, QueueSpec},
};
use async_trait::async_trait;
use lapin::BasicProperties;
use std::{sync::Arc, time::Duration};

/// AMQP reply code the broker uses when a mandatory message matched no queue.
pub const REPLY_CODE_NO_ROUTE: u16 = 312;

/// The broker's answer to a single publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The channel is not in confirm mode, nothing was awaited.
    NotRequested,
    /// The broker accepted the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The broker handed the message back (`basic.return`).
    Returned { reply_code: u16, reply_text: String },
}

/// Flags of a `basic.consume` subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
}

impl From<&QueueSpec> for ConsumeOptions {
    fn from(spec: &QueueSpec) -> Self {
        ConsumeOptions {
            no_local: spec.no_local,
            no_ack: spec.no_ack,
            exclusive: spec.exclusive,
        }
    }
}

/// Source of channels.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a new channel on the connection.
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Closes the connection and every channel on it.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A live AMQP channel.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares the exchange described by `spec`.
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), AmqpError>;

    /// Declares the queue and returns the name the broker resolved for it.
    async fn queue_declare(&self, spec: &QueueSpec) -> Result<String, AmqpError>;

    /// Binds `queue` to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `queue` - Name of the bound queue
    /// * `exchange` - Name of the source exchange
    /// * `routing_key` - Binding key
    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), AmqpError>;

    /// Applies the prefetch settings to the channel.
    async fn basic_qos(&self, qos: &QosSpec) -> Result<(), AmqpError>;

    /// Switches the channel into publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes one message and, in confirm mode, waits for the broker's answer to it.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `body` - Message payload
    /// * `properties` - Message properties
    /// * `mandatory` - Whether the broker returns the message when no queue is bound
    ///
    /// # Returns
    /// [`Confirmation::NotRequested`] outside confirm mode, else the broker's answer
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<Confirmation, AmqpError>;

    /// Subscribes `consumer_tag` to `queue`; its deliveries come out of [`AmqpChannel::next_delivery`].
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<(), AmqpError>;

    /// Cancels the subscription `consumer_tag`.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Purges the queue and returns the number of messages removed.
    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Acknowledges one delivery.
    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects one delivery, requeuing it when `requeue` is set.
    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Negatively acknowledges one delivery, requeuing it when `requeue` is set.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Waits for the next delivery of any active subscription.
    ///
    /// Fails with [`AmqpError::Timeout`] when nothing arrives within `timeout`;
    /// `None` waits indefinitely.
    async fn next_delivery(&self, timeout: Option<Duration>) -> Result<Delivery, AmqpError>;

    /// Number of subscriptions still registered on the channel.
    fn active_consumers(&self) -> usize;

    /// Closes the channel; unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<(), AmqpError>;
}
