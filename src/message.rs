// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Acknowledgement Outcomes
//!
//! A [`Delivery`] is an inbound message handed to exactly one handler invocation.
//! The handler answers with a [`ProcessOutcome`] which selects the single
//! acknowledgement primitive sent back to the broker.

use crate::errors::AmqpError;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;

/// Default content type of published messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Delivery mode of messages that survive a broker restart
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Delivery mode of messages kept in memory only
pub const DELIVERY_MODE_NON_PERSISTENT: u8 = 1;

/// An inbound message.
///
/// The delivery tag identifies the message on the channel it arrived on; the consumer
/// tag identifies the subscription it was delivered to and is what routes it back to
/// the right consumer and callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, consumer_tag: &str, body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag,
            consumer_tag: consumer_tag.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            body: body.to_vec(),
        }
    }

    pub(crate) fn from_lapin(consumer_tag: &str, delivery: lapin::message::Delivery) -> Delivery {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            consumer_tag: consumer_tag.to_owned(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
        }
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// What the broker should do with a processed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessOutcome {
    /// Remove the message from the queue.
    Ack,
    /// Drop the message (or dead-letter it when the queue is configured to).
    Reject,
    /// Put the message back on the queue.
    RejectRequeue,
    /// Negatively acknowledge this single message and put it back on the queue.
    NackRequeue,
}

impl ProcessOutcome {
    pub const ACK_CODE: i32 = 1;
    pub const NACK_REQUEUE_CODE: i32 = 2;
    pub const REJECT_REQUEUE_CODE: i32 = 0;
    pub const REJECT_CODE: i32 = -1;
}

impl TryFrom<i32> for ProcessOutcome {
    type Error = AmqpError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            ProcessOutcome::ACK_CODE => Ok(ProcessOutcome::Ack),
            ProcessOutcome::NACK_REQUEUE_CODE => Ok(ProcessOutcome::NackRequeue),
            ProcessOutcome::REJECT_REQUEUE_CODE => Ok(ProcessOutcome::RejectRequeue),
            ProcessOutcome::REJECT_CODE => Ok(ProcessOutcome::Reject),
            other => Err(AmqpError::InvalidProcessOutcome(other)),
        }
    }
}

impl From<ProcessOutcome> for i32 {
    fn from(outcome: ProcessOutcome) -> i32 {
        match outcome {
            ProcessOutcome::Ack => ProcessOutcome::ACK_CODE,
            ProcessOutcome::NackRequeue => ProcessOutcome::NACK_REQUEUE_CODE,
            ProcessOutcome::RejectRequeue => ProcessOutcome::REJECT_REQUEUE_CODE,
            ProcessOutcome::Reject => ProcessOutcome::REJECT_CODE,
        }
    }
}

/// Result of handing one delivery to a consumer, once it has been acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageProcessed {
    /// The handler returned normally.
    Settled(ProcessOutcome),
    /// The handler asked to stop consuming after acknowledging with the outcome.
    Terminated(ProcessOutcome),
}

impl MessageProcessed {
    pub fn outcome(&self) -> ProcessOutcome {
        match self {
            MessageProcessed::Settled(outcome) | MessageProcessed::Terminated(outcome) => *outcome,
        }
    }
}

/// Merges `overrides` over `base`: every property set in `overrides` wins.
///
/// Headers are merged key by key, again with `overrides` winning on collision.
pub fn merge_properties(base: BasicProperties, overrides: &BasicProperties) -> BasicProperties {
    let mut merged = base;

    if let Some(v) = overrides.content_type() {
        merged = merged.with_content_type(v.clone());
    }
    if let Some(v) = overrides.content_encoding() {
        merged = merged.with_content_encoding(v.clone());
    }
    if let Some(v) = overrides.delivery_mode() {
        merged = merged.with_delivery_mode(*v);
    }
    if let Some(v) = overrides.priority() {
        merged = merged.with_priority(*v);
    }
    if let Some(v) = overrides.correlation_id() {
        merged = merged.with_correlation_id(v.clone());
    }
    if let Some(v) = overrides.reply_to() {
        merged = merged.with_reply_to(v.clone());
    }
    if let Some(v) = overrides.expiration() {
        merged = merged.with_expiration(v.clone());
    }
    if let Some(v) = overrides.message_id() {
        merged = merged.with_message_id(v.clone());
    }
    if let Some(v) = overrides.timestamp() {
        merged = merged.with_timestamp(*v);
    }
    if let Some(v) = overrides.kind() {
        merged = merged.with_type(v.clone());
    }
    if let Some(v) = overrides.user_id() {
        merged = merged.with_user_id(v.clone());
    }
    if let Some(v) = overrides.app_id() {
        merged = merged.with_app_id(v.clone());
    }
    if let Some(v) = overrides.cluster_id() {
        merged = merged.with_cluster_id(v.clone());
    }
    if let Some(extra) = overrides.headers() {
        let mut headers = header_map(&merged);
        for (key, value) in extra.inner() {
            headers.insert(key.clone(), value.clone());
        }
        merged = merged.with_headers(FieldTable::from(headers));
    }

    merged
}

/// Copies the headers of `props` into an ordered map.
pub(crate) fn header_map(props: &BasicProperties) -> BTreeMap<ShortString, AMQPValue> {
    props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default()
}
