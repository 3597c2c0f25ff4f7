// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Specification
//!
//! Types describing queues, their bindings and the channel's prefetch settings.
//! Queue arguments understood by RabbitMQ (TTL, max length, dead lettering) are
//! exposed as builder helpers that fill the queue's `arguments` table.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

fn default_durable() -> bool {
    true
}

/// Specification of a queue with its configuration parameters and bindings.
///
/// When `bindings` is empty the owning member binds the queue to its own exchange
/// with its default routing key, provided the member has an exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub passive: bool,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub no_local: bool,
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub bindings: Vec<QueueBinding>,
}

impl QueueSpec {
    /// Creates a new queue specification with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(self, ttl: i64) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, ttl.into())
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH, max.into())
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i64) -> Self {
        self.argument(AMQP_HEADERS_MAX_LENGTH_BYTES, max_bytes.into())
    }

    /// Routes rejected, expired and overflowing messages to `exchange` with `routing_key`.
    pub fn dead_letter(self, exchange: &str, routing_key: &str) -> Self {
        self.argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, exchange.into())
            .argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, routing_key.into())
    }

    pub fn argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Binds the queue to `exchange` with `routing_key`.
    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.bindings.push(QueueBinding::new(exchange).routing_key(routing_key));
        self
    }

    /// Validates the queue before any network call is made.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.name.is_empty() {
            return Err(AmqpError::Configuration(
                "you must provide a queue name".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Binding of a queue to an exchange with a routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(exchange: &str) -> QueueBinding {
        QueueBinding {
            exchange: exchange.to_owned(),
            routing_key: String::new(),
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// Prefetch settings applied once per channel.
///
/// Both values zero means "broker default" and no `basic.qos` is issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosSpec {
    #[serde(default)]
    pub prefetch_size: u32,
    #[serde(default)]
    pub prefetch_count: u16,
}

impl QosSpec {
    pub fn new(prefetch_size: u32, prefetch_count: u16) -> QosSpec {
        QosSpec {
            prefetch_size,
            prefetch_count,
        }
    }

    pub fn is_default(&self) -> bool {
        self.prefetch_size == 0 && self.prefetch_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_helpers() {
        let spec = QueueSpec::new("billing")
            .ttl(5000)
            .max_length(10)
            .dead_letter("", "billing-dlq");

        assert_eq!(spec.arguments.get(AMQP_HEADERS_MESSAGE_TTL), Some(&5000.into()));
        assert_eq!(spec.arguments.get(AMQP_HEADERS_MAX_LENGTH), Some(&10.into()));
        assert_eq!(
            spec.arguments.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&"billing-dlq".into())
        );
    }

    #[test]
    fn test_bind() {
        let spec = QueueSpec::new("billing").bind("orders", "order.created");

        assert_eq!(
            spec.bindings,
            vec![QueueBinding::new("orders").routing_key("order.created")]
        );
    }

    #[test]
    fn test_validate_requires_name() {
        assert!(QueueSpec::new("billing").validate().is_ok());
        assert!(QueueSpec::default().validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_deserialize_defaults() {
        let spec: QueueSpec = serde_json::from_str(
            r#"{"name": "billing", "bindings": [{"exchange": "orders", "routing_key": "a"}]}"#,
        )
        .unwrap();

        assert!(spec.durable);
        assert!(!spec.no_ack);
        assert_eq!(spec.bindings.len(), 1);
    }

    #[test]
    fn test_qos_default() {
        assert!(QosSpec::default().is_default());
        assert!(!QosSpec::new(0, 10).is_default());
    }
}
