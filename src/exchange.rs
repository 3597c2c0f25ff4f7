// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Specification
//!
//! Types describing the exchanges a fabric member declares. An exchange is declared at
//! most once per member; see [`crate::fabric::FabricMember`].

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    fn try_into(self) -> Result<lapin::ExchangeKind, AmqpError> {
        match self {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XMessageDelayed => {
                Ok(lapin::ExchangeKind::Custom("x-delayed-message".to_owned()))
            }
        }
    }
}

fn default_durable() -> bool {
    true
}

/// Specification of an exchange.
///
/// Built either in code through the builder methods or deserialised from a
/// definitions file, where `durable` defaults to `true` and the kind is read from
/// the `type` key. The kind is optional only so that a definition missing it can
/// be reported as a configuration error instead of silently becoming `direct`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<ExchangeKind>,
    #[serde(default)]
    pub passive: bool,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
}

impl ExchangeSpec {
    /// Creates a direct, non-durable exchange specification with the given name.
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            kind: Some(ExchangeKind::Direct),
            passive: false,
            durable: false,
            auto_delete: false,
            internal: false,
            arguments: BTreeMap::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed exchange routing like `delayed_kind` once the delay expires.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed(mut self, delayed_kind: &str) -> Self {
        self.kind = Some(ExchangeKind::XMessageDelayed);
        self.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            serde_json::Value::String(delayed_kind.to_owned()),
        );
        self
    }

    pub fn argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Checks for existence without creating the exchange.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Whether the exchange is named; an unnamed exchange is never declared.
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }

    /// Validates the exchange before any network call is made.
    pub fn validate(&self) -> Result<&ExchangeKind, AmqpError> {
        if !self.is_named() {
            return Err(AmqpError::Configuration(
                "you must provide an exchange name".to_owned(),
            ));
        }

        self.kind.as_ref().ok_or_else(|| {
            AmqpError::Configuration(format!(
                "you must provide an exchange type for exchange `{}`",
                self.name
            ))
        })
    }
}
