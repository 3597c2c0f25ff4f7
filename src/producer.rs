// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! Publishes messages to the producer's exchange. The current OpenTelemetry context
//! travels in the message headers. With publisher confirms enabled every publish
//! waits for the broker's answer and surfaces nacks and unroutable returns as
//! distinct errors.

use crate::{
    channel::{AmqpConnection, Confirmation, REPLY_CODE_NO_ROUTE},
    errors::AmqpError,
    exchange::ExchangeSpec,
    fabric::FabricMember,
    message::{merge_properties, DELIVERY_MODE_PERSISTENT, TEXT_CONTENT_TYPE},
    otel,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes messages to an exchange with a default routing key and base properties.
pub struct Producer {
    member: FabricMember,
    content_type: String,
    delivery_mode: u8,
    publisher_confirms: bool,
    confirms_selected: bool,
}

impl Producer {
    /// Creates a producer publishing to the default exchange.
    ///
    /// # Parameters
    /// * `connection` - Connection the producer's channel is opened from
    ///
    /// # Returns
    /// A persistent `text/plain` producer without publisher confirms
    pub fn new(connection: Arc<dyn AmqpConnection>) -> Producer {
        Producer {
            member: FabricMember::new(connection),
            content_type: TEXT_CONTENT_TYPE.to_owned(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            publisher_confirms: false,
            confirms_selected: false,
        }
    }

    /// Exchange messages are published to, declared with the producer's fabric.
    pub fn set_exchange(&mut self, exchange: ExchangeSpec) {
        self.member.set_exchange(exchange);
    }

    /// Routing key used when `publish` is called without one.
    pub fn set_routing_key(&mut self, routing_key: &str) {
        self.member.set_routing_key(routing_key);
    }

    /// Content type of the base properties.
    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_owned();
    }

    /// Delivery mode of the base properties: 1 transient, 2 persistent.
    pub fn set_delivery_mode(&mut self, delivery_mode: u8) {
        self.delivery_mode = delivery_mode;
    }

    /// Waits for the broker to confirm every publish; unroutable messages fail.
    pub fn enable_publisher_confirms(&mut self) {
        self.publisher_confirms = true;
    }

    pub fn disable_auto_setup_fabric(&mut self) {
        self.member.disable_auto_setup_fabric();
    }

    pub fn member(&self) -> &FabricMember {
        &self.member
    }

    pub fn member_mut(&mut self) -> &mut FabricMember {
        &mut self.member
    }

    /// Declares the producer's exchange and queues.
    pub async fn setup_fabric(&mut self) -> Result<(), AmqpError> {
        self.member.setup_fabric().await
    }

    /// Publishes `body` carrying the current trace context.
    ///
    /// # Parameters
    /// * `body` - Message payload
    /// * `routing_key` - Routing key, the producer's default one when `None`
    /// * `properties` - Properties overriding the base ones
    ///
    /// # Returns
    /// Ok(()) once published (and confirmed, with publisher confirms)
    pub async fn publish(
        &mut self,
        body: &[u8],
        routing_key: Option<&str>,
        properties: Option<BasicProperties>,
    ) -> Result<(), AmqpError> {
        self.publish_with_context(&Context::current(), body, routing_key, properties)
            .await
    }

    /// Publishes `body` carrying the trace context of `ctx`.
    ///
    /// An explicit `routing_key` wins over the producer's default one; properties in
    /// `properties` win over the producer's content type, delivery mode and message id.
    pub async fn publish_with_context(
        &mut self,
        ctx: &Context,
        body: &[u8],
        routing_key: Option<&str>,
        properties: Option<BasicProperties>,
    ) -> Result<(), AmqpError> {
        if self.member.is_auto_setup_fabric() {
            self.member.setup_fabric().await?;
        }

        if self.publisher_confirms {
            self.configure_publisher_confirms().await?;
        }

        let exchange = self.member.exchange_name().to_owned();
        let routing_key = routing_key.unwrap_or(self.member.routing_key()).to_owned();

        let mut headers = BTreeMap::new();
        otel::inject_context(ctx, &mut headers);

        let base = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_delivery_mode(self.delivery_mode)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        let properties = match properties {
            Some(overrides) => merge_properties(base, &overrides),
            None => base,
        };

        let channel = self.member.channel().await?;
        let confirmation = channel
            .basic_publish(
                &exchange,
                &routing_key,
                body,
                properties,
                self.publisher_confirms,
            )
            .await?;

        match confirmation {
            Confirmation::NotRequested | Confirmation::Ack => {
                debug!(exchange = %exchange, routing_key = %routing_key, "message published");
                Ok(())
            }
            Confirmation::Nack => {
                error!(exchange = %exchange, "broker nacked the message");
                Err(AmqpError::FailedToPublishMessage { exchange })
            }
            Confirmation::Returned {
                reply_code: REPLY_CODE_NO_ROUTE,
                ..
            } => {
                error!(exchange = %exchange, routing_key = %routing_key, "unroutable message");
                Err(AmqpError::UnroutableMessage {
                    exchange,
                    routing_key,
                })
            }
            Confirmation::Returned {
                reply_code,
                reply_text,
            } => {
                error!(
                    exchange = %exchange,
                    reply_code = reply_code,
                    reply_text = %reply_text,
                    "broker returned the message"
                );
                Err(AmqpError::FailedToPublishMessage { exchange })
            }
        }
    }

    /// Closes the producer's channel.
    /// Closes the producer's channel.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        self.member.close().await
    }

    async fn configure_publisher_confirms(&mut self) -> Result<(), AmqpError> {
        if self.confirms_selected {
            return Ok(());
        }

        self.member.channel().await?.confirm_select().await?;
        debug!("publisher confirms enabled");

        self.confirms_selected = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::JSON_CONTENT_TYPE,
        mocks::{ChannelCall, FakeConnection},
    };

    fn producer(connection: &Arc<FakeConnection>) -> Producer {
        let mut producer = Producer::new(connection.clone());
        producer.set_exchange(ExchangeSpec::new("orders").topic());
        producer.set_routing_key("order.created");
        producer
    }

    #[tokio::test]
    async fn test_publish_uses_default_routing_key() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);

        producer.publish(b"{}", None, None).await.unwrap();
        producer.publish(b"{}", Some("x"), None).await.unwrap();

        let published = connection.channel().published();
        assert_eq!(published[0].routing_key, "order.created");
        assert_eq!(published[1].routing_key, "x");
        assert_eq!(published[0].exchange, "orders");
    }

    #[tokio::test]
    async fn test_publish_sets_up_fabric_once() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);

        producer.publish(b"a", None, None).await.unwrap();
        producer.publish(b"b", None, None).await.unwrap();

        let declares = connection
            .channel()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ChannelCall::ExchangeDeclare(_)))
            .count();
        assert_eq!(declares, 1);
    }

    #[tokio::test]
    async fn test_publish_without_auto_setup_fabric() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);
        producer.disable_auto_setup_fabric();

        producer.publish(b"a", None, None).await.unwrap();

        assert_eq!(
            connection.channel().calls(),
            vec![ChannelCall::BasicPublish {
                exchange: "orders".to_owned(),
                routing_key: "order.created".to_owned(),
                mandatory: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_default_properties_and_overrides() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);

        producer.publish(b"a", None, None).await.unwrap();
        let overrides =
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE));
        producer.publish(b"b", None, Some(overrides)).await.unwrap();

        let published = connection.channel().published();
        let defaults = &published[0].properties;
        assert_eq!(
            defaults.content_type(),
            &Some(ShortString::from(TEXT_CONTENT_TYPE))
        );
        assert_eq!(defaults.delivery_mode(), &Some(DELIVERY_MODE_PERSISTENT));
        assert!(defaults.message_id().is_some());

        let overridden = &published[1].properties;
        assert_eq!(
            overridden.content_type(),
            &Some(ShortString::from(JSON_CONTENT_TYPE))
        );
        assert_eq!(overridden.delivery_mode(), &Some(DELIVERY_MODE_PERSISTENT));
    }

    #[tokio::test]
    async fn test_confirm_mode_is_selected_once() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);
        producer.enable_publisher_confirms();

        producer.publish(b"a", None, None).await.unwrap();
        producer.publish(b"b", None, None).await.unwrap();

        let calls = connection.channel().calls();
        let selects = calls
            .iter()
            .filter(|c| **c == ChannelCall::ConfirmSelect)
            .count();
        assert_eq!(selects, 1);
        assert!(connection.channel().published().iter().all(|p| p.mandatory));
    }

    #[tokio::test]
    async fn test_broker_nack_fails_publish() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);
        producer.enable_publisher_confirms();
        connection.channel().push_confirmation(Confirmation::Nack);

        let res = producer.publish(b"a", None, None).await;

        assert_eq!(
            res,
            Err(AmqpError::FailedToPublishMessage {
                exchange: "orders".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn test_no_route_return_fails_publish() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);
        producer.enable_publisher_confirms();
        connection.channel().push_confirmation(Confirmation::Returned {
            reply_code: REPLY_CODE_NO_ROUTE,
            reply_text: "NO_ROUTE".to_owned(),
        });

        let res = producer.publish(b"a", Some("order.unknown"), None).await;

        assert_eq!(
            res,
            Err(AmqpError::UnroutableMessage {
                exchange: "orders".to_owned(),
                routing_key: "order.unknown".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn test_other_return_fails_publish() {
        let connection = FakeConnection::new();
        let mut producer = producer(&connection);
        producer.enable_publisher_confirms();
        connection.channel().push_confirmation(Confirmation::Returned {
            reply_code: 313,
            reply_text: "NO_CONSUMERS".to_owned(),
        });

        let res = producer.publish(b"a", None, None).await;

        assert!(matches!(
            res,
            Err(AmqpError::FailedToPublishMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_exchange_publish() {
        let connection = FakeConnection::new();
        let mut producer = Producer::new(connection.clone());

        producer.publish(b"a", Some("billing"), None).await.unwrap();

        let published = connection.channel().published();
        assert_eq!(published[0].exchange, "");
        assert_eq!(published[0].routing_key, "billing");
    }
}
