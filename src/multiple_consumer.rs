// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Multiple Queue Consumer
//!
//! Consumes several queues over one channel, each queue with its own callback.
//! Every queue gets its own consumer tag, `<tag>-<queue>`, which is how a delivery is
//! routed back to the callback of the queue it came from.

use crate::{
    channel::{AmqpChannel, AmqpConnection, ConsumeOptions},
    consumer::{default_consumer_tag, settle, MessageHandler, QueueConsumer},
    errors::AmqpError,
    events::{ConsumerEvents, TracingEvents},
    exchange::ExchangeSpec,
    fabric::FabricMember,
    message::{Delivery, MessageProcessed},
    otel,
    queue::{QosSpec, QueueSpec},
};
use async_trait::async_trait;
use opentelemetry::global::{self, BoxedTracer};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::debug;

/// Consumes several queues, each with its own callback.
pub struct MultipleConsumer {
    member: FabricMember,
    // One per queue, in `member.queues()` order.
    handlers: Vec<Arc<dyn MessageHandler>>,
    consumer_tag: Option<String>,
    // Per-queue consumer tag -> queue, filled when the subscriptions are made.
    routes: HashMap<String, String>,
    idle_timeout: Option<Duration>,
    events: Arc<dyn ConsumerEvents>,
    tracer: BoxedTracer,
}

impl MultipleConsumer {
    /// Creates a consumer without queues.
    ///
    /// # Parameters
    /// * `connection` - Connection the consumer's channel is opened from
    ///
    /// # Returns
    /// A consumer to add queues to with [`MultipleConsumer::add_queue`]
    pub fn new(connection: Arc<dyn AmqpConnection>) -> MultipleConsumer {
        MultipleConsumer {
            member: FabricMember::new(connection),
            handlers: vec![],
            consumer_tag: None,
            routes: HashMap::default(),
            idle_timeout: None,
            events: Arc::new(TracingEvents),
            tracer: global::tracer("amqp consumer"),
        }
    }

    /// Subscribes to `queue`, handing its deliveries to `handler`.
    ///
    /// # Parameters
    /// * `queue` - The consumed queue
    /// * `handler` - Callback of the queue's deliveries
    pub fn add_queue(&mut self, queue: QueueSpec, handler: Arc<dyn MessageHandler>) {
        self.member.add_queue(queue);
        self.handlers.push(handler);
    }

    pub fn set_exchange(&mut self, exchange: ExchangeSpec) {
        self.member.set_exchange(exchange);
    }

    pub fn set_routing_key(&mut self, routing_key: &str) {
        self.member.set_routing_key(routing_key);
    }

    pub fn set_qos(&mut self, qos: QosSpec) {
        self.member.set_qos(qos);
    }

    pub fn set_consumer_tag(&mut self, consumer_tag: &str) {
        self.consumer_tag = Some(consumer_tag.to_owned());
    }

    /// Zero disables the idle timeout.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout).filter(|t| !t.is_zero());
    }

    pub fn set_events(&mut self, events: Arc<dyn ConsumerEvents>) {
        self.events = events;
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

    /// Prefix of the per-queue consumer tags.
    pub fn consumer_tag(&self) -> String {
        self.consumer_tag.clone().unwrap_or_else(|| {
            let queues: Vec<&str> = self.member.queues().iter().map(|q| q.name.as_str()).collect();
            default_consumer_tag(&queues.join("_"))
        })
    }

    /// Consumer tag of the subscription on `queue`.
    pub fn queue_consumer_tag(&self, queue: &str) -> String {
        format!("{}-{}", self.consumer_tag(), queue)
    }

    /// Queue whose subscription uses `consumer_tag`.
    fn route(&self, consumer_tag: &str) -> Option<String> {
        if !self.routes.is_empty() {
            return self.routes.get(consumer_tag).cloned();
        }

        self.member
            .queues()
            .iter()
            .map(|q| q.name.clone())
            .find(|q| self.queue_consumer_tag(q) == consumer_tag)
    }

    /// Hands `delivery` to the callback registered for `queue` and acknowledges it.
    ///
    /// # Parameters
    /// * `queue` - Queue the delivery came from
    /// * `delivery` - The received message
    ///
    /// # Returns
    /// How the delivery was settled, [`AmqpError::QueueNotFound`] for a queue without
    /// callback, or the handler failure after the delivery was requeued
    pub async fn process_queue_message(
        &mut self,
        queue: &str,
        delivery: Delivery,
    ) -> Result<MessageProcessed, AmqpError> {
        let registered = self
            .member
            .queues()
            .iter()
            .zip(self.handlers.iter())
            .find(|(spec, _)| spec.name == queue)
            .map(|(spec, handler)| (spec.no_ack, handler.clone()));
        let Some((no_ack, handler)) = registered else {
            return Err(AmqpError::QueueNotFound(queue.to_owned()));
        };

        let (ctx, mut span) = otel::new_span(&delivery.properties, &self.tracer, queue);

        debug!("received: {} - queue: {}", delivery.delivery_tag, queue);
        self.events.on_consume(&delivery);

        let result = handler.handle(&ctx, &delivery).await;

        let channel = self.member.channel().await?;
        settle(
            channel.as_ref(),
            self.events.as_ref(),
            &mut span,
            &delivery,
            result,
            no_ack,
        )
        .await
    }
}

#[async_trait]
impl QueueConsumer for MultipleConsumer {
    fn queue_names(&self) -> Vec<String> {
        self.member.queues().iter().map(|q| q.name.clone()).collect()
    }

    fn owns_consumer_tag(&self, consumer_tag: &str) -> bool {
        self.route(consumer_tag).is_some()
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    fn set_routing_key(&mut self, routing_key: &str) {
        self.member.set_routing_key(routing_key);
    }

    fn attach_channel(&mut self, channel: Arc<dyn AmqpChannel>) {
        self.member.set_channel(channel);
    }

    async fn setup_fabric(&mut self) -> Result<(), AmqpError> {
        self.member.setup_fabric().await
    }

    async fn setup_consumer(&mut self) -> Result<(), AmqpError> {
        if self.member.is_auto_setup_fabric() {
            self.member.setup_fabric().await?;
        }
        self.member.qos_declare().await?;

        self.consumer_tag = Some(self.consumer_tag());
        self.routes.clear();

        let channel = self.member.channel().await?;
        for queue in self.member.queues() {
            let consumer_tag = self.queue_consumer_tag(&queue.name);
            channel
                .basic_consume(&queue.name, &consumer_tag, ConsumeOptions::from(queue))
                .await?;
            debug!(queue = %queue.name, consumer_tag = %consumer_tag, "consumer registered");
            self.routes.insert(consumer_tag, queue.name.clone());
        }

        Ok(())
    }

    async fn process_delivery(&mut self, delivery: Delivery) -> Result<MessageProcessed, AmqpError> {
        let Some(queue) = self.route(&delivery.consumer_tag) else {
            return Err(AmqpError::UnknownConsumerTag(delivery.consumer_tag.clone()));
        };

        self.process_queue_message(&queue, delivery).await
    }

    async fn stop_consuming(&mut self) -> Result<(), AmqpError> {
        let channel = self.member.channel().await?;
        for queue in self.queue_names() {
            channel
                .basic_cancel(&self.queue_consumer_tag(&queue))
                .await?;
        }
        Ok(())
    }

    async fn purge(&mut self) -> Result<u32, AmqpError> {
        let channel = self.member.channel().await?;
        let mut purged = 0;
        for queue in self.queue_names() {
            purged += channel.queue_purge(&queue).await?;
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::MockMessageHandler,
        message::ProcessOutcome,
        mocks::{ChannelCall, FakeConnection},
    };

    fn handler(times: usize) -> Arc<MockMessageHandler> {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(times)
            .returning(|_, _| Ok(ProcessOutcome::Ack));
        Arc::new(handler)
    }

    fn multiple_consumer(
        connection: &Arc<FakeConnection>,
        billing: Arc<MockMessageHandler>,
        shipping: Arc<MockMessageHandler>,
    ) -> MultipleConsumer {
        let mut consumer = MultipleConsumer::new(connection.clone());
        consumer.set_consumer_tag("worker");
        consumer.add_queue(QueueSpec::new("billing"), billing);
        consumer.add_queue(QueueSpec::new("shipping"), shipping);
        consumer
    }

    #[tokio::test]
    async fn test_setup_consumer_uses_per_queue_tags() {
        let connection = FakeConnection::new();
        let mut consumer = multiple_consumer(&connection, handler(0), handler(0));
        consumer.disable_auto_setup_fabric();

        consumer.setup_consumer().await.unwrap();

        assert_eq!(
            connection.channel().calls(),
            vec![
                ChannelCall::BasicConsume("billing".to_owned(), "worker-billing".to_owned()),
                ChannelCall::BasicConsume("shipping".to_owned(), "worker-shipping".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_delivery_is_routed_to_its_queue_only() {
        let connection = FakeConnection::new();
        let mut consumer = multiple_consumer(&connection, handler(0), handler(1));

        let res = consumer
            .process_delivery(Delivery::new(1, "worker-shipping", b"x"))
            .await;

        assert_eq!(res, Ok(MessageProcessed::Settled(ProcessOutcome::Ack)));
        assert_eq!(
            connection.channel().acknowledgements(),
            vec![ChannelCall::BasicAck(1)]
        );
    }

    #[tokio::test]
    async fn test_unregistered_queue_is_not_found() {
        let connection = FakeConnection::new();
        let mut consumer = multiple_consumer(&connection, handler(0), handler(0));

        let res = consumer
            .process_queue_message("invoices", Delivery::new(1, "worker-invoices", b"x"))
            .await;
        assert_eq!(res, Err(AmqpError::QueueNotFound("invoices".to_owned())));

        let res = consumer
            .process_delivery(Delivery::new(1, "worker-invoices", b"x"))
            .await;
        assert_eq!(
            res,
            Err(AmqpError::UnknownConsumerTag("worker-invoices".to_owned()))
        );
        assert!(connection.channel().calls().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_consumer_tag() {
        let connection = FakeConnection::new();
        let mut consumer = multiple_consumer(&connection, handler(0), handler(0));

        assert!(consumer.owns_consumer_tag("worker-billing"));
        assert!(!consumer.owns_consumer_tag("other-billing"));
        assert!(!consumer.owns_consumer_tag("worker-audit"));

        let res = consumer
            .process_delivery(Delivery::new(1, "other-billing", b"x"))
            .await;
        assert_eq!(
            res,
            Err(AmqpError::UnknownConsumerTag("other-billing".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_routes_are_exact_after_setup() {
        let connection = FakeConnection::new();
        let mut consumer = multiple_consumer(&connection, handler(1), handler(0));
        consumer.disable_auto_setup_fabric();
        consumer.setup_consumer().await.unwrap();

        assert!(consumer.owns_consumer_tag("worker-shipping"));
        assert!(!consumer.owns_consumer_tag("worker-ship"));
        assert!(!consumer.owns_consumer_tag("worker-shipping-eu"));

        let res = consumer
            .process_delivery(Delivery::new(1, "worker-billing", b"x"))
            .await;
        assert_eq!(res, Ok(MessageProcessed::Settled(ProcessOutcome::Ack)));
    }

    #[tokio::test]
    async fn test_stop_consuming_cancels_every_queue() {
        let connection = FakeConnection::new();
        let mut consumer = multiple_consumer(&connection, handler(0), handler(0));
        connection.channel().set_purge_count(2);

        consumer.stop_consuming().await.unwrap();
        assert_eq!(consumer.purge().await, Ok(4));

        assert_eq!(
            connection.channel().calls(),
            vec![
                ChannelCall::BasicCancel("worker-billing".to_owned()),
                ChannelCall::BasicCancel("worker-shipping".to_owned()),
                ChannelCall::QueuePurge("billing".to_owned()),
                ChannelCall::QueuePurge("shipping".to_owned()),
            ]
        );
    }
}
