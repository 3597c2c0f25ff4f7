// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module provides the single-queue [`Consumer`] together with the pieces every
//! consumer shares: the [`MessageHandler`] callback trait, the [`QueueConsumer`]
//! dispatch interface driven by the runner, and the acknowledgement logic that turns
//! a handler result into exactly one broker acknowledgement.
//!
//! Acknowledgement always happens before a handler failure propagates, so the broker
//! never disagrees with what the program already committed to.

use crate::{
    channel::{AmqpChannel, AmqpConnection, ConsumeOptions},
    errors::AmqpError,
    events::{ConsumerEvents, TracingEvents},
    exchange::ExchangeSpec,
    fabric::FabricMember,
    message::{Delivery, MessageProcessed, ProcessOutcome},
    otel,
    queue::{QosSpec, QueueSpec},
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
#[cfg(all(feature = "mocks", not(test)))]
use mockall::automock;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    sync::{Arc, OnceLock},
    time::Duration,
};
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Failure raised by a [`MessageHandler`].
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum HandlerError {
    /// Stop consuming after acknowledging the current delivery with the given outcome.
    #[error("consumer termination requested")]
    Terminate(ProcessOutcome),

    /// The message could not be processed; it is requeued and the error propagated.
    #[error("{0}")]
    Failure(String),
}

impl HandlerError {
    /// Terminate with the default outcome, `RejectRequeue`.
    pub fn terminate() -> HandlerError {
        HandlerError::Terminate(ProcessOutcome::RejectRequeue)
    }

    /// A processing failure described by `msg`.
    pub fn failure(msg: impl Into<String>) -> HandlerError {
        HandlerError::Failure(msg.into())
    }
}

/// The user callback a queue's deliveries are handed to.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context extracted from the message headers
    /// * `delivery` - The received message
    ///
    /// # Returns
    /// The outcome the delivery is acknowledged with, or a [`HandlerError`]
    async fn handle(&self, ctx: &Context, delivery: &Delivery)
        -> Result<ProcessOutcome, HandlerError>;
}

/// A consumer as seen by the runner.
///
/// Deliveries are routed to the consumer owning their consumer tag.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Names of the queues the consumer subscribes to.
    fn queue_names(&self) -> Vec<String>;

    /// Whether deliveries carrying `consumer_tag` belong to this consumer.
    fn owns_consumer_tag(&self, consumer_tag: &str) -> bool;

    /// Idle timeout configured for this consumer, if any.
    fn idle_timeout(&self) -> Option<Duration>;

    /// Overrides the routing key unbound queues are bound with.
    fn set_routing_key(&mut self, routing_key: &str);

    /// Makes the consumer use `channel` instead of opening its own.
    fn attach_channel(&mut self, channel: Arc<dyn AmqpChannel>);

    /// Declares the consumer's exchange, queues and bindings.
    async fn setup_fabric(&mut self) -> Result<(), AmqpError>;

    /// Declares fabric (when enabled) and QoS, then subscribes to the consumer's queues.
    async fn setup_consumer(&mut self) -> Result<(), AmqpError>;

    /// Hands `delivery` to its callback and acknowledges it.
    async fn process_delivery(&mut self, delivery: Delivery)
        -> Result<MessageProcessed, AmqpError>;

    /// Cancels the consumer's subscriptions.
    async fn stop_consuming(&mut self) -> Result<(), AmqpError>;

    /// Purges the consumer's queues and returns the number of messages removed.
    async fn purge(&mut self) -> Result<u32, AmqpError>;
}

static HOST_NAME: OnceLock<String> = OnceLock::new();

/// Consumer tag unique across processes sharing a queue: `<host>_<pid>_<queue>`.
pub(crate) fn default_consumer_tag(queue: &str) -> String {
    let host = HOST_NAME
        .get_or_init(|| System::host_name().unwrap_or_else(|| "localhost".to_owned()));
    format!("{}_{}_{}", host, std::process::id(), queue)
}

/// Sends the acknowledgement primitive selected by `outcome`.
///
/// With `no_ack` the broker already considers the delivery settled and nothing is sent.
pub(crate) async fn acknowledge(
    channel: &dyn AmqpChannel,
    events: &dyn ConsumerEvents,
    delivery: &Delivery,
    outcome: ProcessOutcome,
    no_ack: bool,
) -> Result<(), AmqpError> {
    let tag = delivery.delivery_tag;

    if !no_ack {
        match outcome {
            ProcessOutcome::Ack => channel.basic_ack(tag).await?,
            ProcessOutcome::Reject => channel.basic_reject(tag, false).await?,
            ProcessOutcome::RejectRequeue => channel.basic_reject(tag, true).await?,
            ProcessOutcome::NackRequeue => channel.basic_nack(tag, true).await?,
        }
    }

    match outcome {
        ProcessOutcome::Ack => events.on_ack(delivery),
        _ => events.on_reject(delivery, outcome),
    }
    events.on_message_processed(delivery, outcome);

    Ok(())
}

/// Acknowledges `delivery` according to the handler `result`.
pub(crate) async fn settle(
    channel: &dyn AmqpChannel,
    events: &dyn ConsumerEvents,
    span: &mut BoxedSpan,
    delivery: &Delivery,
    result: Result<ProcessOutcome, HandlerError>,
    no_ack: bool,
) -> Result<MessageProcessed, AmqpError> {
    let processed = match result {
        Ok(outcome) => MessageProcessed::Settled(outcome),
        Err(HandlerError::Terminate(outcome)) => {
            debug!(delivery_tag = delivery.delivery_tag, "handler requested termination");
            MessageProcessed::Terminated(outcome)
        }
        Err(HandlerError::Failure(msg)) => {
            warn!(error = %msg, "error whiling handling msg, requeuing");

            if let Err(err) = acknowledge(
                channel,
                events,
                delivery,
                ProcessOutcome::RejectRequeue,
                no_ack,
            )
            .await
            {
                error!(error = err.to_string(), "error whiling requeuing msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to requeue msg"),
                });
                return Err(err);
            }

            let err = AmqpError::HandlerError(msg);
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            return Err(err);
        }
    };

    match acknowledge(channel, events, delivery, processed.outcome(), no_ack).await {
        Ok(()) => {
            span.set_status(Status::Ok);
            Ok(processed)
        }
        Err(err) => {
            error!(error = err.to_string(), "error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(err)
        }
    }
}

/// Consumes a single queue with one callback.
pub struct Consumer {
    member: FabricMember,
    handler: Arc<dyn MessageHandler>,
    consumer_tag: Option<String>,
    idle_timeout: Option<Duration>,
    events: Arc<dyn ConsumerEvents>,
    tracer: BoxedTracer,
}

impl Consumer {
    /// Creates a consumer of `queue`.
    ///
    /// # Parameters
    /// * `connection` - Connection the consumer's channel is opened from
    /// * `queue` - The consumed queue
    /// * `handler` - Callback every delivery is handed to
    ///
    /// # Returns
    /// A consumer with the default consumer tag and [`TracingEvents`]
    pub fn new(
        connection: Arc<dyn AmqpConnection>,
        queue: QueueSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Consumer {
        let mut member = FabricMember::new(connection);
        member.add_queue(queue);

        Consumer {
            member,
            handler,
            consumer_tag: None,
            idle_timeout: None,
            events: Arc::new(TracingEvents),
            tracer: global::tracer("amqp consumer"),
        }
    }

    /// Exchange the queue is bound to when it has no explicit bindings.
    pub fn set_exchange(&mut self, exchange: ExchangeSpec) {
        self.member.set_exchange(exchange);
    }

    /// Routing key used to bind the queue when it has no explicit bindings.
    pub fn set_routing_key(&mut self, routing_key: &str) {
        self.member.set_routing_key(routing_key);
    }

    /// Prefetch settings declared before subscribing.
    pub fn set_qos(&mut self, qos: QosSpec) {
        self.member.set_qos(qos);
    }

    /// Replaces the default `<host>_<pid>_<queue>` consumer tag.
    pub fn set_consumer_tag(&mut self, consumer_tag: &str) {
        self.consumer_tag = Some(consumer_tag.to_owned());
    }

    /// Sets how long a runner of this consumer waits for a delivery before emitting
    /// an idle timeout. Zero disables it.
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

    pub fn queue(&self) -> Option<&QueueSpec> {
        self.member.queues().first()
    }

    pub fn queue_name(&self) -> String {
        self.queue().map(|q| q.name.clone()).unwrap_or_default()
    }

    /// The consumer tag used to subscribe, resolved once the consumer is set up.
    pub fn consumer_tag(&self) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| default_consumer_tag(&self.queue_name()))
    }

    fn no_ack(&self) -> bool {
        self.queue().is_some_and(|q| q.no_ack)
    }

    /// Hands `delivery` to the callback and acknowledges it with the callback's outcome.
    pub async fn process_message(&mut self, delivery: Delivery) -> Result<MessageProcessed, AmqpError> {
        let (ctx, mut span) = otel::new_span(&delivery.properties, &self.tracer, &self.queue_name());

        debug!(
            "received: {} - exchange: {}",
            delivery.delivery_tag, delivery.exchange
        );
        self.events.on_consume(&delivery);

        let result = self.handler.handle(&ctx, &delivery).await;

        let channel = self.member.channel().await?;
        settle(
            channel.as_ref(),
            self.events.as_ref(),
            &mut span,
            &delivery,
            result,
            self.no_ack(),
        )
        .await
    }

    /// Acknowledges `delivery` with `outcome`.
    pub async fn handle_process_message(
        &mut self,
        delivery: &Delivery,
        outcome: ProcessOutcome,
    ) -> Result<(), AmqpError> {
        let channel = self.member.channel().await?;
        acknowledge(
            channel.as_ref(),
            self.events.as_ref(),
            delivery,
            outcome,
            self.no_ack(),
        )
        .await
    }

    /// Acknowledges `delivery` with an integer outcome code.
    ///
    /// An unknown code fails with [`AmqpError::InvalidProcessOutcome`] without any broker call.
    pub async fn handle_process_message_code(
        &mut self,
        delivery: &Delivery,
        code: i32,
    ) -> Result<(), AmqpError> {
        let outcome = ProcessOutcome::try_from(code)?;
        self.handle_process_message(delivery, outcome).await
    }
}

#[async_trait]
impl QueueConsumer for Consumer {
    fn queue_names(&self) -> Vec<String> {
        vec![self.queue_name()]
    }

    fn owns_consumer_tag(&self, consumer_tag: &str) -> bool {
        self.consumer_tag() == consumer_tag
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

        let Some(queue) = self.queue().cloned() else {
            return Err(AmqpError::Configuration(
                "you must provide a queue name".to_owned(),
            ));
        };

        let consumer_tag = self.consumer_tag();
        self.consumer_tag = Some(consumer_tag.clone());
        self.member
            .channel()
            .await?
            .basic_consume(&queue.name, &consumer_tag, ConsumeOptions::from(&queue))
            .await?;

        debug!(queue = %queue.name, consumer_tag = %consumer_tag, "consumer registered");
        Ok(())
    }

    async fn process_delivery(&mut self, delivery: Delivery) -> Result<MessageProcessed, AmqpError> {
        self.process_message(delivery).await
    }

    async fn stop_consuming(&mut self) -> Result<(), AmqpError> {
        let consumer_tag = self.consumer_tag();
        self.member.channel().await?.basic_cancel(&consumer_tag).await
    }

    async fn purge(&mut self) -> Result<u32, AmqpError> {
        let queue = self.queue_name();
        self.member.channel().await?.queue_purge(&queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ChannelCall, Event, FakeConnection, RecordingEvents};

    fn consumer(connection: &Arc<FakeConnection>, handler: MockMessageHandler) -> Consumer {
        let mut consumer = Consumer::new(
            connection.clone(),
            QueueSpec::new("billing"),
            Arc::new(handler),
        );
        consumer.set_consumer_tag("billing-tag");
        consumer
    }

    fn handler_returning(result: Result<ProcessOutcome, HandlerError>) -> MockMessageHandler {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(move |_, _| result.clone());
        handler
    }

    #[tokio::test]
    async fn test_outcomes_map_to_one_acknowledgement() {
        let cases = vec![
            (ProcessOutcome::Ack, ChannelCall::BasicAck(7)),
            (ProcessOutcome::Reject, ChannelCall::BasicReject(7, false)),
            (ProcessOutcome::RejectRequeue, ChannelCall::BasicReject(7, true)),
            (ProcessOutcome::NackRequeue, ChannelCall::BasicNack(7, true)),
        ];

        for (outcome, expected) in cases {
            let connection = FakeConnection::new();
            let mut consumer = consumer(&connection, MockMessageHandler::new());

            consumer
                .handle_process_message(&Delivery::new(7, "billing-tag", b""), outcome)
                .await
                .unwrap();

            assert_eq!(connection.channel().acknowledgements(), vec![expected]);
        }
    }

    #[tokio::test]
    async fn test_invalid_outcome_code_makes_no_broker_call() {
        let connection = FakeConnection::new();
        let mut consumer = consumer(&connection, MockMessageHandler::new());

        let res = consumer
            .handle_process_message_code(&Delivery::new(7, "billing-tag", b""), 42)
            .await;

        assert_eq!(res, Err(AmqpError::InvalidProcessOutcome(42)));
        assert!(connection.channel().calls().is_empty());
    }

    #[tokio::test]
    async fn test_outcome_code_is_accepted() {
        let connection = FakeConnection::new();
        let mut consumer = consumer(&connection, MockMessageHandler::new());

        consumer
            .handle_process_message_code(&Delivery::new(7, "billing-tag", b""), -1)
            .await
            .unwrap();

        assert_eq!(
            connection.channel().acknowledgements(),
            vec![ChannelCall::BasicReject(7, false)]
        );
    }

    #[tokio::test]
    async fn test_handler_failure_is_requeued_before_propagating() {
        let connection = FakeConnection::new();
        let handler = handler_returning(Err(HandlerError::failure("boom")));
        let mut consumer = consumer(&connection, handler);

        let res = consumer
            .process_message(Delivery::new(3, "billing-tag", b"x"))
            .await;

        assert_eq!(res, Err(AmqpError::HandlerError("boom".to_owned())));
        assert_eq!(
            connection.channel().acknowledgements(),
            vec![ChannelCall::BasicReject(3, true)]
        );
    }

    #[tokio::test]
    async fn test_terminate_acknowledges_with_requested_outcome() {
        let connection = FakeConnection::new();
        let handler = handler_returning(Err(HandlerError::Terminate(ProcessOutcome::Ack)));
        let mut consumer = consumer(&connection, handler);

        let res = consumer
            .process_message(Delivery::new(3, "billing-tag", b"x"))
            .await;

        assert_eq!(res, Ok(MessageProcessed::Terminated(ProcessOutcome::Ack)));
        assert_eq!(
            connection.channel().acknowledgements(),
            vec![ChannelCall::BasicAck(3)]
        );
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let connection = FakeConnection::new();
        let events = RecordingEvents::new();
        let handler = handler_returning(Ok(ProcessOutcome::NackRequeue));
        let mut consumer = consumer(&connection, handler);
        consumer.set_events(events.clone());

        consumer
            .process_message(Delivery::new(5, "billing-tag", b"x"))
            .await
            .unwrap();

        assert_eq!(
            events.events(),
            vec![
                Event::Consume(5),
                Event::Reject(5, ProcessOutcome::NackRequeue),
                Event::Processed(5, ProcessOutcome::NackRequeue),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_ack_queue_sends_no_acknowledgement() {
        let connection = FakeConnection::new();
        let mut consumer = Consumer::new(
            connection.clone(),
            QueueSpec::new("billing").no_ack(),
            Arc::new(handler_returning(Ok(ProcessOutcome::Ack))),
        );

        consumer
            .process_message(Delivery::new(5, "tag", b"x"))
            .await
            .unwrap();

        assert!(connection.channel().acknowledgements().is_empty());
    }

    #[tokio::test]
    async fn test_setup_consumer() {
        let connection = FakeConnection::new();
        let mut consumer = consumer(&connection, MockMessageHandler::new());
        consumer.set_exchange(ExchangeSpec::new("orders"));
        consumer.set_routing_key("order.*");
        consumer.set_qos(QosSpec::new(0, 5));

        consumer.setup_consumer().await.unwrap();

        assert_eq!(
            connection.channel().calls(),
            vec![
                ChannelCall::ExchangeDeclare("orders".to_owned()),
                ChannelCall::QueueDeclare("billing".to_owned()),
                ChannelCall::QueueBind(
                    "billing".to_owned(),
                    "orders".to_owned(),
                    "order.*".to_owned()
                ),
                ChannelCall::BasicQos(0, 5),
                ChannelCall::BasicConsume("billing".to_owned(), "billing-tag".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_consuming_and_purge() {
        let connection = FakeConnection::new();
        let mut consumer = consumer(&connection, MockMessageHandler::new());
        connection.channel().set_purge_count(4);

        consumer.stop_consuming().await.unwrap();
        assert_eq!(consumer.purge().await, Ok(4));

        assert_eq!(
            connection.channel().calls(),
            vec![
                ChannelCall::BasicCancel("billing-tag".to_owned()),
                ChannelCall::QueuePurge("billing".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_default_consumer_tag_is_kept_after_subscribing() {
        let connection = FakeConnection::new();
        let mut consumer = Consumer::new(
            connection.clone(),
            QueueSpec::new("billing"),
            Arc::new(MockMessageHandler::new()),
        );
        consumer.disable_auto_setup_fabric();

        consumer.setup_consumer().await.unwrap();
        let tag = consumer.consumer_tag();

        assert_eq!(
            connection.channel().calls(),
            vec![ChannelCall::BasicConsume("billing".to_owned(), tag.clone())]
        );
        assert!(consumer.owns_consumer_tag(&tag));
        assert_eq!(consumer.consumer_tag, Some(tag));
    }

    #[test]
    fn test_default_consumer_tag_ends_with_pid_and_queue() {
        let connection = FakeConnection::new();
        let consumer = Consumer::new(
            connection,
            QueueSpec::new("billing"),
            Arc::new(MockMessageHandler::new()),
        );

        let suffix = format!("_{}_billing", std::process::id());
        assert!(consumer.consumer_tag().ends_with(&suffix));
    }
}
