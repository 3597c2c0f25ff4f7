// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker Doubles
//!
//! `FakeConnection` hands out one shared `FakeChannel` which records every broker
//! primitive it receives and replays a scripted sequence of wait results
//! (deliveries, idle timeouts, failures). `RecordingEvents` captures notifications.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Confirmation, ConsumeOptions},
    errors::AmqpError,
    events::ConsumerEvents,
    exchange::ExchangeSpec,
    message::{Delivery, ProcessOutcome},
    queue::{QosSpec, QueueSpec},
};
use async_trait::async_trait;
use lapin::BasicProperties;
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

/// A broker primitive received by a [`FakeChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    ExchangeDeclare(String),
    QueueDeclare(String),
    QueueBind(String, String, String),
    BasicQos(u32, u16),
    ConfirmSelect,
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
    },
    BasicConsume(String, String),
    BasicCancel(String),
    QueuePurge(String),
    BasicAck(u64),
    BasicReject(u64, bool),
    BasicNack(u64, bool),
    Close,
}

impl ChannelCall {
    /// Whether the call settles a delivery (ack, reject or nack).
    pub fn is_acknowledgement(&self) -> bool {
        matches!(
            self,
            ChannelCall::BasicAck(_) | ChannelCall::BasicReject(..) | ChannelCall::BasicNack(..)
        )
    }
}

/// A message published through a [`FakeChannel`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub mandatory: bool,
}

/// One scripted result of [`AmqpChannel::next_delivery`].
#[derive(Debug, Clone)]
pub enum WaitEvent {
    Deliver(Delivery),
    Timeout,
    Fail(AmqpError),
    /// The wait never completes, like an idle broker without an idle timeout.
    Pending,
}

#[derive(Default)]
struct ChannelState {
    calls: Vec<ChannelCall>,
    published: Vec<PublishedMessage>,
    script: VecDeque<WaitEvent>,
    confirmations: VecDeque<Confirmation>,
    consumer_tags: HashSet<String>,
    failures: VecDeque<AmqpError>,
    delayed_failure: Option<(usize, AmqpError)>,
    confirm_mode: bool,
    purge_count: u32,
}

#[derive(Default)]
pub struct FakeChannel {
    state: Mutex<ChannelState>,
}

impl FakeChannel {
    pub fn new() -> Arc<FakeChannel> {
        Arc::new(FakeChannel::default())
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `call`, or fails with the next queued failure without recording it.
    fn record(&self, call: ChannelCall) -> Result<(), AmqpError> {
        let mut state = self.state();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        match state.delayed_failure.take() {
            Some((0, err)) => return Err(err),
            Some((remaining, err)) => state.delayed_failure = Some((remaining - 1, err)),
            None => {}
        }
        state.calls.push(call);
        Ok(())
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.state().calls.clone()
    }

    pub fn acknowledgements(&self) -> Vec<ChannelCall> {
        self.calls()
            .into_iter()
            .filter(ChannelCall::is_acknowledgement)
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// The next broker primitive fails with `err`.
    pub fn fail_next(&self, err: AmqpError) {
        self.state().failures.push_back(err);
    }

    /// The broker primitive after the next `successes` ones fails with `err`.
    pub fn fail_after(&self, successes: usize, err: AmqpError) {
        self.state().delayed_failure = Some((successes, err));
    }

    pub fn push_delivery(&self, delivery: Delivery) {
        self.state().script.push_back(WaitEvent::Deliver(delivery));
    }

    pub fn push_timeout(&self) {
        self.state().script.push_back(WaitEvent::Timeout);
    }

    pub fn push_failure(&self, err: AmqpError) {
        self.state().script.push_back(WaitEvent::Fail(err));
    }

    /// The next wait blocks until the caller stops polling it.
    pub fn push_pending(&self) {
        self.state().script.push_back(WaitEvent::Pending);
    }

    /// The broker's answer to the next confirmed publish.
    pub fn push_confirmation(&self, confirmation: Confirmation) {
        self.state().confirmations.push_back(confirmation);
    }

    pub fn set_purge_count(&self, count: u32) {
        self.state().purge_count = count;
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        self.record(ChannelCall::ExchangeDeclare(spec.name.clone()))
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<String, AmqpError> {
        self.record(ChannelCall::QueueDeclare(spec.name.clone()))?;
        if spec.name.is_empty() {
            return Ok("amq.gen-fake".to_owned());
        }
        Ok(spec.name.clone())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.record(ChannelCall::QueueBind(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ))
    }

    async fn basic_qos(&self, qos: &QosSpec) -> Result<(), AmqpError> {
        self.record(ChannelCall::BasicQos(qos.prefetch_size, qos.prefetch_count))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.record(ChannelCall::ConfirmSelect)?;
        self.state().confirm_mode = true;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<Confirmation, AmqpError> {
        self.record(ChannelCall::BasicPublish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
        })?;

        let mut state = self.state();
        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            properties,
            mandatory,
        });

        if !state.confirm_mode {
            return Ok(Confirmation::NotRequested);
        }
        Ok(state.confirmations.pop_front().unwrap_or(Confirmation::Ack))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: ConsumeOptions,
    ) -> Result<(), AmqpError> {
        self.record(ChannelCall::BasicConsume(
            queue.to_owned(),
            consumer_tag.to_owned(),
        ))?;
        self.state().consumer_tags.insert(consumer_tag.to_owned());
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.record(ChannelCall::BasicCancel(consumer_tag.to_owned()))?;
        self.state().consumer_tags.remove(consumer_tag);
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.record(ChannelCall::QueuePurge(queue.to_owned()))?;
        Ok(self.state().purge_count)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record(ChannelCall::BasicAck(delivery_tag))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(ChannelCall::BasicReject(delivery_tag, requeue))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(ChannelCall::BasicNack(delivery_tag, requeue))
    }

    /// Replays the script; an exhausted script behaves like a closed channel.
    async fn next_delivery(&self, _timeout: Option<Duration>) -> Result<Delivery, AmqpError> {
        let next = self.state().script.pop_front();
        match next {
            Some(WaitEvent::Deliver(delivery)) => Ok(delivery),
            Some(WaitEvent::Timeout) => Err(AmqpError::Timeout),
            Some(WaitEvent::Fail(err)) => Err(err),
            Some(WaitEvent::Pending) => std::future::pending().await,
            None => Err(AmqpError::ChannelClosed),
        }
    }

    fn active_consumers(&self) -> usize {
        self.state().consumer_tags.len()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.record(ChannelCall::Close)
    }
}

/// Connection double; every opened channel is the same shared [`FakeChannel`].
pub struct FakeConnection {
    channel: Arc<FakeChannel>,
    opened: AtomicUsize,
}

impl FakeConnection {
    pub fn new() -> Arc<FakeConnection> {
        Arc::new(FakeConnection {
            channel: FakeChannel::new(),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn channel(&self) -> Arc<FakeChannel> {
        self.channel.clone()
    }

    pub fn opened_channels(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.channel.clone())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// A notification captured by [`RecordingEvents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Stop,
    Timeout,
    Error(AmqpError),
    Consume(u64),
    Ack(u64),
    Reject(u64, ProcessOutcome),
    Processed(u64, ProcessOutcome),
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<RecordingEvents> {
        Arc::new(RecordingEvents::default())
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl ConsumerEvents for RecordingEvents {
    fn on_start(&self) {
        self.push(Event::Start);
    }

    fn on_stop(&self) {
        self.push(Event::Stop);
    }

    fn on_timeout(&self) {
        self.push(Event::Timeout);
    }

    fn on_error(&self, err: &AmqpError) {
        self.push(Event::Error(err.clone()));
    }

    fn on_consume(&self, delivery: &Delivery) {
        self.push(Event::Consume(delivery.delivery_tag));
    }

    fn on_ack(&self, delivery: &Delivery) {
        self.push(Event::Ack(delivery.delivery_tag));
    }

    fn on_reject(&self, delivery: &Delivery, outcome: ProcessOutcome) {
        self.push(Event::Reject(delivery.delivery_tag, outcome));
    }

    fn on_message_processed(&self, delivery: &Delivery, outcome: ProcessOutcome) {
        self.push(Event::Processed(delivery.delivery_tag, outcome));
    }
}
