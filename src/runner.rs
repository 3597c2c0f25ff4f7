// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Runner
//!
//! Drives one or more consumers over a single shared channel:
//!
//! ```text
//! Idle --consume()--> Running --stop condition--> Stopping --no subscriptions left--> Stopped
//! ```
//!
//! Stop conditions are checked at the top of the wait loop, i.e. before every wait and
//! right after every processed delivery: a forced stop was requested through the
//! [`StopHandle`], or the message budget is spent. A forced stop never pre-empts a
//! running callback; it only interrupts the wait for the next delivery.

use crate::{
    channel::AmqpConnection,
    consumer::QueueConsumer,
    errors::AmqpError,
    events::{ConsumerEvents, TracingEvents},
    fabric::FabricMember,
    memory::{MemoryProbe, ProcessMemoryProbe},
    message::{Delivery, MessageProcessed},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a [`ConsumerRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Requests a forced stop of a running [`ConsumerRunner`] from anywhere, e.g. a signal handler.
///
/// It only raises a flag; the runner's wait loop notices it and cancels the consumers.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> StopHandle {
        StopHandle::default()
    }

    /// Requests the stop. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop was requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Runs consumers over one shared channel until a stop condition fires.
pub struct ConsumerRunner {
    member: FabricMember,
    consumers: Vec<Box<dyn QueueConsumer>>,
    state: RunnerState,
    target: u64,
    consumed: u64,
    stop: StopHandle,
    idle_timeout: Option<Duration>,
    memory_limit: Option<u64>,
    memory: Arc<dyn MemoryProbe>,
    events: Arc<dyn ConsumerEvents>,
}

impl ConsumerRunner {
    /// Creates an idle runner.
    ///
    /// # Parameters
    /// * `connection` - Connection the shared channel is opened from
    ///
    /// # Returns
    /// A runner without consumers, idle timeout or memory limit
    pub fn new(connection: Arc<dyn AmqpConnection>) -> ConsumerRunner {
        ConsumerRunner {
            member: FabricMember::new(connection),
            consumers: vec![],
            state: RunnerState::Idle,
            target: 0,
            consumed: 0,
            stop: StopHandle::new(),
            idle_timeout: None,
            memory_limit: None,
            memory: Arc::new(ProcessMemoryProbe::new()),
            events: Arc::new(TracingEvents),
        }
    }

    /// Zero disables the idle timeout.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout).filter(|t| !t.is_zero());
    }

    /// Stop once the process uses more than `bytes` of memory after a processed message.
    pub fn set_memory_limit(&mut self, bytes: u64) {
        self.memory_limit = Some(bytes);
    }

    /// Replaces the process memory reader used by the memory limit.
    pub fn set_memory_probe(&mut self, probe: Arc<dyn MemoryProbe>) {
        self.memory = probe;
    }

    pub fn set_events(&mut self, events: Arc<dyn ConsumerEvents>) {
        self.events = events;
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Deliveries processed by the current or last `consume` call.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// A handle forcing this runner to stop, usable from other tasks.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Queues of every attached consumer, in attachment order.
    pub fn queue_names(&self) -> Vec<String> {
        self.consumers.iter().flat_map(|c| c.queue_names()).collect()
    }

    /// Attaches `consumer` to the runner's channel. Only allowed before `consume`.
    ///
    /// # Parameters
    /// * `consumer` - The consumer; its own channel is replaced by the runner's
    ///
    /// # Returns
    /// [`AmqpError::InvalidRunnerState`] once the runner left the idle state
    pub async fn add_consumer(&mut self, mut consumer: Box<dyn QueueConsumer>) -> Result<(), AmqpError> {
        if self.state != RunnerState::Idle {
            return Err(AmqpError::InvalidRunnerState(
                "consumers can only be added to an idle runner".to_owned(),
            ));
        }

        consumer.attach_channel(self.member.channel().await?);
        self.consumers.push(consumer);
        Ok(())
    }

    /// Consumes until a stop condition fires. A `target` of zero means no message budget.
    ///
    /// # Parameters
    /// * `target` - Deliveries to process before stopping
    ///
    /// # Returns
    /// Ok(()) after an orderly stop, or the error that ended the run; either way the
    /// runner ends up [`RunnerState::Stopped`]
    pub async fn consume(&mut self, target: u64) -> Result<(), AmqpError> {
        if self.state != RunnerState::Idle {
            return Err(AmqpError::InvalidRunnerState(
                "consume can only be called once".to_owned(),
            ));
        }

        self.target = target;
        self.consumed = 0;
        self.state = RunnerState::Running;

        match self.run().await {
            Ok(()) => {
                self.state = RunnerState::Stopped;
                self.events.on_stop();
                Ok(())
            }
            Err(err) => {
                self.state = RunnerState::Stopped;
                self.events.on_error(&err);
                Err(err)
            }
        }
    }

    /// Cancels every consumer's subscriptions; the wait loop exits once none are left.
    pub async fn stop_consuming(&mut self) -> Result<(), AmqpError> {
        if self.state != RunnerState::Running {
            return Ok(());
        }

        self.state = RunnerState::Stopping;
        for consumer in self.consumers.iter_mut() {
            consumer.stop_consuming().await?;
        }

        debug!(consumed = self.consumed, "consumers cancelled");
        Ok(())
    }

    /// Requests a stop without touching the channel.
    pub fn force_stop_consumer(&self) {
        self.stop.stop();
    }

    async fn run(&mut self) -> Result<(), AmqpError> {
        for consumer in self.consumers.iter_mut() {
            consumer.setup_consumer().await?;
        }

        let channel = self.member.channel().await?;
        let token = self.stop.token.clone();

        self.events.on_start();
        info!(queues = ?self.queue_names(), target = self.target, "consuming");

        loop {
            if self.stop_requested() {
                self.stop_consuming().await?;
            }

            if channel.active_consumers() == 0 {
                return Ok(());
            }

            let next = tokio::select! {
                biased;

                _ = token.cancelled(), if self.state == RunnerState::Running => continue,
                next = channel.next_delivery(self.idle_timeout) => next,
            };

            match next {
                Ok(delivery) => self.dispatch(delivery).await?,
                Err(AmqpError::Timeout) => self.events.on_timeout(),
                Err(err) if self.stop.is_stopped() => {
                    debug!(error = err.to_string(), "wait interrupted by a forced stop");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn stop_requested(&self) -> bool {
        if self.state != RunnerState::Running {
            return false;
        }

        self.stop.is_stopped() || (self.target > 0 && self.consumed >= self.target)
    }

    async fn dispatch(&mut self, delivery: Delivery) -> Result<(), AmqpError> {
        let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.owns_consumer_tag(&delivery.consumer_tag))
        else {
            return Err(AmqpError::UnknownConsumerTag(delivery.consumer_tag.clone()));
        };

        match consumer.process_delivery(delivery).await {
            Ok(MessageProcessed::Settled(_)) => {
                self.consumed += 1;
                if self.memory_exceeded() {
                    self.stop_consuming().await?;
                }
                Ok(())
            }
            Ok(MessageProcessed::Terminated(outcome)) => {
                self.consumed += 1;
                info!(outcome = ?outcome, "consumer termination requested");
                self.stop_consuming().await
            }
            Err(err @ AmqpError::HandlerError(_)) => {
                self.consumed += 1;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn memory_exceeded(&self) -> bool {
        let Some(limit) = self.memory_limit else {
            return false;
        };

        match self.memory.current_usage() {
            Some(usage) if usage > limit => {
                warn!(usage, limit, "memory limit exceeded, stopping consumers");
                true
            }
            _ => false,
        }
    }
}
