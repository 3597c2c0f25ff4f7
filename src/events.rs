// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer and Runner Notifications
//!
//! Observers are told about the runner lifecycle (start, stop, idle timeout, error)
//! and about each delivery (consumed, acked, rejected, processed). Notifications are
//! fire-and-forget; an observer cannot influence acknowledgement or stopping.

use crate::{
    errors::AmqpError,
    message::{Delivery, ProcessOutcome},
};
use tracing::{debug, error, info, warn};

/// Receives runner and consumer notifications. Every method defaults to a no-op.
pub trait ConsumerEvents: Send + Sync {
    fn on_start(&self) {}

    fn on_stop(&self) {}

    /// Nothing arrived within the idle timeout; consuming continues.
    fn on_timeout(&self) {}

    fn on_error(&self, _err: &AmqpError) {}

    /// A delivery is about to be handed to its callback.
    fn on_consume(&self, _delivery: &Delivery) {}

    fn on_ack(&self, _delivery: &Delivery) {}

    /// The delivery was rejected or nacked with `outcome`.
    fn on_reject(&self, _delivery: &Delivery, _outcome: ProcessOutcome) {}

    /// The delivery was acknowledged, whatever the outcome.
    fn on_message_processed(&self, _delivery: &Delivery, _outcome: ProcessOutcome) {}
}

/// Logs every notification through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

impl ConsumerEvents for TracingEvents {
    fn on_start(&self) {
        info!("consumer started");
    }

    fn on_stop(&self) {
        info!("consumer stopped");
    }

    fn on_timeout(&self) {
        debug!("no message received within the idle timeout");
    }

    fn on_error(&self, err: &AmqpError) {
        error!(error = err.to_string(), "consumer failure");
    }

    fn on_consume(&self, delivery: &Delivery) {
        debug!(
            delivery_tag = delivery.delivery_tag,
            consumer_tag = %delivery.consumer_tag,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            "received message"
        );
    }

    fn on_ack(&self, delivery: &Delivery) {
        debug!(delivery_tag = delivery.delivery_tag, "message acked");
    }

    fn on_reject(&self, delivery: &Delivery, outcome: ProcessOutcome) {
        warn!(
            delivery_tag = delivery.delivery_tag,
            outcome = ?outcome,
            "message rejected"
        );
    }
}
