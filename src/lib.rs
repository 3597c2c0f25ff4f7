// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Consumer and Producer Runtime
//!
//! Producers publish to an exchange, optionally waiting for publisher confirms.
//! Consumers own one or more queues and turn every handler result into exactly one
//! acknowledgement. A [`runner::ConsumerRunner`] drives consumers over a shared channel
//! until its message budget is spent, a memory limit is hit or a stop is requested.
//!
//! Every broker interaction goes through the [`channel::AmqpConnection`] and
//! [`channel::AmqpChannel`] traits, implemented over lapin in [`client`].

mod otel;

pub mod channel;
pub mod cli;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod fabric;
pub mod logging;
pub mod memory;
pub mod message;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod multiple_consumer;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod runner;
