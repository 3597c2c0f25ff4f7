// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fabric Member
//!
//! The capability producers, consumers and the runner are composed with: it owns the
//! member's channel (opened lazily, once) and declares the member's exchange, queues,
//! bindings and QoS at most once each.

use crate::{
    channel::{AmqpChannel, AmqpConnection},
    errors::AmqpError,
    exchange::ExchangeSpec,
    queue::{QosSpec, QueueSpec},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Channel and fabric state shared by producers, consumers and the runner.
pub struct FabricMember {
    connection: Arc<dyn AmqpConnection>,
    channel: Option<Arc<dyn AmqpChannel>>,
    exchange: Option<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    qos: QosSpec,
    routing_key: String,
    auto_setup_fabric: bool,
    exchange_declared: bool,
    // Queues are declared in order; the first `declared_queues` are done.
    declared_queues: usize,
    qos_declared: bool,
}

impl FabricMember {
    /// Creates a member with no fabric that opens its channel from `connection`.
    ///
    /// # Parameters
    /// * `connection` - Connection the member's channel is opened from
    ///
    /// # Returns
    /// A member with automatic fabric setup enabled and default QoS
    pub fn new(connection: Arc<dyn AmqpConnection>) -> FabricMember {
        FabricMember {
            connection,
            channel: None,
            exchange: None,
            queues: vec![],
            qos: QosSpec::default(),
            routing_key: String::new(),
            auto_setup_fabric: true,
            exchange_declared: false,
            declared_queues: 0,
            qos_declared: false,
        }
    }

    /// Sets the exchange the member publishes to and binds unbound queues to.
    ///
    /// # Parameters
    /// * `exchange` - Exchange specification, declared on the next fabric setup
    pub fn set_exchange(&mut self, exchange: ExchangeSpec) {
        self.exchange = Some(exchange);
        self.exchange_declared = false;
    }

    pub fn exchange(&self) -> Option<&ExchangeSpec> {
        self.exchange.as_ref()
    }

    /// Name of the member's exchange, empty (the default exchange) when it has none.
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_ref().map(|e| e.name.as_str()).unwrap_or_default()
    }

    /// Adds a queue, declared (with its bindings) on the next fabric setup.
    ///
    /// # Parameters
    /// * `queue` - Queue specification
    pub fn add_queue(&mut self, queue: QueueSpec) {
        self.queues.push(queue);
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    /// Sets the prefetch settings applied by [`FabricMember::qos_declare`].
    ///
    /// # Parameters
    /// * `qos` - Prefetch size and count
    pub fn set_qos(&mut self, qos: QosSpec) {
        self.qos = qos;
        self.qos_declared = false;
    }

    pub fn qos(&self) -> QosSpec {
        self.qos
    }

    /// Sets the default routing key, used for publishing and for binding unbound queues.
    ///
    /// # Parameters
    /// * `routing_key` - The routing key
    pub fn set_routing_key(&mut self, routing_key: &str) {
        self.routing_key = routing_key.to_owned();
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Leaves fabric declaration to an explicit [`FabricMember::setup_fabric`] call.
    pub fn disable_auto_setup_fabric(&mut self) {
        self.auto_setup_fabric = false;
    }

    pub fn set_auto_setup_fabric(&mut self, enabled: bool) {
        self.auto_setup_fabric = enabled;
    }

    pub fn is_auto_setup_fabric(&self) -> bool {
        self.auto_setup_fabric
    }

    /// The member's channel, opened from the connection on first use.
    ///
    /// # Returns
    /// The shared channel, or the error raised while opening it
    pub async fn channel(&mut self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }

        let channel = self.connection.open_channel().await?;
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Replaces the member's channel, e.g. with a runner's shared channel.
    ///
    /// QoS is a channel setting, so it will be declared again on the new channel.
    pub fn set_channel(&mut self, channel: Arc<dyn AmqpChannel>) {
        self.channel = Some(channel);
        self.qos_declared = false;
    }

    pub fn connection(&self) -> Arc<dyn AmqpConnection> {
        self.connection.clone()
    }

    /// Declares the exchange, then the queues, then their bindings; each at most once.
    ///
    /// The exchange and every queue are validated before the first network call.
    /// A failed declaration is retried on the next call; what already succeeded is not
    /// declared again.
    ///
    /// # Returns
    /// Ok(()) once the whole fabric is declared, or the first error encountered
    pub async fn setup_fabric(&mut self) -> Result<(), AmqpError> {
        self.validate()?;

        if !self.exchange_declared {
            self.exchange_declare().await?;
        }

        self.queue_declare().await
    }

    /// Applies the member's prefetch settings to its channel, at most once.
    pub async fn qos_declare(&mut self) -> Result<(), AmqpError> {
        if self.qos_declared || self.qos.is_default() {
            return Ok(());
        }

        let qos = self.qos;
        self.channel().await?.basic_qos(&qos).await?;
        debug!(
            prefetch_size = qos.prefetch_size,
            prefetch_count = qos.prefetch_count,
            "qos declared"
        );

        self.qos_declared = true;
        Ok(())
    }

    /// Closes the member's channel, if it was ever opened.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    fn validate(&self) -> Result<(), AmqpError> {
        if let Some(exchange) = self.exchange.as_ref().filter(|e| e.is_named()) {
            exchange.validate()?;
        }

        for queue in &self.queues {
            queue.validate()?;
        }

        Ok(())
    }

    async fn exchange_declare(&mut self) -> Result<(), AmqpError> {
        let Some(exchange) = self.exchange.clone().filter(|e| e.is_named()) else {
            return Ok(());
        };

        debug!("creating exchange: {}", exchange.name);
        self.channel().await?.exchange_declare(&exchange).await?;
        debug!("exchange: {} was created", exchange.name);

        self.exchange_declared = true;
        Ok(())
    }

    async fn queue_declare(&mut self) -> Result<(), AmqpError> {
        if self.declared_queues >= self.queues.len() {
            return Ok(());
        }

        let channel = self.channel().await?;
        let exchange = self.exchange_name().to_owned();

        while let Some(queue) = self.queues.get_mut(self.declared_queues) {
            debug!("creating queue: {}", queue.name);
            let resolved = channel.queue_declare(queue).await?;
            if resolved != queue.name {
                warn!(requested = %queue.name, resolved = %resolved, "broker renamed the queue");
                queue.name = resolved;
            }

            if queue.bindings.is_empty() && !exchange.is_empty() {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    queue.name, exchange, self.routing_key
                );
                channel
                    .queue_bind(&queue.name, &exchange, &self.routing_key)
                    .await?;
            }

            for binding in &queue.bindings {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    queue.name, binding.exchange, binding.routing_key
                );
                channel
                    .queue_bind(&queue.name, &binding.exchange, &binding.routing_key)
                    .await?;
            }

            self.declared_queues += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ChannelCall, FakeConnection};

    fn member(connection: &Arc<FakeConnection>) -> FabricMember {
        FabricMember::new(connection.clone())
    }

    #[tokio::test]
    async fn test_channel_is_opened_once() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);

        member.channel().await.unwrap();
        member.channel().await.unwrap();

        assert_eq!(connection.opened_channels(), 1);
    }

    #[tokio::test]
    async fn test_setup_fabric_is_idempotent() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);
        member.set_exchange(ExchangeSpec::new("orders").topic());
        member.add_queue(QueueSpec::new("billing").bind("orders", "order.*"));

        member.setup_fabric().await.unwrap();
        member.setup_fabric().await.unwrap();

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
            ]
        );
    }

    #[tokio::test]
    async fn test_unbound_queue_uses_member_exchange_and_routing_key() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);
        member.set_exchange(ExchangeSpec::new("orders"));
        member.set_routing_key("order.created");
        member.add_queue(QueueSpec::new("billing"));

        member.setup_fabric().await.unwrap();

        assert!(connection.channel().calls().contains(&ChannelCall::QueueBind(
            "billing".to_owned(),
            "orders".to_owned(),
            "order.created".to_owned()
        )));
    }

    #[tokio::test]
    async fn test_unbound_queue_without_exchange_is_not_bound() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);
        member.add_queue(QueueSpec::new("billing"));

        member.setup_fabric().await.unwrap();

        assert_eq!(
            connection.channel().calls(),
            vec![ChannelCall::QueueDeclare("billing".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_invalid_fabric_fails_before_any_call() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);
        let mut exchange = ExchangeSpec::new("orders");
        exchange.kind = None;
        member.set_exchange(exchange);

        let res = member.setup_fabric().await;
        assert!(res.unwrap_err().is_configuration());

        let mut member = FabricMember::new(connection.clone());
        member.add_queue(QueueSpec::default());

        let res = member.setup_fabric().await;
        assert!(res.unwrap_err().is_configuration());
        assert!(connection.channel().calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_declare_is_retried() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);
        member.set_exchange(ExchangeSpec::new("orders"));
        connection
            .channel()
            .fail_next(AmqpError::DeclareExchangeError("orders".to_owned()));

        assert!(member.setup_fabric().await.is_err());
        assert!(member.setup_fabric().await.is_ok());

        assert_eq!(
            connection.channel().calls(),
            vec![ChannelCall::ExchangeDeclare("orders".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_failed_queue_declare_keeps_declared_queues() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);
        member.add_queue(QueueSpec::new("billing"));
        member.add_queue(QueueSpec::new("shipping"));
        let channel = connection.channel();
        channel.fail_after(1, AmqpError::DeclareQueueError("shipping".to_owned()));

        assert!(member.setup_fabric().await.is_err());
        member.setup_fabric().await.unwrap();

        assert_eq!(
            channel.calls(),
            vec![
                ChannelCall::QueueDeclare("billing".to_owned()),
                ChannelCall::QueueDeclare("shipping".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_queue_added_after_setup_is_declared() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);
        member.add_queue(QueueSpec::new("billing"));
        member.setup_fabric().await.unwrap();

        member.add_queue(QueueSpec::new("shipping"));
        member.setup_fabric().await.unwrap();

        assert_eq!(
            connection.channel().calls(),
            vec![
                ChannelCall::QueueDeclare("billing".to_owned()),
                ChannelCall::QueueDeclare("shipping".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_qos_declare() {
        let connection = FakeConnection::new();
        let mut member = member(&connection);

        member.qos_declare().await.unwrap();
        assert!(connection.channel().calls().is_empty());

        member.set_qos(QosSpec::new(0, 10));
        member.qos_declare().await.unwrap();
        member.qos_declare().await.unwrap();

        assert_eq!(
            connection.channel().calls(),
            vec![ChannelCall::BasicQos(0, 10)]
        );
    }
}
