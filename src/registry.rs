// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! Maps logical names to producers and consumers sharing one connection. A registry is
//! either filled by hand or wired once from declarative [`RabbitMqDefinitions`], in
//! which case every consumer `callback` name is resolved against a typed
//! [`HandlerRegistry`] at wiring time.

use crate::{
    channel::AmqpConnection,
    consumer::{Consumer, MessageHandler, QueueConsumer},
    errors::AmqpError,
    exchange::ExchangeSpec,
    message::{DELIVERY_MODE_PERSISTENT, TEXT_CONTENT_TYPE},
    multiple_consumer::MultipleConsumer,
    producer::Producer,
    queue::{QosSpec, QueueSpec},
};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error};

/// Named message handlers consumer definitions refer to.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers `handler` under `name`.
    ///
    /// # Parameters
    /// * `name` - Name consumer definitions refer to as `callback`
    /// * `handler` - The handler
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(&mut self, name: &str, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.handlers.insert(name.to_owned(), handler);
        self
    }

    /// The handler registered under `name`, or [`AmqpError::UnknownHandler`].
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn MessageHandler>, AmqpError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownHandler(name.to_owned()))
    }
}

fn default_auto_setup_fabric() -> bool {
    true
}

fn default_content_type() -> String {
    TEXT_CONTENT_TYPE.to_owned()
}

fn default_delivery_mode() -> u8 {
    DELIVERY_MODE_PERSISTENT
}

/// Declarative producers and consumers.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqDefinitions {
    #[serde(default = "default_auto_setup_fabric")]
    pub auto_setup_fabric: bool,
    #[serde(default)]
    pub producers: BTreeMap<String, ProducerDefinition>,
    #[serde(default)]
    pub consumers: BTreeMap<String, ConsumerDefinition>,
}

impl RabbitMqDefinitions {
    /// Parses definitions from JSON; malformed input is a configuration error.
    pub fn from_json(raw: &str) -> Result<RabbitMqDefinitions, AmqpError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "invalid rabbitmq definitions");
            AmqpError::Configuration(err.to_string())
        })
    }

    pub fn from_file(path: &Path) -> Result<RabbitMqDefinitions, AmqpError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            error!(error = err.to_string(), path = %path.display(), "failure to read definitions");
            AmqpError::Configuration(format!("{}: {}", path.display(), err))
        })?;

        RabbitMqDefinitions::from_json(&raw)
    }
}

/// A producer publishing to `exchange` with `routing_key` by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerDefinition {
    pub exchange: Option<ExchangeSpec>,
    /// Queue declared with the producer's fabric; consumers extending the producer
    /// inherit it.
    pub queue: Option<QueueSpec>,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_delivery_mode")]
    pub delivery_mode: u8,
    pub auto_setup_fabric: Option<bool>,
    #[serde(default)]
    pub publisher_confirms: bool,
}

/// A consumer of either one `queue` with one `callback`, or several `queues`, each
/// with its own callback.
///
/// A consumer extending a producer, through `_extends` or a `consumer < producer`
/// key, takes the producer's exchange and queue when it defines none of its own.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerDefinition {
    #[serde(rename = "_extends")]
    pub extends: Option<String>,
    pub exchange: Option<ExchangeSpec>,
    pub queue: Option<QueueSpec>,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    pub callback: Option<String>,
    pub qos: Option<QosSpec>,
    pub consumer_tag: Option<String>,
    #[serde(default)]
    pub routing_key: String,
    pub auto_setup_fabric: Option<bool>,
    /// Seconds without a delivery before an idle timeout is emitted.
    pub idle_timeout: Option<u64>,
}

impl ConsumerDefinition {
    /// Fills the exchange and queue this definition leaves out from `producer`.
    ///
    /// # Parameters
    /// * `producer` - Definition of the extended producer
    ///
    /// # Returns
    /// The merged consumer definition
    pub fn extend(mut self, producer: &ProducerDefinition) -> ConsumerDefinition {
        if self.exchange.is_none() {
            self.exchange = producer.exchange.clone();
        }
        if self.queue.is_none() && self.queues.is_empty() {
            self.queue = producer.queue.clone();
        }
        self
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Splits a `consumer < producer` key into its consumer and producer names.
fn split_extends(key: &str) -> (&str, Option<&str>) {
    match key.split_once('<') {
        Some((consumer, producer)) => (consumer.trim(), Some(producer.trim())),
        None => (key.trim(), None),
    }
}

/// One queue of a multiple-queue consumer with its callback name.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueDefinition {
    #[serde(flatten)]
    pub queue: QueueSpec,
    pub callback: String,
}

/// Named producers and consumers sharing one connection.
pub struct Registry {
    connection: Arc<dyn AmqpConnection>,
    producers: BTreeMap<String, Producer>,
    consumers: BTreeMap<String, Box<dyn QueueConsumer>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("producers", &self.producers.keys().collect::<Vec<_>>())
            .field("consumers", &self.consumers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(connection: Arc<dyn AmqpConnection>) -> Registry {
        Registry {
            connection,
            producers: BTreeMap::new(),
            consumers: BTreeMap::new(),
        }
    }

    /// Builds every producer and consumer of `definitions` on `connection`.
    ///
    /// # Parameters
    /// * `connection` - Connection shared by every member
    /// * `definitions` - Declarative producers and consumers
    /// * `handlers` - Handlers the consumers' `callback` names resolve against
    ///
    /// # Returns
    /// The wired registry, or the first configuration error
    pub fn from_definitions(
        connection: Arc<dyn AmqpConnection>,
        definitions: &RabbitMqDefinitions,
        handlers: &HandlerRegistry,
    ) -> Result<Registry, AmqpError> {
        let mut registry = Registry::new(connection);
        let auto_setup_fabric = definitions.auto_setup_fabric;

        for (name, def) in &definitions.producers {
            let mut producer = Producer::new(registry.connection.clone());
            if let Some(exchange) = &def.exchange {
                producer.set_exchange(exchange.clone());
            }
            producer.set_routing_key(&def.routing_key);
            producer.set_content_type(&def.content_type);
            producer.set_delivery_mode(def.delivery_mode);
            if def.publisher_confirms {
                producer.enable_publisher_confirms();
            }
            if let Some(queue) = &def.queue {
                producer.member_mut().add_queue(queue.clone());
            }
            producer
                .member_mut()
                .set_auto_setup_fabric(def.auto_setup_fabric.unwrap_or(auto_setup_fabric));

            debug!(producer = %name, "producer registered");
            registry.add_producer(name, producer);
        }

        for (key, def) in &definitions.consumers {
            let (name, parent) = split_extends(key);
            let def = match def.extends.as_deref().or(parent) {
                Some(producer) => {
                    let Some(producer_def) = definitions.producers.get(producer) else {
                        return Err(AmqpError::Configuration(format!(
                            "consumer `{}` cannot extend unknown producer `{}`",
                            name, producer
                        )));
                    };
                    def.clone().extend(producer_def)
                }
                None => def.clone(),
            };

            let consumer = registry.build_consumer(name, &def, handlers, auto_setup_fabric)?;
            debug!(consumer = %name, "consumer registered");
            registry.add_consumer(name, consumer);
        }

        Ok(registry)
    }

    fn build_consumer(
        &self,
        name: &str,
        def: &ConsumerDefinition,
        handlers: &HandlerRegistry,
        auto_setup_fabric: bool,
    ) -> Result<Box<dyn QueueConsumer>, AmqpError> {
        let auto_setup_fabric = def.auto_setup_fabric.unwrap_or(auto_setup_fabric);

        match (&def.queue, def.queues.is_empty()) {
            (Some(queue), true) => {
                let Some(callback) = &def.callback else {
                    return Err(AmqpError::Configuration(format!(
                        "you must provide a callback for consumer `{}`",
                        name
                    )));
                };

                let mut consumer =
                    Consumer::new(self.connection.clone(), queue.clone(), handlers.resolve(callback)?);
                if let Some(exchange) = &def.exchange {
                    consumer.set_exchange(exchange.clone());
                }
                if let Some(qos) = def.qos {
                    consumer.set_qos(qos);
                }
                if let Some(tag) = &def.consumer_tag {
                    consumer.set_consumer_tag(tag);
                }
                if let Some(timeout) = def.idle_timeout() {
                    consumer.set_idle_timeout(timeout);
                }
                consumer.set_routing_key(&def.routing_key);
                consumer.member_mut().set_auto_setup_fabric(auto_setup_fabric);

                Ok(Box::new(consumer))
            }
            (None, false) => {
                let mut consumer = MultipleConsumer::new(self.connection.clone());
                for queue in &def.queues {
                    consumer.add_queue(queue.queue.clone(), handlers.resolve(&queue.callback)?);
                }
                if let Some(exchange) = &def.exchange {
                    consumer.set_exchange(exchange.clone());
                }
                if let Some(qos) = def.qos {
                    consumer.set_qos(qos);
                }
                if let Some(tag) = &def.consumer_tag {
                    consumer.set_consumer_tag(tag);
                }
                if let Some(timeout) = def.idle_timeout() {
                    consumer.set_idle_timeout(timeout);
                }
                consumer.set_routing_key(&def.routing_key);
                consumer.member_mut().set_auto_setup_fabric(auto_setup_fabric);

                Ok(Box::new(consumer))
            }
            _ => Err(AmqpError::Configuration(format!(
                "consumer `{}` must define either `queue` or `queues`",
                name
            ))),
        }
    }

    pub fn connection(&self) -> Arc<dyn AmqpConnection> {
        self.connection.clone()
    }

    pub fn add_producer(&mut self, name: &str, producer: Producer) {
        self.producers.insert(name.to_owned(), producer);
    }

    pub fn add_consumer(&mut self, name: &str, consumer: Box<dyn QueueConsumer>) {
        self.consumers.insert(name.to_owned(), consumer);
    }

    /// The producer registered under `name`, or [`AmqpError::UnknownProducer`].
    pub fn producer(&mut self, name: &str) -> Result<&mut Producer, AmqpError> {
        self.producers
            .get_mut(name)
            .ok_or_else(|| AmqpError::UnknownProducer(name.to_owned()))
    }

    /// The consumer registered under `name`, or [`AmqpError::UnknownConsumer`].
    pub fn consumer(&mut self, name: &str) -> Result<&mut Box<dyn QueueConsumer>, AmqpError> {
        self.consumers
            .get_mut(name)
            .ok_or_else(|| AmqpError::UnknownConsumer(name.to_owned()))
    }

    /// Removes the consumer from the registry, e.g. to hand it to a runner.
    pub fn take_consumer(&mut self, name: &str) -> Result<Box<dyn QueueConsumer>, AmqpError> {
        self.consumers
            .remove(name)
            .ok_or_else(|| AmqpError::UnknownConsumer(name.to_owned()))
    }

    pub fn producer_names(&self) -> Vec<String> {
        self.producers.keys().cloned().collect()
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }

    /// Declares the fabric of every registered producer, then of every consumer.
    pub async fn setup_fabric(&mut self) -> Result<(), AmqpError> {
        for (name, producer) in self.producers.iter_mut() {
            debug!(producer = %name, "declaring fabric");
            producer.setup_fabric().await?;
        }

        for (name, consumer) in self.consumers.iter_mut() {
            debug!(consumer = %name, "declaring fabric");
            consumer.setup_fabric().await?;
        }

        Ok(())
    }
}
