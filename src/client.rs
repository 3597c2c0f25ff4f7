// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Implementation of the Channel Boundary
//!
//! [`LapinConnection`] and [`LapinChannel`] implement [`AmqpConnection`] and
//! [`AmqpChannel`] on top of lapin. Every subscription's delivery stream is merged
//! into one `SelectAll`, so waiting for "the next event on the channel" is a single
//! poll bounded by the idle timeout.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Confirmation, ConsumeOptions},
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeSpec,
    message::Delivery,
    queue::{QosSpec, QueueSpec},
};
use async_trait::async_trait;
use futures_util::{
    stream::{BoxStream, SelectAll},
    StreamExt,
};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    publisher_confirm,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

type TaggedDeliveries = BoxStream<'static, (String, Result<lapin::message::Delivery, lapin::Error>)>;

/// A lapin connection.
pub struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    /// Connects to the broker described by `cfg`.
    pub async fn connect(cfg: &Configs) -> Result<Arc<LapinConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app.name.clone()));

        let conn = Connection::connect(&cfg.rabbitmq.uri(), options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError
            })?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError
        })?;
        debug!(id = channel.id(), "channel created");

        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError
        })
    }
}

/// A lapin channel together with the merged delivery streams of its subscriptions.
pub struct LapinChannel {
    channel: Channel,
    deliveries: tokio::sync::Mutex<SelectAll<TaggedDeliveries>>,
    consumer_tags: Mutex<HashSet<String>>,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> LapinChannel {
        LapinChannel {
            channel,
            deliveries: tokio::sync::Mutex::new(SelectAll::new()),
            consumer_tags: Mutex::new(HashSet::new()),
        }
    }

    fn tags(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.consumer_tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LapinChannel {
    fn drop(&mut self) {
        if !self.channel.status().connected() {
            return;
        }

        // Closing is async; hand it to the runtime when there is one.
        if let Ok(handle) = Handle::try_current() {
            let channel = self.channel.clone();
            handle.spawn(async move {
                if let Err(err) = channel.close(REPLY_SUCCESS, "OK").await {
                    warn!(error = err.to_string(), "failure to close the channel");
                }
            });
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        let kind: lapin::ExchangeKind = spec.validate()?.clone().try_into()?;

        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: false,
                },
                field_table(&spec.arguments),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = %spec.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(spec.name.clone())
            })
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<String, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: false,
                },
                field_table(&spec.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = %spec.name, "error to declare the queue");
                AmqpError::DeclareQueueError(spec.name.clone())
            })?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, qos: &QosSpec) -> Result<(), AmqpError> {
        if qos.prefetch_size > 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "prefetch size is not supported by the client, only the prefetch count is applied"
            );
        }

        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ConfirmSelectError(err.to_string())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<Confirmation, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error waiting for publisher confirm");
            AmqpError::PublishingError
        })?;

        Ok(match confirmation {
            publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
            publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
            publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
            publisher_confirm::Confirmation::Ack(Some(returned)) => Confirmation::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.to_string(),
            },
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<(), AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(consumer_tag.to_owned())
            })?;

        let tag = consumer_tag.to_owned();
        self.deliveries
            .lock()
            .await
            .push(consumer.map(move |delivery| (tag.clone(), delivery)).boxed());
        self.tags().insert(consumer_tag.to_owned());

        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })?;

        self.tags().remove(consumer_tag);
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to purge the queue");
                AmqpError::PurgeQueueError(queue.to_owned())
            })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn next_delivery(&self, timeout: Option<Duration>) -> Result<Delivery, AmqpError> {
        let mut deliveries = self.deliveries.lock().await;

        let next = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, deliveries.next())
                .await
                .map_err(|_| AmqpError::Timeout)?,
            None => deliveries.next().await,
        };

        match next {
            Some((tag, Ok(delivery))) => Ok(Delivery::from_lapin(&tag, delivery)),
            Some((tag, Err(err))) => {
                error!(error = err.to_string(), consumer_tag = %tag, "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
            None => Err(AmqpError::ChannelClosed),
        }
    }

    fn active_consumers(&self) -> usize {
        self.tags().len()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.tags().clear();
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError
            })
    }
}

/// Converts declarative JSON arguments into an AMQP field table.
pub(crate) fn field_table(arguments: &BTreeMap<String, serde_json::Value>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = arguments
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();

    FieldTable::from(table)
}

fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Null => AMQPValue::Void,
        serde_json::Value::Bool(v) => AMQPValue::Boolean(*v),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => AMQPValue::LongLongInt(v),
            (None, Some(v)) => AMQPValue::Double(v),
            _ => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        serde_json::Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        serde_json::Value::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        serde_json::Value::Object(map) => {
            let table: BTreeMap<ShortString, AMQPValue> = map
                .iter()
                .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
                .collect();
            AMQPValue::FieldTable(FieldTable::from(table))
        }
    }
}
