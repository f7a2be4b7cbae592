// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel
//!
//! The production [`Broker`] implementation over `lapin`. It opens the
//! connection to RabbitMQ, creates channels and maps every channel operation
//! of the transport traits onto the corresponding AMQP method.

use crate::{
    config::ConnectionOptions,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::{
        ConsumeOptions, QueueOptions, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MAX_LENGTH,
        AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MESSAGE_TTL,
    },
    transport::{
        Broker, Channel, Connection, Delivery, DeliveryCallback, ExchangeInfo, MessageProperties,
        QueueInfo,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens connections to a RabbitMQ server.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBroker;

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(
        &self,
        url: &str,
        opts: &ConnectionOptions,
    ) -> Result<Arc<dyn Connection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(opts.connection_name.clone()));

        let conn = match lapin::Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

pub struct LapinConnection {
    conn: lapin::Connection,
}

#[async_trait]
impl Connection for LapinConnection {
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn Channel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        if confirm {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                error!(error = err.to_string(), "error to enable publisher confirms");
                return Err(AmqpError::ChannelError);
            }
        }

        debug!("channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::ClosingError("connection".to_owned())
            })
    }
}

pub struct LapinChannel {
    channel: lapin::Channel,
}

/// Translates the dead-letter, TTL and length options into queue arguments.
fn queue_arguments(opts: &QueueOptions) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(exchange) = &opts.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(key) = &opts.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.clone())),
        );
    }

    let limits = [
        (AMQP_HEADERS_MESSAGE_TTL, opts.message_ttl),
        (AMQP_HEADERS_MAX_LENGTH, opts.max_length),
        (AMQP_HEADERS_MAX_LENGTH_BYTES, opts.max_length_bytes),
    ];
    for (header, value) in limits {
        if let Some(value) = value {
            args.insert(
                ShortString::from(header),
                AMQPValue::LongInt(LongInt::try_from(value).unwrap_or(LongInt::MAX)),
            );
        }
    }

    FieldTable::from(args)
}

fn to_amqp_properties(props: MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();

    if let Some(content_type) = props.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type));
    }
    if let Some(encoding) = props.content_encoding {
        amqp = amqp.with_content_encoding(ShortString::from(encoding));
    }
    if let Some(correlation_id) = props.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(reply_to) = props.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to));
    }
    if let Some(expiration) = props.expiration {
        amqp = amqp.with_expiration(ShortString::from(expiration.to_string()));
    }
    if let Some(message_id) = props.message_id {
        amqp = amqp.with_message_id(ShortString::from(message_id));
    }
    if let Some(kind) = props.kind {
        amqp = amqp.with_type(ShortString::from(kind));
    }

    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .into_iter()
        .map(|(key, value)| {
            (
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            )
        })
        .collect();

    amqp.with_headers(FieldTable::from(headers))
}

fn from_amqp_properties(props: &AMQPProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.to_string());

    let headers: BTreeMap<String, String> = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(v) => Some((
                        key.to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )),
                    AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        expiration: props
            .expiration()
            .as_ref()
            .and_then(|v| v.as_str().parse().ok()),
        message_id: text(props.message_id()),
        kind: text(props.kind()),
        headers,
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: from_amqp_properties(&delivery.properties),
        data: delivery.data,
    }
}

#[async_trait]
impl Channel for LapinChannel {
    async fn assert_queue(&self, name: &str, opts: &QueueOptions) -> Result<QueueInfo, AmqpError> {
        debug!("creating queue: {}", name);

        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: opts.durable,
                    exclusive: opts.exclusive,
                    auto_delete: opts.auto_delete,
                    nowait: false,
                },
                queue_arguments(opts),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(QueueInfo {
                    queue: queue.name().to_string(),
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                })
            }
        }
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        opts: &ExchangeOptions,
    ) -> Result<ExchangeInfo, AmqpError> {
        debug!("creating exchange: {}", name);

        match self
            .channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: opts.durable,
                    auto_delete: opts.auto_delete,
                    internal: opts.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the exchange");
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", name);
                Ok(ExchangeInfo {
                    exchange: name.to_owned(),
                })
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        data: Vec<u8>,
        props: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.publish("", queue, data, props).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        props: MessageProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &data,
                to_amqp_properties(props),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), "message was not confirmed");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
        callback: DeliveryCallback,
    ) -> Result<String, AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: opts.no_ack,
                    exclusive: opts.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();
        let queue = queue.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => callback(from_lapin_delivery(delivery)),
                    Err(err) => error!(error = err.to_string(), queue, "errors consume msg"),
                }
            }
            debug!(queue, "consumer stream finished");
        });

        Ok(tag)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::ClosingError("channel".to_owned())
            })
    }
}
