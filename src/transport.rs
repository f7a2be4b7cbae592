// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The asynchronous surface this crate needs from a message broker. The
//! production implementation lives in [`crate::channel`] (over `lapin`),
//! an in-process one in [`crate::memory`].

use crate::{
    config::ConnectionOptions, errors::AmqpError, exchange::{ExchangeKind, ExchangeOptions},
    queue::{ConsumeOptions, QueueOptions},
};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Properties carried by a published or delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// The queue name, generated by the broker for server-named queues.
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Result of an exchange declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub exchange: String,
}

/// Callback invoked for every delivery of a consumer.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Entry point of a broker transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        opts: &ConnectionOptions,
    ) -> Result<Arc<dyn Connection>, AmqpError>;
}

/// An open broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a channel, in publisher-confirm mode when `confirm` is set.
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn Channel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    async fn assert_queue(&self, name: &str, opts: &QueueOptions) -> Result<QueueInfo, AmqpError>;

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        opts: &ExchangeOptions,
    ) -> Result<ExchangeInfo, AmqpError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), AmqpError>;

    async fn send_to_queue(
        &self,
        queue: &str,
        data: Vec<u8>,
        props: MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        props: MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer and returns its tag. `callback` runs once per
    /// delivery, in delivery order.
    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
        callback: DeliveryCallback,
    ) -> Result<String, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
