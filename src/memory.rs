// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A [`Broker`] that keeps queues, topic exchanges and bindings in memory.
//! Deliveries are handed to consumer callbacks round-robin as soon as they
//! are published; messages sent to a queue without consumers wait until one
//! subscribes. Message TTLs and dead-lettering are not simulated.
//!
//! Used by the test suite and handy for running RPC code without a server.

use crate::{
    config::ConnectionOptions,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::{ConsumeOptions, QueueOptions},
    transport::{
        Broker, Channel, Connection, Delivery, DeliveryCallback, ExchangeInfo, MessageProperties,
        QueueInfo,
    },
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Snapshot of the calls a [`MemoryBroker`] has served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connections: usize,
    pub channels: usize,
    pub queue_asserts: usize,
    pub exchange_asserts: usize,
    pub bindings: usize,
    pub publishes: usize,
    pub acks: usize,
    pub prefetch: Option<u16>,
    pub closed_channels: usize,
    pub closed_connections: usize,
}

struct MemoryConsumer {
    callback: DeliveryCallback,
}

#[derive(Default)]
struct MemoryQueue {
    consumers: Vec<MemoryConsumer>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    next_delivery_tag: u64,
    failing_queues: HashSet<String>,
    stats: MemoryStats,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_owned()];
        }

        let kind = self.exchanges.get(exchange).copied().unwrap_or_default();
        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Direct => b.pattern == routing_key,
                ExchangeKind::Topic => topic_matches(&b.pattern, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    /// Queues the delivery or picks the consumer that gets it.
    fn enqueue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        props: &MessageProperties,
    ) -> Option<(DeliveryCallback, Delivery)> {
        self.next_delivery_tag += 1;
        let delivery = Delivery {
            delivery_tag: self.next_delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            data: data.to_vec(),
            properties: props.clone(),
        };

        let Some(state) = self.queues.get_mut(queue) else {
            warn!(queue, "message dropped, queue not found");
            return None;
        };

        if state.consumers.is_empty() {
            state.backlog.push_back(delivery);
            return None;
        }

        let idx = state.next_consumer % state.consumers.len();
        state.next_consumer = state.next_consumer.wrapping_add(1);
        Some((state.consumers[idx].callback.clone(), delivery))
    }
}

/// Routing key match with `*` for exactly one word and `#` for zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// In-memory [`Broker`]. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats.clone()
    }

    /// Makes every declaration of `queue` fail.
    pub fn fail_queue(&self, queue: &str) {
        self.state.lock().failing_queues.insert(queue.to_owned());
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    /// Messages waiting for a consumer on `queue`, oldest first.
    pub fn backlog_messages(&self, queue: &str) -> Vec<Delivery> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting for a consumer on `queue`.
    pub fn backlog(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        url: &str,
        opts: &ConnectionOptions,
    ) -> Result<Arc<dyn Connection>, AmqpError> {
        debug!(url, name = opts.connection_name, "memory broker connected");
        self.state.lock().stats.connections += 1;

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self, _confirm: bool) -> Result<Arc<dyn Channel>, AmqpError> {
        self.state.lock().stats.channels += 1;

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.lock().stats.closed_connections += 1;
        Ok(())
    }
}

pub struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn deliver(&self, exchange: &str, routing_key: &str, data: &[u8], props: MessageProperties) {
        let targets = {
            let mut state = self.state.lock();
            state.stats.publishes += 1;

            let queues = state.route(exchange, routing_key);
            queues
                .iter()
                .filter_map(|queue| state.enqueue(queue, exchange, routing_key, data, &props))
                .collect::<Vec<_>>()
        };

        for (callback, delivery) in targets {
            callback(delivery);
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn assert_queue(&self, name: &str, _opts: &QueueOptions) -> Result<QueueInfo, AmqpError> {
        let mut state = self.state.lock();
        state.stats.queue_asserts += 1;

        if state.failing_queues.contains(name) {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }

        let queue = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        let entry = state.queues.entry(queue.clone()).or_default();
        Ok(QueueInfo {
            message_count: entry.backlog.len() as u32,
            consumer_count: entry.consumers.len() as u32,
            queue,
        })
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _opts: &ExchangeOptions,
    ) -> Result<ExchangeInfo, AmqpError> {
        let mut state = self.state.lock();
        state.stats.exchange_asserts += 1;

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => {
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                state.exchanges.insert(name.to_owned(), kind);
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
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.stats.bindings += 1;
        state.bindings.push(Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            pattern: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        data: Vec<u8>,
        props: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.deliver("", queue, &data, props);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        props: MessageProperties,
    ) -> Result<(), AmqpError> {
        if !exchange.is_empty() && !self.has_exchange(exchange) {
            return Err(AmqpError::PublishingError);
        }

        self.deliver(exchange, routing_key, &data, props);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _opts: &ConsumeOptions,
        callback: DeliveryCallback,
    ) -> Result<String, AmqpError> {
        let tag = format!("amq.ctag-{}", Uuid::new_v4().simple());

        let backlog = {
            let mut state = self.state.lock();
            let Some(entry) = state.queues.get_mut(queue) else {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            };

            entry.consumers.push(MemoryConsumer {
                callback: callback.clone(),
            });
            entry.backlog.drain(..).collect::<Vec<_>>()
        };

        for delivery in backlog {
            callback(delivery);
        }

        debug!(queue, consumer = tag, "memory consumer started");
        Ok(tag)
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<(), AmqpError> {
        self.state.lock().stats.acks += 1;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.state.lock().stats.prefetch = Some(count);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.lock().stats.closed_channels += 1;
        Ok(())
    }
}

impl MemoryChannel {
    fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }
}
