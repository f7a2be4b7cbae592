// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options
//!
//! Declaration and consumption options for queues, including the dead-letter
//! setup used to catch expired messages.

use serde::{Deserialize, Serialize};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Exchange that receives expired messages when no other is configured
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "defaultDeadLetterExchange";

/// Routing key used for expired messages of `queue` when none is configured.
///
/// Server-named queues (empty name) share the `default.expired.queue` key.
pub fn default_dead_letter_routing_key(queue: &str) -> String {
    let name = if queue.is_empty() { "queue" } else { queue };
    format!("default.expired.{}", name)
}

/// Options used to declare a queue.
///
/// Defaults to a transient, non-exclusive, auto-deleted queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Route expired messages to a dead-letter exchange.
    pub catch_expired: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    /// Message TTL in milliseconds.
    pub message_ttl: Option<u32>,
    pub max_length: Option<u32>,
    pub max_length_bytes: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: false,
            exclusive: false,
            auto_delete: true,
            catch_expired: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            max_length: None,
            max_length_bytes: None,
        }
    }
}

impl QueueOptions {
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn keep(mut self) -> Self {
        self.auto_delete = false;
        self
    }

    pub fn catch_expired(mut self) -> Self {
        self.catch_expired = true;
        self
    }

    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Fills in the dead-letter defaults for the queue `name`.
    ///
    /// Setting either dead-letter field turns `catch_expired` on. When
    /// `catch_expired` is on, missing fields fall back to
    /// [`DEFAULT_DEAD_LETTER_EXCHANGE`] and
    /// [`default_dead_letter_routing_key`].
    pub fn normalize(mut self, name: &str) -> Self {
        if self.dead_letter_exchange.is_some() || self.dead_letter_routing_key.is_some() {
            self.catch_expired = true;
        }

        if self.catch_expired {
            self.dead_letter_exchange
                .get_or_insert_with(|| DEFAULT_DEAD_LETTER_EXCHANGE.to_owned());
            self.dead_letter_routing_key
                .get_or_insert_with(|| default_dead_letter_routing_key(name));
        }

        self
    }
}

/// The `type` reported on the generic receive event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveKind {
    #[default]
    Queue,
    Topic,
}

/// Options used to consume a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    /// Name of the per-destination event. Defaults to `<queue>:message`.
    pub event_name: Option<String>,
    /// Channel prefetch applied before consuming when greater than zero.
    pub prefetch: Option<u16>,
    /// The broker considers messages acknowledged on delivery.
    pub no_ack: bool,
    /// Acknowledgement is left to the event handler.
    pub manual_ack: bool,
    pub exclusive: bool,
    pub receive_type: ReceiveKind,
}

impl ConsumeOptions {
    pub fn event_name(mut self, name: &str) -> Self {
        self.event_name = Some(name.to_owned());
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn manual_ack(mut self) -> Self {
        self.manual_ack = true;
        self
    }

    /// Whether the router should acknowledge deliveries itself.
    pub fn auto_ack(&self) -> bool {
        !self.no_ack && !self.manual_ack
    }
}
