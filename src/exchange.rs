// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Options
//!
//! Exchange kinds and the options used to declare them.

use serde::{Deserialize, Serialize};

/// Represents the types of exchanges available in RabbitMQ.
///
/// The RPC and topic helpers only declare `Topic` exchanges; the other kinds
/// are available to callers declaring exchanges through the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Options used to declare an exchange.
///
/// Defaults to a transient, auto-deleted, non-internal exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub internal: bool,
    /// Accepted for compatibility; AMQP 0-9-1 has no exclusive exchanges.
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            durable: false,
            internal: false,
            exclusive: false,
            auto_delete: true,
        }
    }
}

impl ExchangeOptions {
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn keep(mut self) -> Self {
        self.auto_delete = false;
        self
    }
}
