// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Encodes payloads, fills in message properties and publishes them on a
//! channel. The current OpenTelemetry context is propagated in the message
//! headers.

use crate::{
    codec::{self, CONTENT_ENCODING},
    errors::AmqpError,
    otel,
    transport::{Channel, MessageProperties},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

/// Per-message options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Milliseconds. For RPC calls this is also how long the caller waits.
    pub expiration: Option<u64>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl SendOptions {
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(u64::try_from(expiration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Returns these options overridden by every field set in `other`.
    pub fn merge(mut self, other: &SendOptions) -> SendOptions {
        if other.correlation_id.is_some() {
            self.correlation_id = other.correlation_id.clone();
        }
        if other.reply_to.is_some() {
            self.reply_to = other.reply_to.clone();
        }
        if other.expiration.is_some() {
            self.expiration = other.expiration;
        }
        if other.message_id.is_some() {
            self.message_id = other.message_id.clone();
        }
        if other.kind.is_some() {
            self.kind = other.kind.clone();
        }
        self.headers
            .extend(other.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// An encoded payload with its properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub data: Vec<u8>,
    pub properties: MessageProperties,
}

/// Encodes `payload` and builds the properties described by `opts`.
pub fn prepare(payload: &Value, opts: &SendOptions) -> Result<OutgoingMessage, AmqpError> {
    let packed = codec::pack(payload)?;

    let mut headers = opts.headers.clone();
    otel::inject(&mut headers);

    Ok(OutgoingMessage {
        data: packed.data,
        properties: MessageProperties {
            content_type: Some(packed.content_type.to_owned()),
            content_encoding: Some(CONTENT_ENCODING.to_owned()),
            correlation_id: opts.correlation_id.clone(),
            reply_to: opts.reply_to.clone(),
            expiration: opts.expiration,
            message_id: Some(
                opts.message_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            kind: opts.kind.clone(),
            headers,
        },
    })
}

/// Publishes encoded messages on a channel.
#[derive(Clone)]
pub struct RabbitMQPublisher {
    channel: Arc<dyn Channel>,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<dyn Channel>) -> RabbitMQPublisher {
        RabbitMQPublisher { channel }
    }

    /// Sends `payload` straight to `queue` through the default exchange.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &Value,
        opts: &SendOptions,
    ) -> Result<(), AmqpError> {
        let msg = prepare(payload, opts)?;
        debug!(queue, correlation_id = ?msg.properties.correlation_id, "sending to queue");

        self.channel
            .send_to_queue(queue, msg.data, msg.properties)
            .await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Value,
        opts: &SendOptions,
    ) -> Result<(), AmqpError> {
        let msg = prepare(payload, opts)?;
        debug!(
            exchange,
            routing_key,
            correlation_id = ?msg.properties.correlation_id,
            "publishing to exchange"
        );

        self.channel
            .publish(exchange, routing_key, msg.data, msg.properties)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::JSON_CONTENT_TYPE, transport::MockChannel};
    use mockall::predicate::{always, eq};
    use serde_json::json;

    #[test]
    fn merge_prefers_the_override() {
        let defaults = SendOptions::default()
            .reply_to("replies")
            .header("app", "billing")
            .kind("invoice");
        let over = SendOptions::default()
            .correlation_id("c-1")
            .expiration(Duration::from_millis(50))
            .header("app", "orders");

        let merged = defaults.merge(&over);

        assert_eq!(merged.reply_to.as_deref(), Some("replies"));
        assert_eq!(merged.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(merged.expiration, Some(50));
        assert_eq!(merged.kind.as_deref(), Some("invoice"));
        assert_eq!(merged.headers.get("app").map(String::as_str), Some("orders"));
    }

    #[test]
    fn expiration_saturates() {
        let opts = SendOptions::default().expiration(Duration::MAX);
        assert_eq!(opts.expiration, Some(u64::MAX));

        let opts = SendOptions::default().expiration(Duration::from_secs(30));
        assert_eq!(opts.expiration, Some(30_000));
    }

    #[test]
    fn prepare_sets_codec_properties() {
        let msg = prepare(&json!({"x": 1}), &SendOptions::default().reply_to("r")).unwrap();

        assert_eq!(msg.data, br#"{"x":1}"#);
        assert_eq!(
            msg.properties.content_type.as_deref(),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(msg.properties.content_encoding.as_deref(), Some("UTF8"));
        assert_eq!(msg.properties.reply_to.as_deref(), Some("r"));
        assert!(msg.properties.message_id.is_some());
    }

    #[tokio::test]
    async fn send_to_queue_uses_the_channel() {
        let mut channel = MockChannel::new();
        channel
            .expect_send_to_queue()
            .with(eq("jobs"), eq(b"hello".to_vec()), always())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        publisher
            .send_to_queue("jobs", &json!("hello"), &SendOptions::default())
            .await
            .unwrap();
    }
}
