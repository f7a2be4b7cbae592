// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Router
//!
//! Turns consumer deliveries into events. Every delivery produces a generic
//! [`Event::Receive`] followed by an [`Event::DestinationMessage`] for the
//! event name the consumer was registered with. A named event has at most
//! one handler: subscribing twice keeps the first handler.

use crate::{
    codec,
    errors::AmqpError,
    queue::{ConsumeOptions, ReceiveKind},
    transport::{Channel, Delivery},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, error};

/// A decoded delivery together with where it came from.
#[derive(Clone)]
pub struct Envelope {
    pub kind: ReceiveKind,
    pub event_name: String,
    pub queue_name: String,
    /// The decoded payload.
    pub message: Value,
    /// The raw delivery, properties included.
    pub delivery: Delivery,
    /// The channel the delivery arrived on.
    pub channel: Arc<dyn Channel>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("event_name", &self.event_name)
            .field("queue_name", &self.queue_name)
            .field("message", &self.message)
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

impl Envelope {
    pub fn correlation_id(&self) -> Option<&str> {
        self.delivery.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.delivery.properties.reply_to.as_deref()
    }
}

/// Events emitted by the router.
#[derive(Debug, Clone)]
pub enum Event {
    /// Emitted for every delivery of every consumer.
    Receive(Envelope),
    /// Emitted for the event name of the consumer that got the delivery.
    DestinationMessage { name: String, envelope: Envelope },
}

pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Called with a delivery whose payload could not be decoded.
pub type DecodeFailureHandler = Arc<dyn Fn(&Delivery, &AmqpError) + Send + Sync>;

#[derive(Default)]
pub struct EventRouter {
    listeners: Mutex<Vec<EventHandler>>,
    handlers: Mutex<HashMap<String, EventHandler>>,
    decode_failures: Mutex<HashMap<String, DecodeFailureHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `name` unless a handler is already installed,
    /// and returns the handler that ends up registered.
    pub fn subscribe(&self, name: &str, handler: EventHandler) -> EventHandler {
        let mut handlers = self.handlers.lock();
        if let Some(existing) = handlers.get(name) {
            debug!(event = name, "event already subscribed");
            return existing.clone();
        }

        handlers.insert(name.to_owned(), handler.clone());
        handler
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.handlers.lock().contains_key(name)
    }

    /// Installs the decode failure handler of `name`, replacing any
    /// previous one.
    pub fn on_decode_failure(&self, name: &str, handler: DecodeFailureHandler) {
        self.decode_failures.lock().insert(name.to_owned(), handler);
    }

    /// Adds a listener for the generic receive event.
    pub fn on_receive(&self, listener: EventHandler) {
        self.listeners.lock().push(listener);
    }

    /// Delivers one event to its handlers. Handlers run outside the router's
    /// locks, so they may subscribe or emit themselves.
    pub fn emit(&self, event: &Event) {
        match event {
            Event::Receive(envelope) => {
                let listeners = self.listeners.lock().clone();
                for listener in listeners {
                    listener(envelope);
                }
            }
            Event::DestinationMessage { name, envelope } => {
                let handler = self.handlers.lock().get(name).cloned();
                match handler {
                    Some(handler) => handler(envelope),
                    None => debug!(event = name.as_str(), "no handler for event"),
                }
            }
        }
    }

    /// Emits the generic event, then the named one.
    pub fn dispatch(&self, envelope: Envelope) {
        self.emit(&Event::Receive(envelope.clone()));
        self.emit(&Event::DestinationMessage {
            name: envelope.event_name.clone(),
            envelope,
        });
    }

    /// Handles one delivery of a consumer started with `opts`.
    ///
    /// Decode failures are handed to the decode failure handler of
    /// `event_name`, if any, and returned before anything is emitted or
    /// acknowledged. Otherwise the delivery is acknowledged right after
    /// dispatch unless `opts` asks for `no_ack` or `manual_ack`; handlers are
    /// not awaited.
    pub fn deliver(
        &self,
        delivery: Delivery,
        queue_name: &str,
        event_name: &str,
        opts: &ConsumeOptions,
        channel: Arc<dyn Channel>,
    ) -> Result<(), AmqpError> {
        let message = match codec::unpack(
            &delivery.data,
            delivery.properties.content_type.as_deref(),
        ) {
            Ok(message) => message,
            Err(err) => {
                let handler = self.decode_failures.lock().get(event_name).cloned();
                if let Some(handler) = handler {
                    handler(&delivery, &err);
                }
                return Err(err);
            }
        };
        let delivery_tag = delivery.delivery_tag;

        self.dispatch(Envelope {
            kind: opts.receive_type,
            event_name: event_name.to_owned(),
            queue_name: queue_name.to_owned(),
            message,
            delivery,
            channel: channel.clone(),
        });

        if opts.auto_ack() {
            tokio::spawn(async move {
                if let Err(err) = channel.ack(delivery_tag).await {
                    error!(error = err.to_string(), "error whiling ack msg");
                }
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::JSON_CONTENT_TYPE, transport::MockChannel};
    use mockall::predicate::eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn json_delivery(tag: u64, body: &str) -> Delivery {
        let mut delivery = Delivery {
            delivery_tag: tag,
            data: body.as_bytes().to_vec(),
            ..Default::default()
        };
        delivery.properties.content_type = Some(JSON_CONTENT_TYPE.to_owned());
        delivery
    }

    #[tokio::test]
    async fn subscribing_twice_installs_one_handler() {
        let router = EventRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            router.subscribe(
                "orders:message",
                Arc::new(move |_: &Envelope| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let mut channel = MockChannel::new();
        channel.expect_ack().returning(|_| Ok(()));
        let opts = ConsumeOptions::default().no_ack();
        router
            .deliver(
                json_delivery(1, r#"{"id":7}"#),
                "orders",
                "orders:message",
                &opts,
                Arc::new(channel),
            )
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generic_event_comes_first() {
        let router = EventRouter::new();
        let order = Arc::new(Mutex::new(vec![]));

        let seen = order.clone();
        router.subscribe(
            "orders:message",
            Arc::new(move |env: &Envelope| seen.lock().push(format!("named {}", env.message))),
        );
        let seen = order.clone();
        router.on_receive(Arc::new(move |env: &Envelope| {
            seen.lock().push(format!("receive {} {:?}", env.event_name, env.kind))
        }));

        let opts = ConsumeOptions::default().no_ack();
        router
            .deliver(
                json_delivery(1, r#"{"id":7}"#),
                "orders",
                "orders:message",
                &opts,
                Arc::new(MockChannel::new()),
            )
            .unwrap();

        assert_eq!(
            *order.lock(),
            vec![
                "receive orders:message Queue".to_owned(),
                r#"named {"id":7}"#.to_owned()
            ]
        );
    }

    #[tokio::test]
    async fn acks_after_dispatch_by_default() {
        let router = EventRouter::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));

        let mut channel = MockChannel::new();
        channel.expect_ack().with(eq(9u64)).times(1).returning(move |_| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
            Ok(())
        });

        router
            .deliver(
                json_delivery(9, "[1,2]"),
                "orders",
                "orders:message",
                &ConsumeOptions::default(),
                Arc::new(channel),
            )
            .unwrap();

        rx.await.unwrap();
    }

    #[tokio::test]
    async fn decode_errors_propagate_without_dispatch() {
        let router = EventRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        router.on_receive(Arc::new(move |_: &Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut channel = MockChannel::new();
        channel.expect_ack().never();

        let res = router.deliver(
            json_delivery(1, "{broken"),
            "orders",
            "orders:message",
            &ConsumeOptions::default(),
            Arc::new(channel),
        );

        assert_eq!(res, Err(AmqpError::ParsePayloadError));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn decode_failures_reach_their_handler() {
        let router = EventRouter::new();
        let failures = Arc::new(Mutex::new(vec![]));

        let seen = failures.clone();
        router.on_decode_failure(
            "replies:message",
            Arc::new(move |delivery: &Delivery, err: &AmqpError| {
                seen.lock().push((delivery.delivery_tag, err.clone()))
            }),
        );

        let mut channel = MockChannel::new();
        channel.expect_ack().never();
        let channel: Arc<dyn Channel> = Arc::new(channel);

        let res = router.deliver(
            json_delivery(3, "{broken"),
            "replies",
            "replies:message",
            &ConsumeOptions::default(),
            channel.clone(),
        );
        assert_eq!(res, Err(AmqpError::ParsePayloadError));

        // other consumers keep their own handler, or none
        let _ = router.deliver(
            json_delivery(4, "{broken"),
            "orders",
            "orders:message",
            &ConsumeOptions::default(),
            channel,
        );

        assert_eq!(*failures.lock(), vec![(3u64, AmqpError::ParsePayloadError)]);
    }

    #[test]
    fn envelope_exposes_correlation() {
        let mut delivery = json_delivery(1, "{}");
        delivery.properties.correlation_id = Some("c-1".to_owned());
        delivery.properties.reply_to = Some("replies".to_owned());

        let envelope = Envelope {
            kind: ReceiveKind::Topic,
            event_name: "rpc".to_owned(),
            queue_name: "q".to_owned(),
            message: json!({}),
            delivery,
            channel: Arc::new(MockChannel::new()),
        };

        assert_eq!(envelope.correlation_id(), Some("c-1"));
        assert_eq!(envelope.reply_to(), Some("replies"));
    }
}
