// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Servers
//!
//! Adapts an [`RpcHandler`] to a queue or topic subscription. For every
//! request the handler runs inside a consumer span, its outcome is published
//! to the request's `replyTo` queue under the request's correlation id and,
//! for manually acknowledged consumers, the request is acknowledged once the
//! reply went out.
//!
//! | Handler outcome | Reply payload |
//! |-----------------|---------------|
//! | `Ok(Some(v))`   | `v` |
//! | `Ok(None)`      | `"echo:"` followed by the request payload |
//! | `Err(v)`        | `v` |
//! | panic           | the panic message |

use crate::{
    codec,
    errors::AmqpError,
    exchange::ExchangeOptions,
    otel,
    publisher::SendOptions,
    queue::{default_dead_letter_routing_key, ConsumeOptions, QueueOptions, DEFAULT_DEAD_LETTER_EXCHANGE},
    router::Envelope,
    session::{RabbitMQSession, Subscription, TopicSubscribeOptions},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{any::Any, borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Messages expire from a topic server queue after this many milliseconds.
pub const DEFAULT_TOPIC_SERVER_TTL: u32 = 30_000;

/// `Ok(None)` asks for the echo reply, `Err` is replied as is.
pub type HandlerResult = Result<Option<Value>, Value>;

#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: Envelope) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, request: Envelope) -> HandlerResult {
        (self)(request).await
    }
}

/// A synchronous function used as an [`RpcHandler`].
pub struct SyncHandler<F>(F);

pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
{
    SyncHandler(f)
}

#[async_trait]
impl<F> RpcHandler for SyncHandler<F>
where
    F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, request: Envelope) -> HandlerResult {
        (self.0)(&request)
    }
}

/// Options for [`RabbitMQSession::rpc_queue_server`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcServerOptions {
    pub queue: QueueOptions,
    pub consume: ConsumeOptions,
    /// Options merged into every reply.
    pub response: SendOptions,
}

impl Default for RpcServerOptions {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            consume: ConsumeOptions::default().prefetch(1),
            response: SendOptions::default(),
        }
    }
}

/// Options for [`RabbitMQSession::rpc_topic_server`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcTopicServerOptions {
    pub exchange: ExchangeOptions,
    pub queue_name: Option<String>,
    pub queue: QueueOptions,
    pub consume: ConsumeOptions,
    pub response: SendOptions,
}

impl Default for RpcTopicServerOptions {
    fn default() -> Self {
        Self {
            exchange: ExchangeOptions::default(),
            queue_name: None,
            queue: QueueOptions::default()
                .dead_letter_exchange(DEFAULT_DEAD_LETTER_EXCHANGE)
                .dead_letter_routing_key(&default_dead_letter_routing_key(""))
                .ttl(DEFAULT_TOPIC_SERVER_TTL),
            consume: ConsumeOptions::default().prefetch(1),
            response: SendOptions::default(),
        }
    }
}

pub struct RpcServer {
    subscription: Subscription,
}

impl RpcServer {
    pub(crate) async fn on_queue(
        session: &Arc<RabbitMQSession>,
        name: &str,
        handler: Arc<dyn RpcHandler>,
        opts: RpcServerOptions,
    ) -> Result<Arc<RpcServer>, AmqpError> {
        let manual_ack = opts.consume.manual_ack;
        let subscription = session
            .subscribe_queue(name, opts.queue, opts.consume)
            .await?;

        serve(session, &subscription, handler, opts.response, manual_ack);
        Ok(Arc::new(RpcServer { subscription }))
    }

    pub(crate) async fn on_topic(
        session: &Arc<RabbitMQSession>,
        exchange: &str,
        routing_key: &str,
        handler: Arc<dyn RpcHandler>,
        opts: RpcTopicServerOptions,
    ) -> Result<Arc<RpcServer>, AmqpError> {
        let manual_ack = opts.consume.manual_ack;
        let subscription = session
            .subscribe_topic(
                exchange,
                routing_key,
                TopicSubscribeOptions {
                    exchange: opts.exchange,
                    queue_name: opts.queue_name,
                    queue: opts.queue,
                    consume: opts.consume,
                },
            )
            .await?;

        serve(session, &subscription, handler, opts.response, manual_ack);
        Ok(Arc::new(RpcServer { subscription }))
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

/// Installs the handler of the subscription's event. Each request is
/// processed on its own task.
fn serve(
    session: &Arc<RabbitMQSession>,
    subscription: &Subscription,
    handler: Arc<dyn RpcHandler>,
    response: SendOptions,
    manual_ack: bool,
) {
    let weak = Arc::downgrade(session);

    session.on(
        &subscription.event_name,
        Arc::new(move |request: &Envelope| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let request = request.clone();
            let handler = handler.clone();
            let response = response.clone();

            tokio::spawn(async move {
                let queue = request.queue_name.clone();
                if let Err(err) =
                    process_request(&session, request, handler.as_ref(), &response, manual_ack).await
                {
                    error!(error = err.to_string(), queue, "failure to process rpc request");
                }
            });
        }),
    );
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }
    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(_) => "rpc handler panicked".to_owned(),
    }
}

/// Runs `handler` for one request and publishes its reply.
pub(crate) async fn process_request(
    session: &RabbitMQSession,
    request: Envelope,
    handler: &dyn RpcHandler,
    response: &SendOptions,
    manual_ack: bool,
) -> Result<(), AmqpError> {
    let Some(reply_to) = request.reply_to().map(str::to_owned) else {
        warn!(queue = request.queue_name, "expected replyTo property in message");
        return Err(AmqpError::MissingReplyTo(request.queue_name.clone()));
    };

    let tracer = global::tracer("amqp rpc server");
    let (_ctx, mut span) = otel::new_span(
        &request.delivery.properties.headers,
        &tracer,
        &request.event_name,
    );

    let payload = request.message.clone();
    let mut opts = response.clone();
    if let Some(id) = request.correlation_id() {
        opts.correlation_id = Some(id.to_owned());
    }
    let channel = request.channel.clone();
    let delivery_tag = request.delivery.delivery_tag;

    let outcome = AssertUnwindSafe(handler.handle(request)).catch_unwind().await;
    let reply = match outcome {
        Ok(Ok(Some(value))) => value,
        Ok(Ok(None)) => Value::String(format!("echo:{}", codec::to_text(&payload))),
        Ok(Err(value)) => {
            span.set_status(Status::Error {
                description: Cow::from("rpc handler failure"),
            });
            value
        }
        Err(panic) => {
            let msg = panic_message(panic);
            error!(error = msg, "rpc handler panicked");
            span.set_status(Status::Error {
                description: Cow::from(msg.clone()),
            });
            Value::String(msg)
        }
    };

    debug!(reply_to, correlation_id = ?opts.correlation_id, "sending rpc reply");
    let sent = session.send_to(&reply_to, &reply, &opts).await;

    if manual_ack {
        if let Err(err) = channel.ack(delivery_tag).await {
            error!(error = err.to_string(), "error whiling ack msg");
        }
    }

    span.end();
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RabbitMQConfigs,
        memory::MemoryBroker,
        queue::ReceiveKind,
        transport::{Delivery, MockChannel},
    };
    use mockall::predicate::eq;
    use serde_json::json;

    fn request(reply_to: Option<&str>, channel: MockChannel) -> Envelope {
        let mut delivery = Delivery {
            delivery_tag: 4,
            ..Default::default()
        };
        delivery.properties.reply_to = reply_to.map(str::to_owned);
        delivery.properties.correlation_id = Some("c-9".to_owned());

        Envelope {
            kind: ReceiveKind::Queue,
            event_name: "rpc.sum:message".to_owned(),
            queue_name: "rpc.sum".to_owned(),
            message: json!([1, 2]),
            delivery,
            channel: Arc::new(channel),
        }
    }

    fn session() -> Arc<RabbitMQSession> {
        RabbitMQSession::new(RabbitMQConfigs::default(), Arc::new(MemoryBroker::new()))
    }

    #[tokio::test]
    async fn missing_reply_to_is_reported() {
        let mut channel = MockChannel::new();
        channel.expect_ack().never();

        let res = process_request(
            &session(),
            request(None, channel),
            &sync_handler(|_: &Envelope| Ok(None)),
            &SendOptions::default(),
            true,
        )
        .await;

        assert_eq!(res, Err(AmqpError::MissingReplyTo("rpc.sum".to_owned())));
    }

    #[tokio::test]
    async fn manual_ack_follows_the_reply() {
        let mut channel = MockChannel::new();
        channel
            .expect_ack()
            .with(eq(4u64))
            .times(1)
            .returning(|_| Ok(()));

        process_request(
            &session(),
            request(Some("replies"), channel),
            &sync_handler(|req: &Envelope| Ok(Some(json!(req.message.as_array().map(Vec::len))))),
            &SendOptions::default(),
            true,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn panics_become_replies() {
        async fn overflowing(_: Envelope) -> HandlerResult {
            panic!("sum overflow")
        }

        let broker = MemoryBroker::new();
        let session = RabbitMQSession::new(RabbitMQConfigs::default(), Arc::new(broker.clone()));
        session
            .init_queue("replies", QueueOptions::default())
            .await
            .unwrap();

        let res = process_request(
            &session,
            request(Some("replies"), MockChannel::new()),
            &overflowing,
            &SendOptions::default(),
            false,
        )
        .await;
        assert_eq!(res, Ok(()));

        let replies = broker.backlog_messages("replies");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].data, b"sum overflow");
        assert_eq!(replies[0].properties.correlation_id.as_deref(), Some("c-9"));
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_owned())), "owned");
        assert_eq!(panic_message(Box::new(7)), "rpc handler panicked");
    }

    #[test]
    fn topic_server_queue_dead_letters() {
        let opts = RpcTopicServerOptions::default();
        assert_eq!(
            opts.queue.dead_letter_exchange.as_deref(),
            Some("defaultDeadLetterExchange")
        );
        assert_eq!(
            opts.queue.dead_letter_routing_key.as_deref(),
            Some("default.expired.queue")
        );
        assert_eq!(opts.queue.message_ttl, Some(30_000));
        assert_eq!(opts.consume.prefetch, Some(1));
        assert!(!opts.consume.no_ack);
    }
}
