// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Clients
//!
//! Request/response over RabbitMQ. A client owns a reply queue; every call
//! gets a fresh correlation id, is sent with `replyTo` pointing at the reply
//! queue and waits until a reply carrying the same correlation id arrives or
//! the call expires.
//!
//! Every pending call is resolved exactly once. The reply path and the
//! expiry timer both remove the call from the pending map under its lock,
//! and only the one that removed it completes the caller.

use crate::{
    errors::AmqpError,
    exchange::ExchangeOptions,
    publisher::SendOptions,
    queue::{ConsumeOptions, QueueOptions},
    router::{EventHandler, Envelope},
    session::{RabbitMQSession, Subscription},
    transport::Delivery,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

/// Expiration applied to topic calls sent without one, in milliseconds.
pub const DEFAULT_TOPIC_EXPIRATION: u64 = 30_000;

pub type RpcReply = Result<Envelope, AmqpError>;

struct PendingCall {
    reply: oneshot::Sender<RpcReply>,
    timer: Option<JoinHandle<()>>,
}

/// Matches replies to the calls waiting for them.
#[derive(Default)]
pub struct Correlator {
    pending: Arc<Mutex<HashMap<String, PendingCall>>>,
    listeners: Mutex<Vec<EventHandler>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call under a new correlation id.
    pub fn register(&self) -> (String, oneshot::Receiver<RpcReply>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            id.clone(),
            PendingCall {
                reply: tx,
                timer: None,
            },
        );
        (id, rx)
    }

    /// Fails the call `id` with [`AmqpError::RpcTimeout`] once `timeout_ms`
    /// elapse, unless it is resolved first. Zero means no timeout.
    pub fn expire_after(&self, id: &str, timeout_ms: u64) {
        if timeout_ms == 0 {
            return;
        }

        let pending = self.pending.clone();
        let key = id.to_owned();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;

            let expired = pending.lock().remove(&key);
            if let Some(call) = expired {
                warn!(correlation_id = key, timeout_ms, "rpc call expired");
                let _ = call.reply.send(Err(AmqpError::RpcTimeout(timeout_ms)));
            }
        });

        let mut pending = self.pending.lock();
        match pending.get_mut(id) {
            Some(call) => call.timer = Some(timer),
            // already answered
            None => timer.abort(),
        }
    }

    /// Drops the call `id` without completing it.
    pub fn cancel(&self, id: &str) {
        if let Some(call) = self.pending.lock().remove(id) {
            if let Some(timer) = call.timer {
                timer.abort();
            }
        }
    }

    /// Adds a listener invoked for every message arriving on the reply
    /// queue, matched or not.
    pub fn on_receive(&self, listener: EventHandler) {
        self.listeners.lock().push(listener);
    }

    /// Handles one message of the reply queue.
    pub fn received(&self, envelope: &Envelope) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(envelope);
        }

        match envelope.correlation_id() {
            Some(id) => {
                self.settle(id, Ok(envelope.clone()));
            }
            None => debug!(queue = envelope.queue_name, "reply without correlation id"),
        }
    }

    /// Fails the call `id` with `err`, typically a reply that could not be
    /// decoded. Returns whether a pending call was found.
    pub fn fail(&self, id: &str, err: AmqpError) -> bool {
        self.settle(id, Err(err))
    }

    fn settle(&self, id: &str, outcome: RpcReply) -> bool {
        let call = self.pending.lock().remove(id);
        match call {
            Some(call) => {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
                let _ = call.reply.send(outcome);
                true
            }
            None => {
                debug!(correlation_id = id, "no pending call for reply");
                false
            }
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn wait(reply: oneshot::Receiver<RpcReply>) -> RpcReply {
        reply.await.unwrap_or_else(|_| {
            Err(AmqpError::UnexpectedState(
                "rpc call dropped before completion".to_owned(),
            ))
        })
    }
}

/// Options for [`RabbitMQSession::rpc_queue_client`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcQueueClientOptions {
    /// Options the server queue is declared with before each call.
    pub server_queue: QueueOptions,
    /// Reply queue name, server-named when absent.
    pub reply_queue_name: Option<String>,
    pub reply_queue: QueueOptions,
    pub consume: ConsumeOptions,
    /// Defaults for every call of the client.
    pub send: SendOptions,
}

impl Default for RpcQueueClientOptions {
    fn default() -> Self {
        Self {
            server_queue: QueueOptions::default(),
            reply_queue_name: None,
            reply_queue: QueueOptions::default().exclusive(),
            consume: ConsumeOptions::default().no_ack(),
            send: SendOptions::default(),
        }
    }
}

/// Options for [`RabbitMQSession::rpc_topic_client`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcTopicClientOptions {
    pub exchange: ExchangeOptions,
    pub reply_queue_name: Option<String>,
    pub reply_queue: QueueOptions,
    pub consume: ConsumeOptions,
    pub send: SendOptions,
    /// Milliseconds a call waits when its options carry no expiration.
    pub default_expiration: u64,
}

impl Default for RpcTopicClientOptions {
    fn default() -> Self {
        Self {
            exchange: ExchangeOptions::default(),
            reply_queue_name: None,
            reply_queue: QueueOptions::default(),
            consume: ConsumeOptions::default(),
            send: SendOptions::default(),
            default_expiration: DEFAULT_TOPIC_EXPIRATION,
        }
    }
}

/// Subscribes the reply queue and routes its messages into a new
/// correlator.
async fn listen_replies(
    session: &Arc<RabbitMQSession>,
    name: Option<&str>,
    queue: QueueOptions,
    consume: ConsumeOptions,
) -> Result<(Subscription, Arc<Correlator>), AmqpError> {
    let subscription = session
        .subscribe_queue(name.unwrap_or_default(), queue, consume)
        .await?;
    let correlator = Arc::new(Correlator::new());

    let target = correlator.clone();
    session.on(
        &subscription.event_name,
        Arc::new(move |envelope: &Envelope| target.received(envelope)),
    );

    let target = correlator.clone();
    session.on_decode_failure(
        &subscription.event_name,
        Arc::new(move |delivery: &Delivery, err: &AmqpError| {
            if let Some(id) = delivery.properties.correlation_id.as_deref() {
                target.fail(id, err.clone());
            }
        }),
    );

    Ok((subscription, correlator))
}

/// Options pinned on every call: a fresh correlation id and the reply queue.
fn call_options(defaults: &SendOptions, opts: &SendOptions, id: &str) -> SendOptions {
    let reply_to = defaults.reply_to.clone().unwrap_or_default();
    defaults
        .clone()
        .merge(opts)
        .merge(&SendOptions::default().correlation_id(id).reply_to(&reply_to))
}

/// Clients do not keep their session alive; the session owns them.
fn upgrade(session: &Weak<RabbitMQSession>) -> Result<Arc<RabbitMQSession>, AmqpError> {
    session
        .upgrade()
        .ok_or_else(|| {
            AmqpError::UnexpectedState("rpc client used after its session was dropped".to_owned())
        })
}

/// Client of an RPC server listening on a queue.
pub struct RpcQueueClient {
    session: Weak<RabbitMQSession>,
    server_queue: String,
    server_queue_options: QueueOptions,
    reply: Subscription,
    send_options: SendOptions,
    correlator: Arc<Correlator>,
}

impl RpcQueueClient {
    pub(crate) async fn create(
        session: Arc<RabbitMQSession>,
        server_queue: &str,
        opts: RpcQueueClientOptions,
    ) -> Result<Arc<RpcQueueClient>, AmqpError> {
        session
            .init_queue(server_queue, opts.server_queue.clone())
            .await?;

        let (reply, correlator) = listen_replies(
            &session,
            opts.reply_queue_name.as_deref(),
            opts.reply_queue,
            opts.consume,
        )
        .await?;
        debug!(server_queue, reply_queue = reply.queue.queue, "rpc queue client ready");

        Ok(Arc::new(RpcQueueClient {
            send_options: opts.send.reply_to(&reply.queue.queue),
            session: Arc::downgrade(&session),
            server_queue: server_queue.to_owned(),
            server_queue_options: opts.server_queue,
            reply,
            correlator,
        }))
    }

    /// Sends `payload` to the server queue and waits for the reply.
    ///
    /// Without an expiration the call waits until a reply arrives.
    pub async fn send(&self, payload: &Value, opts: &SendOptions) -> RpcReply {
        let session = upgrade(&self.session)?;
        let (id, reply) = self.correlator.register();
        let opts = call_options(&self.send_options, opts, &id);

        if let Err(err) = session
            .send_queue(
                &self.server_queue,
                payload,
                self.server_queue_options.clone(),
                &opts,
            )
            .await
        {
            self.correlator.cancel(&id);
            return Err(err);
        }
        drop(session);

        if let Some(expiration) = opts.expiration {
            self.correlator.expire_after(&id, expiration);
        }

        Correlator::wait(reply).await
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply.queue.queue
    }

    pub fn on_receive(&self, listener: EventHandler) {
        self.correlator.on_receive(listener)
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

/// Client of RPC servers bound to a topic exchange.
pub struct RpcTopicClient {
    session: Weak<RabbitMQSession>,
    exchange: String,
    exchange_options: ExchangeOptions,
    reply: Subscription,
    send_options: SendOptions,
    default_expiration: u64,
    correlator: Arc<Correlator>,
}

impl RpcTopicClient {
    pub(crate) async fn create(
        session: Arc<RabbitMQSession>,
        exchange: &str,
        opts: RpcTopicClientOptions,
    ) -> Result<Arc<RpcTopicClient>, AmqpError> {
        session.init_topic(exchange, opts.exchange.clone()).await?;

        let (reply, correlator) = listen_replies(
            &session,
            opts.reply_queue_name.as_deref(),
            opts.reply_queue,
            opts.consume,
        )
        .await?;
        debug!(exchange, reply_queue = reply.queue.queue, "rpc topic client ready");

        Ok(Arc::new(RpcTopicClient {
            send_options: opts.send.reply_to(&reply.queue.queue),
            session: Arc::downgrade(&session),
            exchange: exchange.to_owned(),
            exchange_options: opts.exchange,
            reply,
            default_expiration: opts.default_expiration,
            correlator,
        }))
    }

    /// Publishes `payload` with `routing_key` and waits for the reply.
    pub async fn send(&self, routing_key: &str, payload: &Value, opts: &SendOptions) -> RpcReply {
        let session = upgrade(&self.session)?;
        let (id, reply) = self.correlator.register();
        let mut opts = call_options(&self.send_options, opts, &id);
        opts.expiration.get_or_insert(self.default_expiration);

        if let Err(err) = session
            .send_topic(
                &self.exchange,
                routing_key,
                payload,
                self.exchange_options.clone(),
                &opts,
            )
            .await
        {
            self.correlator.cancel(&id);
            return Err(err);
        }
        drop(session);

        if let Some(expiration) = opts.expiration {
            self.correlator.expire_after(&id, expiration);
        }

        Correlator::wait(reply).await
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply.queue.queue
    }

    pub fn on_receive(&self, listener: EventHandler) {
        self.correlator.on_receive(listener)
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::ReceiveKind, transport::{Delivery, MockChannel}};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(correlation_id: Option<&str>) -> Envelope {
        let mut delivery = Delivery::default();
        delivery.properties.correlation_id = correlation_id.map(str::to_owned);

        Envelope {
            kind: ReceiveKind::Queue,
            event_name: "replies:message".to_owned(),
            queue_name: "replies".to_owned(),
            message: json!("pong"),
            delivery,
            channel: Arc::new(MockChannel::new()),
        }
    }

    #[tokio::test]
    async fn reply_resolves_the_matching_call() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.expire_after(&id, 5_000);
        assert!(correlator.is_pending(&id));

        correlator.received(&reply(Some(&id)));

        let envelope = Correlator::wait(rx).await.unwrap();
        assert_eq!(envelope.message, json!("pong"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_replies_are_ignored() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        correlator.on_receive(Arc::new(move |_: &Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        correlator.received(&reply(Some("someone-else")));
        correlator.received(&reply(None));

        assert!(correlator.is_pending(&id));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_call_fails_and_late_reply_is_dropped() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.expire_after(&id, 20);

        let res = Correlator::wait(rx).await;
        assert_eq!(res.unwrap_err(), AmqpError::RpcTimeout(20));
        assert!(!correlator.is_pending(&id));

        correlator.received(&reply(Some(&id)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_before_timer_is_armed_wins() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();

        correlator.received(&reply(Some(&id)));
        correlator.expire_after(&id, 10);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let envelope = Correlator::wait(rx).await.unwrap();
        assert_eq!(envelope.message, json!("pong"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_call_settles_once() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.expire_after(&id, 5_000);

        assert!(correlator.fail(&id, AmqpError::ParsePayloadError));
        assert!(!correlator.fail(&id, AmqpError::ParsePayloadError));
        correlator.received(&reply(Some(&id)));

        assert_eq!(
            Correlator::wait(rx).await.unwrap_err(),
            AmqpError::ParsePayloadError
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn zero_expiration_never_fires() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register();
        correlator.expire_after(&id, 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(correlator.is_pending(&id));
    }

    #[tokio::test]
    async fn cancel_forgets_the_call() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.cancel(&id);

        assert!(!correlator.is_pending(&id));
        assert!(matches!(
            Correlator::wait(rx).await,
            Err(AmqpError::UnexpectedState(_))
        ));
    }

    #[test]
    fn call_options_pin_correlation_and_reply_queue() {
        let defaults = SendOptions::default().reply_to("amq.gen-1").kind("rpc");
        let caller = SendOptions::default()
            .correlation_id("mine")
            .reply_to("elsewhere")
            .expiration(Duration::from_millis(50));

        let opts = call_options(&defaults, &caller, "generated");

        assert_eq!(opts.correlation_id.as_deref(), Some("generated"));
        assert_eq!(opts.reply_to.as_deref(), Some("amq.gen-1"));
        assert_eq!(opts.expiration, Some(50));
        assert_eq!(opts.kind.as_deref(), Some("rpc"));
    }
}
