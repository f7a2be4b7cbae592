// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Session
//!
//! A session owns everything tied to one logical broker connection: the
//! connection itself, the single channel shared by every queue and
//! exchange, the declared queues and exchanges, the RPC clients and the
//! event router that consumers deliver into.
//!
//! Every resource is created at most once per distinct set of options (see
//! [`crate::registry`]). Sessions are plain values owned by the caller;
//! two sessions never share resources.

use crate::{
    channel::LapinBroker,
    config::{ConnectionOptions, RabbitMQConfigs},
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    publisher::{RabbitMQPublisher, SendOptions},
    queue::{ConsumeOptions, QueueOptions, ReceiveKind},
    registry::{ResourceCache, ResourceKey},
    router::{DecodeFailureHandler, EventHandler, EventRouter},
    rpc_client::{RpcQueueClient, RpcQueueClientOptions, RpcTopicClient, RpcTopicClientOptions},
    rpc_server::{RpcHandler, RpcServer, RpcServerOptions, RpcTopicServerOptions},
    transport::{Broker, Channel, Connection, Delivery, ExchangeInfo, QueueInfo},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Result of subscribing to a queue or a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: QueueInfo,
    pub consumer_tag: String,
    /// Name of the per-destination event fired for every delivery.
    pub event_name: String,
    /// The exchange the queue was bound to, for topic subscriptions.
    pub exchange: Option<ExchangeInfo>,
}

/// Options for [`RabbitMQSession::subscribe_topic`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSubscribeOptions {
    pub exchange: ExchangeOptions,
    /// Name of the bound queue. A server-named queue is used when absent and
    /// its deliveries are reported under the exchange name.
    pub queue_name: Option<String>,
    pub queue: QueueOptions,
    pub consume: ConsumeOptions,
}

pub struct RabbitMQSession {
    configs: RabbitMQConfigs,
    broker: Arc<dyn Broker>,
    connections: ResourceCache<Arc<dyn Connection>>,
    channels: ResourceCache<Arc<dyn Channel>>,
    queues: ResourceCache<QueueInfo>,
    exchanges: ResourceCache<ExchangeInfo>,
    queue_clients: ResourceCache<Arc<RpcQueueClient>>,
    topic_clients: ResourceCache<Arc<RpcTopicClient>>,
    router: EventRouter,
}

impl RabbitMQSession {
    pub fn new(configs: RabbitMQConfigs, broker: Arc<dyn Broker>) -> Arc<RabbitMQSession> {
        Arc::new(RabbitMQSession {
            configs,
            broker,
            connections: ResourceCache::new(),
            channels: ResourceCache::new(),
            queues: ResourceCache::new(),
            exchanges: ResourceCache::new(),
            queue_clients: ResourceCache::new(),
            topic_clients: ResourceCache::new(),
            router: EventRouter::new(),
        })
    }

    /// A session talking to a RabbitMQ server through `lapin`.
    pub fn amqp(configs: RabbitMQConfigs) -> Arc<RabbitMQSession> {
        RabbitMQSession::new(configs, Arc::new(LapinBroker))
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.configs
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Opens the session's connection, or returns the one already opened.
    pub async fn connect(&self) -> Result<Arc<dyn Connection>, AmqpError> {
        let url = self.configs.url();
        let opts = ConnectionOptions::from(&self.configs);
        let key = ResourceKey::connection(&url, &opts);

        self.connections
            .ensure(&key, || {
                let broker = self.broker.clone();
                async move { broker.connect(&url, &opts).await }
            })
            .await
    }

    /// The channel shared by every queue and exchange of the session.
    pub async fn channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        let conn = self.connect().await?;
        let confirm = self.configs.confirm_channel;

        self.channels
            .ensure(&ResourceKey::channel(), || async move {
                conn.create_channel(confirm).await
            })
            .await
    }

    pub async fn publisher(&self) -> Result<RabbitMQPublisher, AmqpError> {
        Ok(RabbitMQPublisher::new(self.channel().await?))
    }

    /// Declares the queue `name`, once per distinct set of options.
    ///
    /// An empty name declares a new server-named queue on every call. When
    /// the options ask for dead-lettering, the dead-letter exchange is
    /// declared in the background; its failure is logged, not returned.
    pub async fn init_queue(
        self: &Arc<Self>,
        name: &str,
        opts: QueueOptions,
    ) -> Result<QueueInfo, AmqpError> {
        let opts = opts.normalize(name);
        let channel = self.channel().await?;

        let declare = {
            let session = Arc::downgrade(self);
            let name = name.to_owned();
            let opts = opts.clone();
            async move {
                let queue = channel.assert_queue(&name, &opts).await?;
                if let (true, Some(exchange), Some(session)) = (
                    opts.catch_expired,
                    opts.dead_letter_exchange.clone(),
                    session.upgrade(),
                ) {
                    tokio::spawn(async move {
                        if let Err(err) = session
                            .init_topic(&exchange, ExchangeOptions::default())
                            .await
                        {
                            error!(
                                error = err.to_string(),
                                exchange, "failure to declare dead letter exchange"
                            );
                        }
                    });
                }
                Ok(queue)
            }
        };

        if name.is_empty() {
            return declare.await;
        }

        self.queues
            .ensure(&ResourceKey::queue(name, &opts), move || declare)
            .await
    }

    /// Declares the topic exchange `name`, once per distinct set of options.
    pub async fn init_topic(
        &self,
        name: &str,
        opts: ExchangeOptions,
    ) -> Result<ExchangeInfo, AmqpError> {
        let channel = self.channel().await?;
        let key = ResourceKey::exchange(name, &opts);
        let name = name.to_owned();

        self.exchanges
            .ensure(&key, move || async move {
                channel
                    .assert_exchange(&name, ExchangeKind::Topic, &opts)
                    .await
            })
            .await
    }

    /// Declares the queue if needed, then sends `payload` to it.
    pub async fn send_queue(
        self: &Arc<Self>,
        name: &str,
        payload: &Value,
        init: QueueOptions,
        opts: &SendOptions,
    ) -> Result<(), AmqpError> {
        let queue = self.init_queue(name, init).await?;
        self.send_to(&queue.queue, payload, opts).await
    }

    /// Sends `payload` to a queue without declaring it.
    pub async fn send_to(
        &self,
        queue: &str,
        payload: &Value,
        opts: &SendOptions,
    ) -> Result<(), AmqpError> {
        self.publisher()
            .await?
            .send_to_queue(queue, payload, opts)
            .await
    }

    /// Declares the exchange if needed, then publishes `payload` to it.
    pub async fn send_topic(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Value,
        init: ExchangeOptions,
        opts: &SendOptions,
    ) -> Result<(), AmqpError> {
        let exchange = self.init_topic(exchange, init).await?;
        self.publisher()
            .await?
            .publish(&exchange.exchange, routing_key, payload, opts)
            .await
    }

    /// Declares the queue if needed and starts consuming it.
    pub async fn subscribe_queue(
        self: &Arc<Self>,
        name: &str,
        init: QueueOptions,
        consume: ConsumeOptions,
    ) -> Result<Subscription, AmqpError> {
        let queue = self.init_queue(name, init).await?;
        self.consume_queue(queue, consume).await
    }

    async fn consume_queue(
        self: &Arc<Self>,
        queue: QueueInfo,
        mut opts: ConsumeOptions,
    ) -> Result<Subscription, AmqpError> {
        let event_name = opts
            .event_name
            .take()
            .unwrap_or_else(|| format!("{}:message", queue.queue));
        let channel = self.channel().await?;

        if let Some(prefetch) = opts.prefetch.filter(|p| *p > 0) {
            channel.prefetch(prefetch).await?;
        }

        let callback = {
            let session: Weak<RabbitMQSession> = Arc::downgrade(self);
            let queue_name = queue.queue.clone();
            let event_name = event_name.clone();
            let opts = opts.clone();
            let channel = channel.clone();
            move |delivery: Delivery| {
                let Some(session) = session.upgrade() else {
                    warn!(queue = queue_name, "delivery after session was dropped");
                    return;
                };
                if let Err(err) =
                    session
                        .router
                        .deliver(delivery, &queue_name, &event_name, &opts, channel.clone())
                {
                    error!(error = err.to_string(), queue = queue_name, "error consume msg");
                }
            }
        };

        let consumer_tag = channel
            .consume(&queue.queue, &opts, Arc::new(callback))
            .await?;
        debug!(queue = queue.queue, event = event_name, "queue subscribed");

        Ok(Subscription {
            queue,
            consumer_tag,
            event_name,
            exchange: None,
        })
    }

    /// Declares the exchange if needed, subscribes a queue and binds it with
    /// `routing_key`.
    pub async fn subscribe_topic(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        opts: TopicSubscribeOptions,
    ) -> Result<Subscription, AmqpError> {
        let exchange = self.init_topic(exchange, opts.exchange).await?;

        let mut consume = opts.consume;
        consume.receive_type = ReceiveKind::Topic;
        let queue_name = match opts.queue_name {
            Some(name) => name,
            None => {
                consume.event_name = Some(exchange.exchange.clone());
                String::new()
            }
        };

        let mut subscription = self.subscribe_queue(&queue_name, opts.queue, consume).await?;

        self.channel()
            .await?
            .bind_queue(&subscription.queue.queue, &exchange.exchange, routing_key)
            .await?;

        subscription.exchange = Some(exchange);
        Ok(subscription)
    }

    /// Installs the handler of a named event unless one is already
    /// installed; returns the installed handler.
    pub fn on(&self, event_name: &str, handler: EventHandler) -> EventHandler {
        self.router.subscribe(event_name, handler)
    }

    /// Installs the handler of deliveries of `event_name` that fail to
    /// decode.
    pub fn on_decode_failure(&self, event_name: &str, handler: DecodeFailureHandler) {
        self.router.on_decode_failure(event_name, handler)
    }

    /// Adds a listener for every delivery of every consumer.
    pub fn on_receive(&self, listener: EventHandler) {
        self.router.on_receive(listener)
    }

    /// Starts an RPC server on the queue `name`.
    pub async fn rpc_queue_server<H: RpcHandler>(
        self: &Arc<Self>,
        name: &str,
        handler: H,
        opts: RpcServerOptions,
    ) -> Result<Arc<RpcServer>, AmqpError> {
        RpcServer::on_queue(self, name, Arc::new(handler), opts).await
    }

    /// Starts an RPC server on a topic exchange.
    pub async fn rpc_topic_server<H: RpcHandler>(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        handler: H,
        opts: RpcTopicServerOptions,
    ) -> Result<Arc<RpcServer>, AmqpError> {
        RpcServer::on_topic(self, exchange, routing_key, Arc::new(handler), opts).await
    }

    /// The RPC client of the queue `server_queue`, created on first use.
    pub async fn rpc_queue_client(
        self: &Arc<Self>,
        server_queue: &str,
        opts: RpcQueueClientOptions,
    ) -> Result<Arc<RpcQueueClient>, AmqpError> {
        let key = ResourceKey::new(&format!("rpc-queue-client:{}", server_queue), &opts);
        let session = self.clone();
        let server_queue = server_queue.to_owned();

        self.queue_clients
            .ensure(&key, move || async move {
                RpcQueueClient::create(session, &server_queue, opts).await
            })
            .await
    }

    /// The RPC client of the exchange `exchange`, created on first use.
    pub async fn rpc_topic_client(
        self: &Arc<Self>,
        exchange: &str,
        opts: RpcTopicClientOptions,
    ) -> Result<Arc<RpcTopicClient>, AmqpError> {
        let key = ResourceKey::new(&format!("rpc-topic-client:{}", exchange), &opts);
        let session = self.clone();
        let exchange = exchange.to_owned();

        self.topic_clients
            .ensure(&key, move || async move {
                RpcTopicClient::create(session, &exchange, opts).await
            })
            .await
    }

    /// Drops a cached resource so that the next request creates it again.
    pub fn forget(&self, key: &ResourceKey) -> bool {
        self.connections.forget(key)
            | self.channels.forget(key)
            | self.queues.forget(key)
            | self.exchanges.forget(key)
            | self.queue_clients.forget(key)
            | self.topic_clients.forget(key)
    }

    pub fn queues(&self) -> &ResourceCache<QueueInfo> {
        &self.queues
    }

    pub fn exchanges(&self) -> &ResourceCache<ExchangeInfo> {
        &self.exchanges
    }

    /// Closes the channel and the connection after the configured delay,
    /// which lets in-flight publishes go out first. Failures are logged.
    pub async fn close(&self) {
        tokio::time::sleep(self.configs.close_delay()).await;

        for channel in self.channels.ready_all() {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }

        for conn in self.connections.ready_all() {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }

        debug!("session closed");
    }
}
