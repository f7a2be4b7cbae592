// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use futures_util::future::join_all;
use rabbitmq_rpc::{
    codec::JSON_CONTENT_TYPE,
    memory::MemoryBroker,
    publisher::SendOptions,
    queue::{ConsumeOptions, QueueOptions},
    rpc_client::{RpcQueueClientOptions, RpcTopicClientOptions},
    rpc_server::{RpcServerOptions, RpcTopicServerOptions},
    sync_handler,
    transport::MessageProperties,
    AmqpError, Envelope, HandlerResult, RabbitMQConfigs, RabbitMQSession,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

fn session() -> (MemoryBroker, Arc<RabbitMQSession>) {
    let broker = MemoryBroker::new();
    let configs = RabbitMQConfigs {
        close_delay: 0,
        ..Default::default()
    };
    (broker.clone(), RabbitMQSession::new(configs, Arc::new(broker)))
}

fn within(ms: u64) -> SendOptions {
    SendOptions::default().expiration(Duration::from_millis(ms))
}

async fn reject(_: Envelope) -> HandlerResult {
    Err(json!({"error": "insufficient funds"}))
}

async fn double(request: Envelope) -> HandlerResult {
    let n: i64 = request
        .message
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| json!("not a number"))?;
    Ok(Some(json!(n * 2)))
}

#[tokio::test]
async fn handler_without_response_echoes_the_request() {
    let (_, session) = session();

    session
        .rpc_queue_server("rpc.echo", sync_handler(|_| Ok(None)), RpcServerOptions::default())
        .await
        .unwrap();
    let client = session
        .rpc_queue_client("rpc.echo", RpcQueueClientOptions::default())
        .await
        .unwrap();

    let reply = client.send(&json!({"x": 1}), &within(5_000)).await.unwrap();

    assert_eq!(reply.message, json!(r#"echo:{"x":1}"#));
    assert_eq!(client.correlator().pending_count(), 0);
}

#[tokio::test]
async fn call_without_server_times_out() {
    let (broker, session) = session();
    let client = session
        .rpc_queue_client("rpc.silent", RpcQueueClientOptions::default())
        .await
        .unwrap();

    let err = client.send(&json!("ping"), &within(50)).await.unwrap_err();

    assert_eq!(err, AmqpError::RpcTimeout(50));
    assert!(err.to_string().contains("50"));
    assert_eq!(client.correlator().pending_count(), 0);
    assert_eq!(broker.backlog("rpc.silent"), 1);
}

#[tokio::test]
async fn concurrent_declarations_hit_the_broker_once() {
    let (broker, session) = session();

    let (a, b) = tokio::join!(
        session.init_queue("orders", QueueOptions::default()),
        session.init_queue("orders", QueueOptions::default()),
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(broker.stats().queue_asserts, 1);
}

#[tokio::test]
async fn handler_error_is_the_reply() {
    let (_, session) = session();

    session
        .rpc_queue_server("rpc.pay", reject, RpcServerOptions::default())
        .await
        .unwrap();
    let client = session
        .rpc_queue_client("rpc.pay", RpcQueueClientOptions::default())
        .await
        .unwrap();

    let reply = client.send(&json!({"amount": 10}), &within(5_000)).await.unwrap();

    assert_eq!(reply.message, json!({"error": "insufficient funds"}));
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let (_, session) = session();

    session
        .rpc_queue_server(
            "rpc.mirror",
            sync_handler(|req| Ok(Some(req.message.clone()))),
            RpcServerOptions::default(),
        )
        .await
        .unwrap();
    let client = session
        .rpc_queue_client("rpc.mirror", RpcQueueClientOptions::default())
        .await
        .unwrap();

    let calls = (0..10).map(|i| {
        let client = client.clone();
        async move { client.send(&json!({"call": i}), &within(5_000)).await }
    });
    let replies = join_all(calls).await;

    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap().message, json!({"call": i}));
    }
}

#[tokio::test]
async fn clients_are_created_once() {
    let (broker, session) = session();

    let (a, b) = tokio::join!(
        session.rpc_queue_client("rpc.once", RpcQueueClientOptions::default()),
        session.rpc_queue_client("rpc.once", RpcQueueClientOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    // server queue plus one reply queue
    assert_eq!(broker.stats().queue_asserts, 2);
}

#[tokio::test]
async fn topic_rpc_round_trip() {
    let (_, session) = session();

    session
        .rpc_topic_server("rpc.math", "math.*", double, RpcTopicServerOptions::default())
        .await
        .unwrap();
    let client = session
        .rpc_topic_client("rpc.math", RpcTopicClientOptions::default())
        .await
        .unwrap();

    // numbers travel as text
    let reply = client
        .send("math.double", &json!(21), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.message, json!("42"));

    let reply = client
        .send("math.double", &json!("many"), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.message, Value::String("not a number".to_owned()));
}

#[tokio::test]
async fn unrouted_topic_call_expires() {
    let (_, session) = session();
    let client = session
        .rpc_topic_client("rpc.nobody", RpcTopicClientOptions::default())
        .await
        .unwrap();

    let err = client
        .send("math.double", &json!(1), &within(30))
        .await
        .unwrap_err();

    assert_eq!(err, AmqpError::RpcTimeout(30));
}

#[tokio::test]
async fn reply_listeners_see_every_reply() {
    let (_, session) = session();
    let seen = Arc::new(parking_lot::Mutex::new(vec![]));

    session
        .rpc_queue_server("rpc.audit", sync_handler(|_| Ok(Some(json!("ok")))), RpcServerOptions::default())
        .await
        .unwrap();
    let client = session
        .rpc_queue_client("rpc.audit", RpcQueueClientOptions::default())
        .await
        .unwrap();

    let log = seen.clone();
    client.on_receive(Arc::new(move |env: &Envelope| log.lock().push(env.message.clone())));

    client.send(&json!(1), &within(5_000)).await.unwrap();
    client.send(&json!(2), &within(5_000)).await.unwrap();

    assert_eq!(*seen.lock(), vec![json!("ok"), json!("ok")]);
}

#[tokio::test]
async fn undecodable_reply_fails_the_call() {
    let (_, session) = session();
    let channel = session.channel().await.unwrap();

    // replies with a body that is not the JSON it claims to be
    let sub = session
        .subscribe_queue("rpc.garbled", QueueOptions::default(), ConsumeOptions::default())
        .await
        .unwrap();
    session.on(
        &sub.event_name,
        Arc::new(move |request: &Envelope| {
            let channel = channel.clone();
            let reply_to = request.reply_to().unwrap_or_default().to_owned();
            let props = MessageProperties {
                content_type: Some(JSON_CONTENT_TYPE.to_owned()),
                correlation_id: request.correlation_id().map(str::to_owned),
                ..Default::default()
            };
            tokio::spawn(async move {
                channel
                    .send_to_queue(&reply_to, b"{broken".to_vec(), props)
                    .await
                    .unwrap();
            });
        }),
    );

    let client = session
        .rpc_queue_client("rpc.garbled", RpcQueueClientOptions::default())
        .await
        .unwrap();

    let err = client.send(&json!("ping"), &within(300)).await.unwrap_err();

    assert_eq!(err, AmqpError::ParsePayloadError);
    assert_eq!(client.correlator().pending_count(), 0);
}
