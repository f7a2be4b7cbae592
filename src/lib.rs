// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod codec;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod router;
pub mod rpc_client;
pub mod rpc_server;
pub mod session;
pub mod transport;

pub use config::RabbitMQConfigs;
pub use errors::AmqpError;
pub use router::Envelope;
pub use rpc_client::{RpcQueueClient, RpcTopicClient};
pub use rpc_server::{sync_handler, HandlerResult, RpcHandler};
pub use session::RabbitMQSession;
