// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Implementation
//!
//! This module provides the error type shared by every layer of the crate.
//! The `AmqpError` enum is `Clone` because a single provisioning failure is
//! handed to every caller waiting on the same single-flight resource.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants fall into five groups: configuration errors (missing `replyTo`,
/// invalid settings), codec errors, resource provisioning errors reported by
/// the transport, the RPC timeout, and unexpected-state assertions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A code path that should be unreachable was reached
    #[error("unexpected situation: {0}")]
    UnexpectedState(String),

    /// A required configuration value is missing or malformed
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error closing a channel or the connection
    #[error("failure to close `{0}`")]
    ClosingError(String),

    /// An RPC request arrived without a `replyTo` destination
    #[error("expected replyTo property in message from queue `{0}`")]
    MissingReplyTo(String),

    /// An RPC call did not receive a reply before its expiration
    #[error("message timeout - {0}")]
    RpcTimeout(u64),
}
