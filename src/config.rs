// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Configuration
//!
//! Connection settings for a [`RabbitMQSession`](crate::session::RabbitMQSession).
//! Values can be deserialized from any serde source or read from `RABBITMQ_*`
//! environment variables.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use tracing::debug;

pub const ENV_RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const ENV_RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const ENV_RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const ENV_RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_APP_NAME: &str = "APP_NAME";

/// Connection and session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Sent to the broker as the connection name.
    pub app_name: String,
    /// Open the shared channel in publisher-confirm mode.
    pub confirm_channel: bool,
    /// Milliseconds to wait before tearing the connection down on close.
    pub close_delay: u64,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            app_name: "rabbitmq-rpc".to_owned(),
            confirm_channel: false,
            close_delay: 200,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the configuration from the environment, keeping the default for
    /// every variable that is not set.
    ///
    /// # Returns
    /// The configuration, or `InvalidConfiguration` when `RABBITMQ_PORT` is
    /// not a valid port number
    pub fn from_env() -> Result<Self, AmqpError> {
        let mut cfg = RabbitMQConfigs::default();

        if let Ok(host) = env::var(ENV_RABBITMQ_HOST) {
            cfg.host = host;
        }
        if let Ok(port) = env::var(ENV_RABBITMQ_PORT) {
            cfg.port = port.parse().map_err(|_| {
                AmqpError::InvalidConfiguration(format!("{}={}", ENV_RABBITMQ_PORT, port))
            })?;
        }
        if let Ok(user) = env::var(ENV_RABBITMQ_USER) {
            cfg.user = user;
        }
        if let Ok(password) = env::var(ENV_RABBITMQ_PASSWORD) {
            cfg.password = password;
        }
        if let Ok(vhost) = env::var(ENV_RABBITMQ_VHOST) {
            cfg.vhost = vhost;
        }
        if let Ok(name) = env::var(ENV_APP_NAME) {
            cfg.app_name = name;
        }

        debug!(host = cfg.host, port = cfg.port, "rabbitmq configs loaded");

        Ok(cfg)
    }

    /// Builds the AMQP URI used to open the connection.
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay)
    }
}

/// Options that identify a connection, hashed into the connection's
/// resource key together with the URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub connection_name: String,
}

impl From<&RabbitMQConfigs> for ConnectionOptions {
    fn from(cfg: &RabbitMQConfigs) -> Self {
        ConnectionOptions {
            connection_name: cfg.app_name.clone(),
        }
    }
}
