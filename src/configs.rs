// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application and Broker Configuration
//!
//! Settings are read from the process environment. Before reading, the dotenv file
//! matching `RUST_ENV` is loaded (if present) so local development needs no exports.

use dotenvy::from_filename;
use std::{env, fmt::Display};

pub const APP_NAME_ENV_KEY: &str = "APP_NAME";
pub const RUST_ENV_KEY: &str = "RUST_ENV";
pub const LOG_LEVEL_ENV_KEY: &str = "LOG_LEVEL";
pub const ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY: &str = "ENABLE_EXTERNAL_CRATES_LOGGING";
pub const AMQP_HOST_ENV_KEY: &str = "AMQP_HOST";
pub const AMQP_PORT_ENV_KEY: &str = "AMQP_PORT";
pub const AMQP_USER_ENV_KEY: &str = "AMQP_USER";
pub const AMQP_PASSWORD_ENV_KEY: &str = "AMQP_PASSWORD";
pub const AMQP_VHOST_ENV_KEY: &str = "AMQP_VHOST";

pub const LOCAL_ENV_FILE_NAME: &str = ".env.local";
pub const DEV_ENV_FILE_NAME: &str = ".env.development";
pub const STAGING_FILE_NAME: &str = ".env.staging";
pub const PROD_FILE_NAME: &str = ".env.production";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_rust_env() -> Environment {
        Environment::from(env::var(RUST_ENV_KEY).unwrap_or_default().as_str())
    }

    fn env_file(&self) -> &'static str {
        match self {
            Environment::Prod => PROD_FILE_NAME,
            Environment::Staging => STAGING_FILE_NAME,
            Environment::Dev => DEV_ENV_FILE_NAME,
            Environment::Local => LOCAL_ENV_FILE_NAME,
        }
    }
}

impl From<&str> for Environment {
    fn from(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" | "prod" => Environment::Prod,
            "staging" | "stg" => Environment::Staging,
            "development" | "develop" | "dev" => Environment::Dev,
            _ => Environment::Local,
        }
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Local => write!(f, "local"),
            Environment::Dev => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Prod => write!(f, "production"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfigs {
    ///Default: amqp-runner
    pub name: String,
    ///Default: Environment::Local
    pub env: Environment,
    ///Default: debug
    pub log_level: String,
    ///Default: false
    pub enable_external_crates_logging: bool,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "amqp-runner".to_owned(),
            env: Environment::Local,
            log_level: "debug".to_owned(),
            enable_external_crates_logging: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RabbitMQConfigs {
    ///Default: localhost
    pub host: String,
    ///Default: 5672
    pub port: u64,
    ///Default: guest
    pub user: String,
    ///Default: guest
    pub password: String,
    ///Default: /
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// The AMQP URI of the broker; the default vhost `/` is percent-encoded.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => "%2f".to_owned(),
            other => other.trim_start_matches('/').to_owned(),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

impl Configs {
    /// Loads the dotenv file for the current `RUST_ENV` and reads every known key.
    pub fn from_env() -> Configs {
        let env = Environment::from_rust_env();
        from_filename(env.env_file()).ok();

        let mut cfg = Configs::default();
        cfg.app.env = env;

        for (key, value) in env::vars() {
            cfg.fill(&key, &value);
        }

        cfg
    }

    fn fill(&mut self, key: &str, value: &str) {
        match key {
            APP_NAME_ENV_KEY => self.app.name = value.to_owned(),
            LOG_LEVEL_ENV_KEY => self.app.log_level = value.to_owned(),
            ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY => {
                self.app.enable_external_crates_logging = value.parse().unwrap_or_default()
            }
            AMQP_HOST_ENV_KEY => self.rabbitmq.host = value.to_owned(),
            AMQP_PORT_ENV_KEY => {
                self.rabbitmq.port = value.parse().unwrap_or(self.rabbitmq.port)
            }
            AMQP_USER_ENV_KEY => self.rabbitmq.user = value.to_owned(),
            AMQP_PASSWORD_ENV_KEY => self.rabbitmq.password = value.to_owned(),
            AMQP_VHOST_ENV_KEY => self.rabbitmq.vhost = value.to_owned(),
            _ => {}
        }
    }
}
