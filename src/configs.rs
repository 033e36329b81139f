// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Appender Configuration
//!
//! Plain values describing where and how log records are published. Defaults
//! match a local RabbitMQ with the stock `guest` account.
//!
//! `AppenderConfigs::from_env` reads the following variables (an `.env` file
//! is honoured when present):
//!
//! - `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_VHOST`
//! - `RABBITMQ_USER`, `RABBITMQ_PASSWORD`
//! - `RABBITMQ_USE_TLS`, `RABBITMQ_VERIFY_TLS`, `RABBITMQ_TLS_CA_FILE`
//! - `RABBITMQ_EXCHANGE`, `RABBITMQ_EXCHANGE_KIND`, `RABBITMQ_DURABLE`
//! - `RABBITMQ_QUEUE`, `RABBITMQ_ROUTING_KEY`
//! - `APP_NAME`, `APPENDER_IDENTIFIER`, `APPENDER_THRESHOLD`
//! - `APPENDER_QUEUE_LIMIT`, `APPENDER_BACKPRESSURE` (`drop` | `block`)
//! - `APPENDER_BACKOFF_INITIAL_MS`, `APPENDER_BACKOFF_MAX_MS`
//! - `APPENDER_CLOSE_TIMEOUT_MS`

use crate::{
    admission::BackpressurePolicy,
    client::BrokerEndpoint,
    errors::{AmqpError, AppenderError},
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use tracing::Level;

const PEM_CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// How the connection to the broker is secured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    Plain,
    /// TLS with the peer verified against the platform roots, or against
    /// `ca_file` when one is given.
    Tls { ca_file: Option<PathBuf> },
    /// TLS that accepts any server certificate.
    TrustAll,
}

impl TlsPolicy {
    /// Reads and checks the configured trust material.
    ///
    /// Returns the PEM chain to hand to the TLS connector, if any. A missing
    /// file or one without a single certificate is a `TlsConfigError`.
    pub fn load_ca_chain(&self) -> Result<Option<String>, AmqpError> {
        let TlsPolicy::Tls {
            ca_file: Some(path),
        } = self
        else {
            return Ok(None);
        };

        let pem = std::fs::read_to_string(path).map_err(|err| {
            AmqpError::TlsConfigError(format!("cannot read {}: {}", path.display(), err))
        })?;

        if !pem.contains(PEM_CERTIFICATE_HEADER) {
            return Err(AmqpError::TlsConfigError(format!(
                "{} contains no PEM certificate",
                path.display()
            )));
        }

        Ok(Some(pem))
    }
}

/// Appender configuration.
#[derive(Debug, Clone)]
pub struct AppenderConfigs {
    // Connection
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub verify_tls: bool,
    /// CA bundle used when `verify_tls` is on; platform roots otherwise.
    /// With `use_tls` but not `verify_tls` the server certificate is not
    /// checked at all.
    pub tls_ca_file: Option<PathBuf>,
    pub username: String,
    pub password: String,
    pub vhost: String,

    // Topology
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub durable: bool,
    pub queue: String,
    pub routing_key: String,

    // Delivery
    /// Name the connection is registered under on the broker
    pub app_name: String,
    /// Published as the message app id; the local host name when unset
    pub identifier: Option<String>,
    /// Least severe level the tracing layer forwards
    pub threshold: Level,
    pub queue_limit: usize,
    pub backpressure: BackpressurePolicy,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub close_timeout: Duration,
}

impl Default for AppenderConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            use_tls: false,
            verify_tls: false,
            tls_ca_file: None,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            exchange: "amqp-exchange".to_owned(),
            exchange_kind: ExchangeKind::Direct,
            durable: false,
            queue: "amqp-queue".to_owned(),
            routing_key: String::new(),
            app_name: "rabbitmq-log-appender".to_owned(),
            identifier: None,
            threshold: Level::ERROR,
            queue_limit: 1024,
            backpressure: BackpressurePolicy::Drop,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(1024),
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl AppenderConfigs {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppenderError::ConfigError` if a value fails to parse or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self, AppenderError> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppenderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        let configs = Self {
            host: string("RABBITMQ_HOST", defaults.host),
            port: parse(&lookup, "RABBITMQ_PORT", defaults.port)?,
            use_tls: parse(&lookup, "RABBITMQ_USE_TLS", defaults.use_tls)?,
            verify_tls: parse(&lookup, "RABBITMQ_VERIFY_TLS", defaults.verify_tls)?,
            tls_ca_file: lookup("RABBITMQ_TLS_CA_FILE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            username: string("RABBITMQ_USER", defaults.username),
            password: string("RABBITMQ_PASSWORD", defaults.password),
            vhost: string("RABBITMQ_VHOST", defaults.vhost),

            exchange: string("RABBITMQ_EXCHANGE", defaults.exchange),
            exchange_kind: parse(&lookup, "RABBITMQ_EXCHANGE_KIND", defaults.exchange_kind)?,
            durable: parse(&lookup, "RABBITMQ_DURABLE", defaults.durable)?,
            queue: string("RABBITMQ_QUEUE", defaults.queue),
            routing_key: string("RABBITMQ_ROUTING_KEY", defaults.routing_key),

            app_name: string("APP_NAME", defaults.app_name),
            identifier: lookup("APPENDER_IDENTIFIER").filter(|v| !v.is_empty()),
            threshold: parse(&lookup, "APPENDER_THRESHOLD", defaults.threshold)?,
            queue_limit: parse(&lookup, "APPENDER_QUEUE_LIMIT", defaults.queue_limit)?,
            backpressure: parse(&lookup, "APPENDER_BACKPRESSURE", defaults.backpressure)?,
            backoff_initial: Duration::from_millis(parse(
                &lookup,
                "APPENDER_BACKOFF_INITIAL_MS",
                defaults.backoff_initial.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(parse(
                &lookup,
                "APPENDER_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )?),
            close_timeout: Duration::from_millis(parse(
                &lookup,
                "APPENDER_CLOSE_TIMEOUT_MS",
                defaults.close_timeout.as_millis() as u64,
            )?),
        };

        configs.validate()?;

        Ok(configs)
    }

    /// Validate configuration values for consistency.
    ///
    /// # Errors
    ///
    /// Returns `AppenderError::ConfigError` if validation fails.
    pub fn validate(&self) -> Result<(), AppenderError> {
        if self.queue_limit == 0 {
            return Err(AppenderError::ConfigError(
                "APPENDER_QUEUE_LIMIT must be greater than 0".to_owned(),
            ));
        }

        if self.backoff_initial.is_zero() {
            return Err(AppenderError::ConfigError(
                "APPENDER_BACKOFF_INITIAL_MS must be greater than 0".to_owned(),
            ));
        }

        if self.backoff_initial > self.backoff_max {
            return Err(AppenderError::ConfigError(format!(
                "APPENDER_BACKOFF_INITIAL_MS ({:?}) must be <= APPENDER_BACKOFF_MAX_MS ({:?})",
                self.backoff_initial, self.backoff_max
            )));
        }

        if self.verify_tls && !self.use_tls {
            return Err(AppenderError::ConfigError(
                "RABBITMQ_VERIFY_TLS requires RABBITMQ_USE_TLS".to_owned(),
            ));
        }

        Ok(())
    }

    /// Connection details for diagnostics, with the password masked.
    pub fn connection_details(&self) -> String {
        format!(
            "Host: {}, Port: {}, Virtual Host: {}, Username: {}, Password: {}, TLS: {}",
            self.host,
            self.port,
            self.vhost,
            self.username,
            if self.password.is_empty() { "" } else { "******" },
            self.use_tls
        )
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        match (self.use_tls, self.verify_tls) {
            (false, _) => TlsPolicy::Plain,
            (true, true) => TlsPolicy::Tls {
                ca_file: self.tls_ca_file.clone(),
            },
            (true, false) => TlsPolicy::TrustAll,
        }
    }

    /// Resolves the broker endpoint, loading TLS trust material.
    pub fn endpoint(&self) -> Result<BrokerEndpoint, AmqpError> {
        let tls = self.tls_policy();
        let ca_chain = tls.load_ca_chain()?;

        Ok(BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            tls,
            ca_chain,
            connection_name: self.app_name.clone(),
        })
    }

    pub fn topology(&self) -> Topology {
        Topology::new(
            ExchangeDefinition::new(&self.exchange)
                .kind(self.exchange_kind.clone())
                .durable(self.durable),
            QueueDefinition::new(&self.queue),
            QueueBinding::new(&self.queue)
                .exchange(&self.exchange)
                .routing_key(&self.routing_key),
        )
    }
}

/// Parse a looked-up value into the specified type with a default value.
fn parse<F, T>(lookup: &F, name: &str, default: T) -> Result<T, AppenderError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|e| AppenderError::ConfigError(format!("Invalid {name}: {e}"))),
        None => Ok(default),
    }
}
