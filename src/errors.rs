// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Appender
//!
//! `AmqpError` covers everything that can go wrong while talking to the broker.
//! `ErrorKind` classifies what gets handed to the error reporter, and
//! `AppenderError` is what the lifecycle operations return to the caller.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Every variant except `TlsConfigError` is transient: the delivery worker
/// retries them with backoff and they never reach a producer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// No live connection or channel to operate on
    #[error("not connected")]
    NotConnected,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Unusable TLS trust material
    #[error("invalid tls configuration: {0}")]
    TlsConfigError(String),

    /// Error closing a channel or connection
    #[error("failure to close: {0}")]
    CloseError(String),
}

impl AmqpError {
    /// Whether retrying the failed operation can succeed later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AmqpError::TlsConfigError(_) | AmqpError::InternalError)
    }
}

/// Classification attached to every report sent to the error reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectFailure,
    ChannelFailure,
    DeclareFailure,
    ConfigFailure,
    CloseFailure,
    /// Drain exceeded the shutdown deadline; queued events were abandoned.
    CloseTimeout,
    /// The admission queue refused an event.
    AdmissionRejected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectFailure => "connect_failure",
            ErrorKind::ChannelFailure => "channel_failure",
            ErrorKind::DeclareFailure => "declare_failure",
            ErrorKind::ConfigFailure => "config_failure",
            ErrorKind::CloseFailure => "close_failure",
            ErrorKind::CloseTimeout => "close_timeout",
            ErrorKind::AdmissionRejected => "admission_rejected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the appender lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppenderError {
    /// Activation hit a non-retryable problem and admission stays disabled
    #[error("appender disabled: {0}")]
    Disabled(AmqpError),

    /// Lifecycle operation called from the wrong state
    #[error("invalid appender state: {0}")]
    InvalidState(&'static str),

    /// Configuration values are unusable
    #[error("configuration error: {0}")]
    ConfigError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_errors_are_not_transient() {
        assert!(!AmqpError::TlsConfigError("bad pem".to_owned()).is_transient());
        assert!(AmqpError::ConnectionError("refused".to_owned()).is_transient());
        assert!(AmqpError::NotConnected.is_transient());
        assert!(AmqpError::PublishingError("closed".to_owned()).is_transient());
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("logs".to_owned(), "q".to_owned());
        assert_eq!(err.to_string(), "failure to binding exchange `logs` to queue `q`");
    }

    #[test]
    fn admission_and_timeout_kinds_are_distinct() {
        assert_ne!(ErrorKind::AdmissionRejected, ErrorKind::CloseTimeout);
        assert_eq!(ErrorKind::CloseTimeout.to_string(), "close_timeout");
    }
}
