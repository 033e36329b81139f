// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tracing Integration
//!
//! [`AmqpLogLayer`] is the inbound side of the appender: a
//! `tracing_subscriber` layer that turns events at or above a severity
//! threshold into [`LogRecord`]s and hands them to
//! [`RabbitMQAppender::append`].
//!
//! Events from this crate and from the AMQP client stack are never forwarded;
//! publishing them would feed the appender its own diagnostics.

use crate::{
    appender::RabbitMQAppender,
    record::{current_thread_name, LogRecord, ThrowableInfo},
};
use chrono::Utc;
use serde_json::Value;
use std::{collections::BTreeMap, error::Error, fmt, sync::Arc};
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    layer::{Context, Layer, SubscriberExt},
    registry::LookupSpan,
    util::{SubscriberInitExt, TryInitError},
    Registry,
};

const IGNORED_TARGETS: [&str; 4] = [
    env!("CARGO_CRATE_NAME"),
    "lapin",
    "amq_protocol",
    "pinky_swear",
];

/// Forwards tracing events to a [`RabbitMQAppender`].
pub struct AmqpLogLayer {
    appender: Arc<RabbitMQAppender>,
    threshold: Level,
}

impl AmqpLogLayer {
    /// Layer using the appender's configured threshold.
    pub fn new(appender: Arc<RabbitMQAppender>) -> Self {
        let threshold = appender.configs().threshold;
        Self::with_threshold(appender, threshold)
    }

    pub fn with_threshold(appender: Arc<RabbitMQAppender>, threshold: Level) -> Self {
        AmqpLogLayer {
            appender,
            threshold,
        }
    }

    fn accepts(&self, level: &Level, target: &str) -> bool {
        *level <= self.threshold
            && !IGNORED_TARGETS.iter().any(|ignored| {
                target
                    .strip_prefix(ignored)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
            })
    }
}

impl<S> Layer<S> for AmqpLogLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !self.accepts(meta.level(), meta.target()) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: *meta.level(),
            logger: meta.target().to_owned(),
            thread_name: current_thread_name(),
            timestamp: Utc::now(),
            message: visitor.message,
            fields: visitor.fields,
            throwable: visitor.throwable,
        };

        self.appender.append(&record);
    }
}

/// Collects an event's fields. `message` is kept apart; an error value
/// becomes the record's throwable.
#[derive(Default)]
pub struct FieldVisitor {
    pub fields: BTreeMap<String, Value>,
    pub message: Option<String>,
    pub throwable: Option<ThrowableInfo>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_owned());
        } else {
            self.fields
                .insert(field.name().to_owned(), Value::String(value.to_owned()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        self.fields
            .insert(field.name().to_owned(), Value::String(value.to_string()));
        self.throwable = Some(ThrowableInfo::from_error(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields
                .insert(field.name().to_owned(), Value::String(format!("{:?}", value)));
        }
    }
}

/// Installs the global subscriber: a registry with the appender's layer and,
/// when `enable_stdout` is set, a `fmt` layer printing to the console.
pub fn init_tracing(appender: Arc<RabbitMQAppender>, enable_stdout: bool) -> Result<(), TryInitError> {
    let layer = AmqpLogLayer::new(appender);

    if enable_stdout {
        Registry::default()
            .with(layer)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    } else {
        Registry::default().with(layer).try_init()
    }
}
