// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::Level;

/// A log event captured on the producer's thread.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    /// Logger name; the tracing target
    pub logger: String,
    pub thread_name: String,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub throwable: Option<ThrowableInfo>,
}

/// Structured description of an error attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrowableInfo {
    pub message: String,
    /// Type name of the error, when known
    pub class_name: Option<String>,
    /// Messages of the error's source chain, outermost first
    pub stack_trace: Vec<String>,
}

impl LogRecord {
    /// A record stamped with the current time and thread.
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        LogRecord {
            level,
            logger: logger.into(),
            thread_name: current_thread_name(),
            timestamp: Utc::now(),
            message: Some(message.into()),
            fields: BTreeMap::new(),
            throwable: None,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_throwable(mut self, throwable: ThrowableInfo) -> Self {
        self.throwable = Some(throwable);
        self
    }
}

impl ThrowableInfo {
    /// Captures an error and its source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack_trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack_trace.push(cause.to_string());
            source = cause.source();
        }

        ThrowableInfo {
            message: err.to_string(),
            class_name: None,
            stack_trace,
        }
    }
}

pub(crate) fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", thread.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner failure")]
    struct Inner;

    #[test]
    fn throwable_walks_source_chain() {
        let info = ThrowableInfo::from_error(&Outer(Inner));
        assert_eq!(info.message, "outer failure");
        assert_eq!(info.stack_trace, vec!["inner failure".to_owned()]);
    }

    #[test]
    fn new_record_captures_calling_thread() {
        let handle = std::thread::Builder::new()
            .name("producer-7".to_owned())
            .spawn(|| LogRecord::new(Level::ERROR, "app", "boom"))
            .unwrap();
        let record = handle.join().unwrap();
        assert_eq!(record.thread_name, "producer-7");
        assert_eq!(record.message.as_deref(), Some("boom"));
    }
}
