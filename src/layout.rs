// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Record Layouts
//!
//! A [`Formatter`] renders a [`LogRecord`] into the message body. It runs on
//! the producer's thread at capture time, never on the delivery worker.

use crate::{client::JSON_CONTENT_TYPE, record::LogRecord};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Renders log records into message payloads.
pub trait Formatter: Send + Sync {
    fn format(&self, record: &LogRecord) -> String;

    /// Content type advertised on published messages.
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }
}

/// One JSON object per record.
///
/// ```json
/// {"threadName":"main","level":"ERROR","timestamp":1700000000000,
///  "message":"boom","logger":"app::db","fields":{...}}
/// ```
///
/// When the record carries an error, `throwable` and `stackTrace` are added.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLayout;

/// Wire shape of a record.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonEvent<'a> {
    thread_name: &'a str,
    level: &'a str,
    /// Milliseconds since the epoch
    timestamp: i64,
    message: Option<&'a str>,
    logger: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    throwable: Option<JsonThrowable<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_trace: Option<&'a [String]>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonThrowable<'a> {
    message: &'a str,
    class_name: Option<&'a str>,
}

impl<'a> From<&'a LogRecord> for JsonEvent<'a> {
    fn from(record: &'a LogRecord) -> Self {
        let throwable = record.throwable.as_ref();

        JsonEvent {
            thread_name: &record.thread_name,
            level: record.level.as_str(),
            timestamp: record.timestamp.timestamp_millis(),
            message: record.message.as_deref(),
            logger: &record.logger,
            fields: (!record.fields.is_empty()).then_some(&record.fields),
            throwable: throwable.map(|t| JsonThrowable {
                message: &t.message,
                class_name: t.class_name.as_deref(),
            }),
            stack_trace: throwable.map(|t| t.stack_trace.as_slice()),
        }
    }
}

impl Formatter for JsonLayout {
    fn format(&self, record: &LogRecord) -> String {
        json!(JsonEvent::from(record)).to_string()
    }
}

/// Elasticsearch bulk format: an action line followed by the source line,
/// each newline-terminated.
#[derive(Debug, Clone)]
pub struct ElasticSearchJsonLayout {
    index: String,
    doc_type: String,
}

impl Default for ElasticSearchJsonLayout {
    fn default() -> Self {
        Self {
            index: "json-index".to_owned(),
            doc_type: "json".to_owned(),
        }
    }
}

impl ElasticSearchJsonLayout {
    pub fn new(index: &str, doc_type: &str) -> Self {
        Self {
            index: index.to_owned(),
            doc_type: doc_type.to_owned(),
        }
    }
}

impl Formatter for ElasticSearchJsonLayout {
    fn format(&self, record: &LogRecord) -> String {
        let action = json!({ "index": { "_index": self.index, "_type": self.doc_type } });
        let source = BTreeMap::from([(self.doc_type.as_str(), JsonEvent::from(record))]);

        format!("{}\n{}\n", action, json!(source))
    }
}
