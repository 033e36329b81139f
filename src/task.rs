// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{client::PublishProperties, layout::Formatter, otel, record::LogRecord};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One admitted log record, rendered and ready to publish.
///
/// Everything that depends on the call site (payload, thread name, capture
/// time, trace context) is resolved in [`DeliveryTask::capture`] on the
/// producer's thread, before the task is queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTask {
    pub(crate) payload: String,
    pub(crate) correlation_id: String,
    pub(crate) level: String,
    pub(crate) content_type: String,
    pub(crate) captured_at: DateTime<Utc>,
    pub(crate) headers: BTreeMap<String, String>,
}

impl DeliveryTask {
    pub fn capture(record: &LogRecord, formatter: &dyn Formatter, identifier: &str) -> Self {
        let captured_at = Utc::now();

        DeliveryTask {
            payload: formatter.format(record),
            correlation_id: format!("{}:{}", identifier, captured_at.timestamp_millis()),
            level: record.level.as_str().to_owned(),
            content_type: formatter.content_type().to_owned(),
            captured_at,
            headers: otel::current_context_headers(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn level(&self) -> &str {
        &self.level
    }

    /// Wire properties for this task. A fresh message id is minted per call.
    pub(crate) fn properties(&self, app_id: &str) -> PublishProperties {
        PublishProperties {
            app_id: app_id.to_owned(),
            kind: self.level.clone(),
            correlation_id: self.correlation_id.clone(),
            content_type: self.content_type.clone(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: self.captured_at.timestamp().max(0) as u64,
            headers: self.headers.clone(),
        }
    }
}
