// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Context Propagation
//!
//! Injects the producer's current trace context into the headers of the
//! message that carries its log record, so consumers can correlate log lines
//! with the originating trace.

use opentelemetry::{global, propagation::Injector, Context};
use std::collections::BTreeMap;

/// Adapter that lets an OpenTelemetry propagator write into message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Headers carrying the calling thread's current trace context.
///
/// Empty unless a global text map propagator has been installed.
pub(crate) fn current_context_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&Context::current(), &mut HeaderInjector::new(&mut headers))
    });
    headers
}
