// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use rabbitmq_log_appender::{
    client::{BrokerChannel, BrokerClient, BrokerConnection, BrokerEndpoint, PublishProperties},
    configs::AppenderConfigs,
    errors::{AmqpError, ErrorKind},
    exchange::ExchangeDefinition,
    layout::JsonLayout,
    queue::{QueueBinding, QueueDefinition},
    reporter::ErrorReporter,
    shutdown::ClosureNotifier,
    RabbitMQAppender,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// One message as the broker saw it.
#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub payload: String,
}

impl Published {
    pub fn message(&self) -> String {
        let body: serde_json::Value = serde_json::from_str(&self.payload).unwrap();
        body["message"].as_str().unwrap_or_default().to_owned()
    }
}

#[derive(Default)]
struct BrokerState {
    healthy: AtomicBool,
    connects: AtomicUsize,
    channels: AtomicUsize,
    declares: AtomicUsize,
    published: Mutex<Vec<Published>>,
    open_channels: Mutex<Vec<(Arc<AtomicBool>, ClosureNotifier)>>,
}

/// In-memory broker that can be switched between failing and healthy.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    pub fn healthy() -> Self {
        let broker = FakeBroker::default();
        broker.set_healthy(true);
        broker
    }

    pub fn unreachable() -> Self {
        FakeBroker::default()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> usize {
        self.state.channels.load(Ordering::SeqCst)
    }

    pub fn declares(&self) -> usize {
        self.state.declares.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn published_messages(&self) -> Vec<String> {
        self.published().iter().map(Published::message).collect()
    }

    /// Closes the most recent channel the way the broker would, firing its
    /// closure notification.
    pub fn close_latest_channel(&self) {
        if let Some((open, notifier)) = self.state.open_channels.lock().unwrap().last() {
            open.store(false, Ordering::SeqCst);
            notifier.notify();
        }
    }

    fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn connect(
        &self,
        _endpoint: &BrokerEndpoint,
        _notifier: ClosureNotifier,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if !self.is_healthy() {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            broker: self.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct FakeConnection {
    broker: FakeBroker,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(
        &self,
        notifier: ClosureNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.broker.is_healthy() {
            return Err(AmqpError::ChannelError("channel refused".to_owned()));
        }

        let open = Arc::new(AtomicBool::new(true));
        self.broker.state.channels.fetch_add(1, Ordering::SeqCst);
        self.broker
            .state
            .open_channels
            .lock()
            .unwrap()
            .push((open.clone(), notifier));

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            open,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeChannel {
    broker: FakeBroker,
    open: Arc<AtomicBool>,
}

impl FakeChannel {
    fn check(&self) -> Result<(), AmqpError> {
        if self.broker.is_healthy() && self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::PublishingError("channel unavailable".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, _def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.check()?;
        self.broker.state.declares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn queue_declare(&self, _def: &QueueDefinition) -> Result<(), AmqpError> {
        self.check()
    }

    async fn queue_bind(&self, _binding: &QueueBinding) -> Result<(), AmqpError> {
        self.check()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &PublishProperties,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.check()?;
        self.broker.state.published.lock().unwrap().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps every report for later assertions.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, Option<AmqpError>, ErrorKind)>>,
}

impl RecordingReporter {
    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, kind)| *kind)
            .collect()
    }

    pub fn messages(&self, kind: ErrorKind) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, k)| *k == kind)
            .map(|(message, _, _)| message.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, message: &str, cause: Option<&AmqpError>, kind: ErrorKind) {
        self.reports
            .lock()
            .unwrap()
            .push((message.to_owned(), cause.cloned(), kind));
    }
}

pub fn configs() -> AppenderConfigs {
    AppenderConfigs {
        identifier: Some("test-node".to_owned()),
        backoff_initial: Duration::from_millis(1),
        backoff_max: Duration::from_millis(16),
        close_timeout: Duration::from_secs(1),
        ..AppenderConfigs::default()
    }
}

pub fn appender(
    configs: AppenderConfigs,
    broker: &FakeBroker,
) -> (Arc<RabbitMQAppender>, Arc<RecordingReporter>) {
    let reporter = Arc::new(RecordingReporter::default());
    let appender = Arc::new(RabbitMQAppender::new(
        configs,
        Arc::new(broker.clone()),
        Arc::new(JsonLayout),
        reporter.clone(),
    ));
    (appender, reporter)
}

/// Polls `condition` until it holds, failing the test after 10s.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
