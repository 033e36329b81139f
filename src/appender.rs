// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Appender
//!
//! Lifecycle controller tying the pieces together:
//!
//! ```text
//! Uninitialized -> Activating -> Running -> Closing -> Closed
//! ```
//!
//! `append` is synchronous and never waits on the broker: the record is
//! formatted on the caller's thread and handed to the admission queue. The
//! single delivery worker publishes queued tasks in order through the
//! [`BrokerLink`]. Failures never surface to the caller; they are counted and
//! sent to the [`ErrorReporter`].

use crate::{
    admission::{AdmissionQueue, Submit},
    client::BrokerClient,
    configs::AppenderConfigs,
    counters::{Counters, CountersSnapshot},
    errors::{AmqpError, AppenderError, ErrorKind},
    layout::Formatter,
    link::{BrokerLink, LinkState},
    record::LogRecord,
    reporter::ErrorReporter,
    task::DeliveryTask,
    worker::{DeliveryWorker, WorkerCommand},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

const UNKNOWN_HOST: &str = "unknown-host";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppenderState {
    Uninitialized = 0,
    Activating = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl AppenderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AppenderState::Uninitialized,
            1 => AppenderState::Activating,
            2 => AppenderState::Running,
            3 => AppenderState::Closing,
            _ => AppenderState::Closed,
        }
    }
}

/// Everything created by a successful activation.
struct Pipeline {
    queue: AdmissionQueue,
    link: Arc<BrokerLink>,
    commands: watch::Sender<WorkerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().ok().and_then(|mut worker| worker.take())
    }
}

/// Asynchronous log appender publishing records to a RabbitMQ exchange.
pub struct RabbitMQAppender {
    configs: AppenderConfigs,
    client: Arc<dyn BrokerClient>,
    formatter: Arc<dyn Formatter>,
    reporter: Arc<dyn ErrorReporter>,
    counters: Arc<Counters>,
    state: AtomicU8,
    /// Set by a `close` that arrived while activation was in progress
    close_requested: AtomicBool,
    identifier: OnceLock<String>,
    pipeline: OnceLock<Pipeline>,
}

impl RabbitMQAppender {
    pub fn new(
        configs: AppenderConfigs,
        client: Arc<dyn BrokerClient>,
        formatter: Arc<dyn Formatter>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        RabbitMQAppender {
            configs,
            client,
            formatter,
            reporter,
            counters: Arc::new(Counters::default()),
            state: AtomicU8::new(AppenderState::Uninitialized as u8),
            close_requested: AtomicBool::new(false),
            identifier: OnceLock::new(),
            pipeline: OnceLock::new(),
        }
    }

    pub fn state(&self) -> AppenderState {
        AppenderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn configs(&self) -> &AppenderConfigs {
        &self.configs
    }

    /// Instance identifier used in correlation ids and as the message app
    /// id. Resolved at activation.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.get().map(String::as_str)
    }

    /// Current state of the broker link, `None` before activation.
    pub async fn link_state(&self) -> Option<LinkState> {
        match self.pipeline.get() {
            Some(pipeline) => Some(pipeline.link.state().await),
            None => None,
        }
    }

    /// Number of admitted tasks still waiting for the worker.
    pub fn pending(&self) -> usize {
        self.pipeline.get().map_or(0, |pipeline| pipeline.queue.len())
    }

    /// Builds the pipeline and tries to bring the link up.
    ///
    /// Connect, channel and topology failures are reported, not returned: the
    /// worker reconnects on its first publish. Only problems that no retry can
    /// fix (bad configuration, unusable TLS trust material) disable the
    /// appender, in which case it moves straight to `Closed`.
    pub async fn activate(&self) -> Result<(), AppenderError> {
        if self.transition(AppenderState::Uninitialized, AppenderState::Activating).is_err() {
            return Err(AppenderError::InvalidState("appender was already activated"));
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.set_state(AppenderState::Closed);
                return Err(AppenderError::InvalidState("activate requires a tokio runtime"));
            }
        };

        if let Err(err) = self.configs.validate() {
            self.reporter.report(&err.to_string(), None, ErrorKind::ConfigFailure);
            self.set_state(AppenderState::Closed);
            return Err(err);
        }

        let identifier = self
            .identifier
            .get_or_init(|| self.configs.identifier.clone().unwrap_or_else(local_host_name))
            .clone();

        let endpoint = match self.configs.endpoint() {
            Ok(endpoint) => endpoint,
            Err(err) => return Err(self.disable("failure to load tls configuration", err)),
        };

        debug!(details = self.configs.connection_details(), "activating rabbitmq appender");

        let link = Arc::new(BrokerLink::new(
            self.client.clone(),
            endpoint,
            self.configs.topology(),
            self.counters.clone(),
            runtime,
        ));

        match link.connect().await {
            Ok(_) => {}
            Err(err) if !err.is_transient() => {
                return Err(self.disable("failure to connect to rabbitmq", err));
            }
            Err(err) => self.reporter.report(
                "failure to connect to rabbitmq",
                Some(&err),
                ErrorKind::ConnectFailure,
            ),
        }

        match link.open_channel().await {
            Ok(_) => {}
            Err(AmqpError::NotConnected) => debug!("no connection, skipping channel creation"),
            Err(err) => self.reporter.report(
                "failure to create the channel",
                Some(&err),
                ErrorKind::ChannelFailure,
            ),
        }

        match link.declare_topology().await {
            Ok(()) => {}
            Err(AmqpError::NotConnected) => debug!("no channel, skipping topology declaration"),
            Err(err) => self.reporter.report(
                "failure to declare topology",
                Some(&err),
                ErrorKind::DeclareFailure,
            ),
        }

        let (queue, receiver) = AdmissionQueue::bounded(
            self.configs.queue_limit,
            self.configs.backpressure,
            self.counters.clone(),
        );
        let (commands, command_rx) = watch::channel(WorkerCommand::Run);
        let worker = DeliveryWorker::new(
            receiver,
            link.clone(),
            self.counters.clone(),
            command_rx,
            &identifier,
            self.configs.backoff_initial,
            self.configs.backoff_max,
        )
        .spawn();

        let pipeline = Pipeline {
            queue,
            link,
            commands,
            worker: Mutex::new(Some(worker)),
        };
        if self.pipeline.set(pipeline).is_err() {
            return Err(AppenderError::InvalidState("appender was already activated"));
        }

        self.set_state(AppenderState::Running);
        info!(identifier = %identifier, "rabbitmq appender running");

        if self.close_requested.swap(false, Ordering::AcqRel) {
            debug!("close requested during activation");
            self.close().await;
        }

        Ok(())
    }

    /// Captures `record` and queues it for delivery.
    ///
    /// Never blocks on the broker and never fails: when the appender is not
    /// running or the queue is full the record is dropped, counted and
    /// reported as [`ErrorKind::AdmissionRejected`].
    pub fn append(&self, record: &LogRecord) -> Submit {
        let pipeline = match self.pipeline.get() {
            Some(pipeline) if self.state() == AppenderState::Running => pipeline,
            _ => {
                return self.reject(Submit::Closed, "appender is not running, dropping log event")
            }
        };

        let identifier = self.identifier().unwrap_or(UNKNOWN_HOST);
        let task = DeliveryTask::capture(record, self.formatter.as_ref(), identifier);

        match pipeline.queue.submit(task) {
            Submit::Accepted => Submit::Accepted,
            Submit::Full => self.reject(Submit::Full, "admission queue is full, dropping log event"),
            Submit::Closed => {
                self.reject(Submit::Closed, "admission queue is closed, dropping log event")
            }
        }
    }

    /// Stops admission, drains the queue within the close timeout and
    /// releases the broker handles.
    ///
    /// Calling it again, or while another close is in progress, does
    /// nothing. A close issued during activation returns at once and is
    /// carried out as soon as the appender is running.
    pub async fn close(&self) {
        match self.transition(AppenderState::Running, AppenderState::Closing) {
            Ok(()) => {}
            Err(AppenderState::Uninitialized) => {
                let _ = self.transition(AppenderState::Uninitialized, AppenderState::Closed);
                return;
            }
            Err(AppenderState::Activating) => {
                self.close_requested.store(true, Ordering::Release);
                // Activation may have finished before the flag was set.
                if self.transition(AppenderState::Running, AppenderState::Closing).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }

        let Some(pipeline) = self.pipeline.get() else {
            self.set_state(AppenderState::Closed);
            return;
        };

        debug!(pending = pipeline.queue.len(), "closing rabbitmq appender");
        pipeline.queue.close();
        let _ = pipeline.commands.send(WorkerCommand::Drain);

        if let Some(worker) = pipeline.take_worker() {
            self.await_worker(pipeline, worker).await;
        }

        if let Err(err) = pipeline.link.close_channel().await {
            self.reporter.report("failure to close the channel", Some(&err), ErrorKind::CloseFailure);
        }
        if let Err(err) = pipeline.link.close_connection().await {
            self.reporter.report(
                "failure to close the connection",
                Some(&err),
                ErrorKind::CloseFailure,
            );
        }

        self.set_state(AppenderState::Closed);
        info!(
            published = self.counters.snapshot().published_events,
            dropped = self.counters.dropped_events(),
            "rabbitmq appender closed"
        );
    }

    async fn await_worker(&self, pipeline: &Pipeline, mut worker: JoinHandle<()>) {
        match timeout(self.configs.close_timeout, &mut worker).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => {
                warn!(error = err.to_string(), "delivery worker failed");
            }
            Err(_) => {
                let _ = pipeline.commands.send(WorkerCommand::Abandon);

                // A publish attempt in progress is allowed one backoff period
                // to finish before the worker is cut off.
                let grace = self.configs.backoff_max.max(Duration::from_millis(1));
                if timeout(grace, &mut worker).await.is_err() {
                    worker.abort();
                    let _ = worker.await;
                }
            }
        }

        let abandoned = self.counters.abandon_in_flight();
        if abandoned > 0 {
            self.reporter.report(
                &format!(
                    "timed out after {:?} draining the admission queue, abandoned {} log events",
                    self.configs.close_timeout, abandoned
                ),
                None,
                ErrorKind::CloseTimeout,
            );
        }
    }

    fn reject(&self, outcome: Submit, message: &str) -> Submit {
        let dropped = self.counters.record_dropped();
        self.reporter.report(
            &format!("{message} ({dropped} dropped so far)"),
            None,
            ErrorKind::AdmissionRejected,
        );
        outcome
    }

    fn disable(&self, message: &str, err: AmqpError) -> AppenderError {
        self.reporter.report(message, Some(&err), ErrorKind::ConfigFailure);
        self.set_state(AppenderState::Closed);
        AppenderError::Disabled(err)
    }

    fn transition(&self, from: AppenderState, to: AppenderState) -> Result<(), AppenderState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(AppenderState::from_u8)
    }

    fn set_state(&self, state: AppenderState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_owned())
}
