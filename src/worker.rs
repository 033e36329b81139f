// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Worker
//!
//! The only consumer of the admission queue. Tasks are taken one at a time in
//! FIFO order and each one is retried until it is published; a task is never
//! skipped to make room for the next one. Between failed attempts the worker
//! sleeps on an exponential [`Backoff`].
//!
//! The lifecycle controller steers the worker through a `watch` channel:
//! [`WorkerCommand::Drain`] closes the queue and lets the worker empty it,
//! [`WorkerCommand::Abandon`] makes it give up at the next retry boundary.

use crate::{admission::AdmissionReceiver, counters::Counters, link::BrokerLink, task::DeliveryTask};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, warn};

/// Exponential retry delay: starts at `initial`, doubles per call, capped at
/// `max`. Infinite as an iterator.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Backoff {
            initial,
            max,
            next: initial,
        }
    }

    /// Returns the delay to wait now and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerCommand {
    Run,
    Drain,
    Abandon,
}

enum Next {
    Task(Option<DeliveryTask>),
    Command(bool),
}

pub(crate) struct DeliveryWorker {
    receiver: AdmissionReceiver,
    link: Arc<BrokerLink>,
    counters: Arc<Counters>,
    commands: watch::Receiver<WorkerCommand>,
    app_id: String,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl DeliveryWorker {
    pub(crate) fn new(
        receiver: AdmissionReceiver,
        link: Arc<BrokerLink>,
        counters: Arc<Counters>,
        commands: watch::Receiver<WorkerCommand>,
        app_id: &str,
        backoff_initial: Duration,
        backoff_max: Duration,
    ) -> Self {
        DeliveryWorker {
            receiver,
            link,
            counters,
            commands,
            app_id: app_id.to_owned(),
            backoff_initial,
            backoff_max,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("delivery worker started");
        let mut draining = false;

        loop {
            if !draining && *self.commands.borrow_and_update() != WorkerCommand::Run {
                draining = true;
                self.receiver.close();
                debug!("draining admission queue");
            }

            let next = if draining {
                Next::Task(self.receiver.recv().await)
            } else {
                tokio::select! {
                    biased;
                    changed = self.commands.changed() => Next::Command(changed.is_ok()),
                    task = self.receiver.recv() => Next::Task(task),
                }
            };

            let task = match next {
                Next::Command(true) => continue,
                Next::Command(false) => {
                    // Controller is gone; finish what was admitted.
                    draining = true;
                    self.receiver.close();
                    continue;
                }
                Next::Task(Some(task)) => task,
                Next::Task(None) => break,
            };

            if !self.deliver(task).await {
                debug!("delivery abandoned");
                break;
            }
        }

        debug!("delivery worker stopped");
    }

    /// Publishes `task`, retrying until it succeeds. Returns `false` when the
    /// worker was told to abandon before the task got out.
    async fn deliver(&mut self, task: DeliveryTask) -> bool {
        let properties = task.properties(&self.app_id);
        let payload = task.payload.as_bytes();
        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.link.publish_to_topology(&properties, payload).await {
                Ok(()) => {
                    self.counters.record_published();
                    if attempt > 1 {
                        debug!(correlation_id = %task.correlation_id, attempt, "published after retry");
                    }
                    return true;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    if attempt == 1 {
                        warn!(
                            error = err.to_string(),
                            correlation_id = %task.correlation_id,
                            "failure to publish log event, retrying"
                        );
                    } else {
                        debug!(
                            error = err.to_string(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "publish retry failed"
                        );
                    }

                    tokio::select! {
                        biased;
                        _ = abandoned(&mut self.commands) => return false,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Resolves once `Abandon` is issued or the controller has gone away.
async fn abandoned(commands: &mut watch::Receiver<WorkerCommand>) {
    loop {
        if *commands.borrow_and_update() == WorkerCommand::Abandon {
            return;
        }
        if commands.changed().await.is_err() {
            return;
        }
    }
}
