// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Admission Queue
//!
//! Bounded FIFO between any number of producers and the single delivery
//! worker. With the default [`BackpressurePolicy::Drop`] a full queue rejects
//! immediately, so producers never wait on the broker.

use crate::{counters::Counters, task::DeliveryTask};
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::mpsc::{self, error::TrySendError},
};

/// What `submit` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Reject the task right away.
    #[default]
    Drop,
    /// Wait for room when the calling thread is allowed to block: outside any
    /// runtime, or on a multi-thread runtime worker. On a current-thread
    /// runtime blocking would stall the worker too, so it behaves like `Drop`.
    Block,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(BackpressurePolicy::Drop),
            "block" => Ok(BackpressurePolicy::Block),
            other => Err(format!("unknown backpressure policy `{other}`")),
        }
    }
}

/// Outcome of [`AdmissionQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Accepted,
    /// No room left and the policy did not wait for any.
    Full,
    /// Admission was stopped, or the worker is gone.
    Closed,
}

impl Submit {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Submit::Accepted)
    }
}

/// Producer side of the queue. Cheap to share; `submit` takes `&self`.
pub struct AdmissionQueue {
    sender: mpsc::Sender<DeliveryTask>,
    policy: BackpressurePolicy,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

/// Consumer side, owned by the delivery worker.
pub struct AdmissionReceiver {
    receiver: mpsc::Receiver<DeliveryTask>,
}

impl AdmissionQueue {
    /// Creates a queue holding at most `capacity` tasks.
    pub fn bounded(
        capacity: usize,
        policy: BackpressurePolicy,
        counters: Arc<Counters>,
    ) -> (AdmissionQueue, AdmissionReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        (
            AdmissionQueue {
                sender,
                policy,
                closed: AtomicBool::new(false),
                counters,
            },
            AdmissionReceiver { receiver },
        )
    }

    /// Enqueues `task` for delivery.
    ///
    /// Never fails loudly: a full or closed queue yields `Full` or `Closed`
    /// and the task is discarded.
    pub fn submit(&self, task: DeliveryTask) -> Submit {
        if self.is_closed() {
            return Submit::Closed;
        }

        // Counted before the send so the worker can never observe a task
        // that is not yet in flight.
        self.counters.record_admitted();
        let outcome = match self.sender.try_send(task) {
            Ok(()) => Submit::Accepted,
            Err(TrySendError::Closed(_)) => Submit::Closed,
            Err(TrySendError::Full(task)) => match self.policy {
                BackpressurePolicy::Drop => Submit::Full,
                BackpressurePolicy::Block => self.send_blocking(task),
            },
        };

        if !outcome.is_accepted() {
            self.counters.retract_admitted();
        }
        outcome
    }

    fn send_blocking(&self, task: DeliveryTask) -> Submit {
        let sent = match Handle::try_current() {
            Err(_) => self.sender.blocking_send(task),
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.sender.send(task)))
            }
            Ok(_) => return Submit::Full,
        };

        match sent {
            Ok(()) => Submit::Accepted,
            Err(_) => Submit::Closed,
        }
    }

    /// Stops admission. Tasks already queued stay available to the worker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Number of tasks waiting in the queue.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("policy", &self.policy)
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AdmissionReceiver {
    /// Next task in FIFO order; `None` once the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<DeliveryTask> {
        self.receiver.recv().await
    }

    /// Closes the channel so producers fail fast, keeping queued tasks
    /// available to `recv`.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout::JsonLayout, record::LogRecord};
    use std::time::Duration;
    use tracing::Level;

    fn task(message: &str) -> DeliveryTask {
        DeliveryTask::capture(&LogRecord::new(Level::ERROR, "test", message), &JsonLayout, "test")
    }

    #[test]
    fn rejects_once_full() {
        let counters = Arc::new(Counters::default());
        let (queue, _receiver) = AdmissionQueue::bounded(3, BackpressurePolicy::Drop, counters.clone());

        for i in 0..3 {
            assert_eq!(queue.submit(task(&format!("t{i}"))), Submit::Accepted);
        }
        assert_eq!(queue.submit(task("overflow")), Submit::Full);
        assert_eq!(queue.len(), 3);
        assert_eq!(counters.snapshot().in_flight, 3);
    }

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let counters = Arc::new(Counters::default());
        let (queue, mut receiver) = AdmissionQueue::bounded(8, BackpressurePolicy::Drop, counters);

        for name in ["A", "B", "C"] {
            queue.submit(task(name));
        }

        for name in ["A", "B", "C"] {
            let next = receiver.recv().await.unwrap();
            assert!(next.payload().contains(name));
        }
    }

    #[tokio::test]
    async fn closed_queue_rejects_but_keeps_backlog() {
        let counters = Arc::new(Counters::default());
        let (queue, mut receiver) = AdmissionQueue::bounded(4, BackpressurePolicy::Drop, counters);

        queue.submit(task("queued"));
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.submit(task("late")), Submit::Closed);
        assert!(receiver.recv().await.unwrap().payload().contains("queued"));
    }

    #[test]
    fn block_policy_waits_for_room_outside_runtime() {
        let counters = Arc::new(Counters::default());
        let (queue, mut receiver) =
            AdmissionQueue::bounded(1, BackpressurePolicy::Block, counters.clone());
        assert_eq!(queue.submit(task("first")), Submit::Accepted);

        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let first = receiver.recv().await.unwrap();
                let second = receiver.recv().await.unwrap();
                (first, second)
            })
        });

        assert_eq!(queue.submit(task("second")), Submit::Accepted);
        let (first, second) = consumer.join().unwrap();
        assert!(first.payload().contains("first"));
        assert!(second.payload().contains("second"));
    }

    #[tokio::test]
    async fn block_policy_degrades_to_drop_on_current_thread_runtime() {
        let counters = Arc::new(Counters::default());
        let (queue, _receiver) = AdmissionQueue::bounded(1, BackpressurePolicy::Block, counters);

        assert_eq!(queue.submit(task("first")), Submit::Accepted);
        assert_eq!(queue.submit(task("second")), Submit::Full);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn block_policy_waits_for_room_on_multi_thread_runtime() {
        let counters = Arc::new(Counters::default());
        let (queue, mut receiver) =
            AdmissionQueue::bounded(1, BackpressurePolicy::Block, counters.clone());
        assert_eq!(queue.submit(task("first")), Submit::Accepted);

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let first = receiver.recv().await.unwrap();
            let second = receiver.recv().await.unwrap();
            (first, second)
        });

        assert_eq!(queue.submit(task("second")), Submit::Accepted);
        let (first, second) = consumer.await.unwrap();
        assert!(first.payload().contains("first"));
        assert!(second.payload().contains("second"));
        assert_eq!(counters.snapshot().in_flight, 2);
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let counters = Arc::new(Counters::default());
        let (queue, receiver) = AdmissionQueue::bounded(1, BackpressurePolicy::Drop, counters.clone());
        drop(receiver);

        assert_eq!(queue.submit(task("orphan")), Submit::Closed);
        assert_eq!(counters.snapshot().in_flight, 0);
    }

    #[test]
    fn parses_policy() {
        assert_eq!("Block".parse::<BackpressurePolicy>(), Ok(BackpressurePolicy::Block));
        assert!("wait".parse::<BackpressurePolicy>().is_err());
    }
}
