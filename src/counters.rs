// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime delivery counters.
///
/// All counters only ever grow except `in_flight`, which tracks events that
/// were admitted but not yet published or abandoned.
#[derive(Debug, Default)]
pub struct Counters {
    /// Rejected at admission
    pub(crate) dropped_events: AtomicU64,
    /// New connections established
    pub(crate) reconnections: AtomicU64,
    /// Admitted but given up on at shutdown
    pub(crate) abandoned_events: AtomicU64,
    pub(crate) published_events: AtomicU64,
    pub(crate) in_flight: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub dropped_events: u64,
    pub reconnections: u64,
    pub abandoned_events: u64,
    pub published_events: u64,
    pub in_flight: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            abandoned_events: self.abandoned_events.load(Ordering::Relaxed),
            published_events: self.published_events.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dropped(&self) -> u64 {
        self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_admitted(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Undoes `record_admitted` for a task that never made it into the queue.
    pub(crate) fn retract_admitted(&self) {
        self.leave_in_flight();
    }

    pub(crate) fn record_published(&self) {
        self.published_events.fetch_add(1, Ordering::Relaxed);
        self.leave_in_flight();
    }

    // Saturates at zero: `abandon_in_flight` may already have taken the task.
    fn leave_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Moves everything still in flight to the abandoned counter.
    pub(crate) fn abandon_in_flight(&self) -> u64 {
        let abandoned = self.in_flight.swap(0, Ordering::AcqRel);
        self.abandoned_events.fetch_add(abandoned, Ordering::Relaxed);
        abandoned
    }
}
