// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Out-of-band Closure Notifications
//!
//! Broker libraries report a connection or channel closed by the server or
//! the network from their own threads. A [`ClosureNotifier`] turns that
//! signal into a task that takes the link lock and clears the matching
//! handle, so the delivery worker's next attempt starts from a clean
//! "disconnected" state instead of a stale handle.
//!
//! Every handle stored by the link carries a generation number. A
//! notification only clears the handle it was issued for; a late one for a
//! handle that has since been replaced is ignored.

use crate::link::LinkHandles;
use std::{
    fmt,
    sync::{Arc, Weak},
};
use tokio::{runtime::Handle, sync::Mutex};
use tracing::debug;

/// Which of the two link handles a notifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Connection,
    Channel,
}

/// Callback handed to the broker client with every new connection or channel.
#[derive(Clone)]
pub struct ClosureNotifier {
    handles: Weak<Mutex<LinkHandles>>,
    runtime: Handle,
    kind: HandleKind,
    generation: u64,
}

impl ClosureNotifier {
    pub(crate) fn new(
        handles: &Arc<Mutex<LinkHandles>>,
        runtime: Handle,
        kind: HandleKind,
        generation: u64,
    ) -> Self {
        ClosureNotifier {
            handles: Arc::downgrade(handles),
            runtime,
            kind,
            generation,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signals that the handle was closed. Callable from any thread; the
    /// handle is cleared asynchronously on the appender's runtime.
    pub fn notify(&self) {
        let notifier = self.clone();
        self.runtime.spawn(async move {
            notifier.apply().await;
        });
    }

    /// Clears the handle under the link lock. Returns whether anything was
    /// cleared.
    pub async fn apply(&self) -> bool {
        let Some(handles) = self.handles.upgrade() else {
            return false;
        };

        let cleared = handles.lock().await.clear(self.kind, self.generation);
        debug!(
            kind = ?self.kind,
            generation = self.generation,
            cleared,
            "closure notification"
        );
        cleared
    }
}

impl fmt::Debug for ClosureNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureNotifier")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .finish()
    }
}
