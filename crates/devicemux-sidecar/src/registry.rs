//! In-flight pairing tasks.
//!
//! Pairing waits for a person to tap "Trust" on the device, so it runs in
//! the background across many reconciliation passes. The registry makes
//! sure at most one task per device is alive.

use std::collections::HashMap;
use std::future::Future;

use devicemux_core::Udid;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Background pairing tasks keyed by UDID.
#[derive(Debug, Default)]
pub struct PairingTaskRegistry {
    tasks: Mutex<HashMap<Udid, JoinHandle<()>>>,
}

impl PairingTaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task built by `make` unless one is already running for
    /// `udid`. Returns `true` if a task was spawned.
    ///
    /// The check and the insert happen under one lock, so concurrent
    /// callers spawn at most one task. Finished tasks of every device are
    /// dropped first.
    pub fn ensure_running<F, Fut>(&self, udid: &Udid, make: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        if tasks.contains_key(udid) {
            return false;
        }

        debug!(udid = %udid, "Starting pairing task");
        tasks.insert(udid.clone(), tokio::spawn(make()));
        true
    }

    /// Check if a pairing task is running for `udid`.
    #[must_use]
    pub fn is_running(&self, udid: &Udid) -> bool {
        self.tasks
            .lock()
            .get(udid)
            .is_some_and(|task| !task.is_finished())
    }

    /// Number of running tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Check if no task is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every task.
    pub fn abort_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}
