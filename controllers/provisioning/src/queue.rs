//! Work queue feeding the reconcile workers.
//!
//! Keys are deduplicated while queued and processed by at most one worker at
//! a time. A key added while it is being processed is marked dirty and queued
//! again when the worker calls [`WorkQueue::done`]. Delayed requeues keep one
//! deadline per key, so repeated triggers never stack up timers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Resource kind a key refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// ClusterTemplate
    Template,
    /// ProvisioningRequest
    Request,
}

/// Identity of one unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub kind: WorkKind,
    pub namespace: String,
    pub name: String,
}

impl WorkKey {
    pub fn template(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: WorkKind::Template,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn request(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: WorkKind::Request,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            WorkKind::Template => "ClusterTemplate",
            WorkKind::Request => "ProvisioningRequest",
        };
        write!(f, "{kind} {}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<WorkKey>,
    queued: HashSet<WorkKey>,
    processing: HashSet<WorkKey>,
    dirty: HashSet<WorkKey>,
    // At most one deadline per key
    scheduled: HashMap<WorkKey, Instant>,
    shut_down: bool,
}

impl QueueState {
    /// Returns true when the key was pushed onto `pending`
    fn enqueue(&mut self, key: WorkKey) -> bool {
        if self.shut_down || self.queued.contains(&key) {
            return false;
        }
        if self.processing.contains(&key) {
            debug!("{} is in flight, marking dirty", key);
            self.dirty.insert(key);
            return false;
        }
        self.queued.insert(key.clone());
        self.pending.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<WorkKey> = self
            .scheduled
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.scheduled.remove(&key);
            self.enqueue(key);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Cloneable handle to a shared work queue
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned lock only means a panicking holder; the sets stay consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enqueue a key; never blocks. Replaces any delayed requeue of the key.
    pub fn add(&self, key: WorkKey) {
        let mut state = self.state();
        state.scheduled.remove(&key);
        if state.enqueue(key) {
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue a key after a delay.
    ///
    /// A key holds one deadline; an earlier one already scheduled wins.
    pub fn add_after(&self, key: WorkKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.state();
        if state.shut_down {
            return;
        }
        if let Some(existing) = state.scheduled.get(&key) {
            if *existing <= deadline {
                debug!("{} already requeued sooner", key);
                return;
            }
        }
        state.scheduled.insert(key, deadline);
        drop(state);
        // Idle workers recompute their wake-up time
        self.inner.notify.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn next(&self) -> Option<WorkKey> {
        loop {
            let wake_at = {
                let mut state = self.state();
                if state.shut_down {
                    drop(state);
                    // Pass the wakeup on so every idle worker observes shutdown
                    self.inner.notify.notify_one();
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.scheduled.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                state.scheduled.values().min().copied()
            };
            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        () = self.inner.notify.notified() => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.inner.notify.notified().await,
            }
        }
    }

    /// Mark a key as finished; re-queues it if it was added meanwhile
    pub fn done(&self, key: &WorkKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.remove(key) && state.enqueue(key.clone()) {
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake idle workers
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shut_down = true;
        state.scheduled.clear();
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// Number of keys ready to be picked up
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    /// Number of keys waiting on a delayed requeue
    #[must_use]
    pub fn scheduled(&self) -> usize {
        self.state().scheduled.len()
    }

    /// Number of keys currently being processed
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }
}
