//! Keyed work queue feeding the reconcile workers.
//!
//! Invariants the queue maintains:
//! - a key pending more than once is collapsed into a single entry;
//! - a key currently being reconciled is never handed to a second
//!   worker; a push while in flight marks the key dirty, and `done`
//!   re-queues it so the late event is not lost.
//!
//! Delayed re-pushes (requeue-after, error backoff) are scheduled by
//! the workers with a timer plus a plain `push`.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Identity of one reconcilable object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkKey {
    /// A VirtualMachine in the watched namespace
    VirtualMachine { name: String },
    /// A cluster-scoped DeploymentZone
    DeploymentZone { name: String },
}

impl std::fmt::Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkKey::VirtualMachine { name } => write!(f, "VirtualMachine/{name}"),
            WorkKey::DeploymentZone { name } => write!(f, "DeploymentZone/{name}"),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<WorkKey>,
    pending_set: HashSet<WorkKey>,
    in_flight: HashSet<WorkKey>,
    dirty: HashSet<WorkKey>,
}

/// Multi-producer work queue with per-key serialization.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a key. Duplicates of a pending key are collapsed; a key
    /// in flight is re-run after its current reconcile finishes.
    pub fn push(&self, key: WorkKey) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.pending_set.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Waits for the next key and marks it in flight.
    pub async fn pop(&self) -> WorkKey {
        loop {
            let notified = self.notify.notified();
            if let Some(key) = self.try_pop() {
                return key;
            }
            notified.await;
        }
    }

    /// Non-blocking pop, primarily for tests.
    pub fn try_pop(&self) -> Option<WorkKey> {
        let mut state = self.state.lock().ok()?;
        let key = state.pending.pop_front()?;
        state.pending_set.remove(&key);
        state.in_flight.insert(key.clone());
        Some(key)
    }

    /// Marks a reconcile finished. A key pushed while it was in flight
    /// goes back on the queue.
    pub fn done(&self, key: &WorkKey) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.in_flight.remove(key);
        if state.dirty.remove(key) && state.pending_set.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str) -> WorkKey {
        WorkKey::VirtualMachine {
            name: name.to_string(),
        }
    }

    #[test]
    fn duplicate_pending_keys_collapse() {
        let queue = WorkQueue::new();
        queue.push(vm("a"));
        queue.push(vm("a"));
        queue.push(vm("a"));

        assert_eq!(queue.try_pop(), Some(vm("a")));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn in_flight_key_is_never_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.push(vm("a"));
        let key = queue.try_pop().expect("one key pending");

        // Event arrives while the key is being reconciled.
        queue.push(vm("a"));
        assert_eq!(queue.try_pop(), None);

        // Finishing the reconcile releases the dirty key.
        queue.done(&key);
        assert_eq!(queue.try_pop(), Some(vm("a")));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let queue = WorkQueue::new();
        queue.push(vm("a"));
        queue.push(WorkKey::DeploymentZone {
            name: "zone-1".to_string(),
        });

        let first = queue.try_pop().expect("first key");
        let second = queue.try_pop().expect("second key");
        assert_ne!(first, second);
    }

    #[test]
    fn done_without_dirty_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.push(vm("a"));
        let key = queue.try_pop().expect("one key pending");
        queue.done(&key);

        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn pop_wakes_up_on_push() {
        use std::sync::Arc;

        let queue = Arc::new(WorkQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(vm("late"));

        let key = popper.await.expect("popper task");
        assert_eq!(key, vm("late"));
    }
}
