//! Keyed work queue
//!
//! Each key moves through `Idle -> Queued -> Running -> {Idle, QueuedAgain}`.
//! A key is handed to at most one worker at a time; events that arrive while
//! it is running collapse into a single follow-up run. Unrelated keys are
//! handed out in FIFO order to whichever worker asks next.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::store::ObjectKey;

/// Scheduling state of a key; absent means idle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    /// Waiting for a worker
    Queued,
    /// A worker holds the key
    Running,
    /// A worker holds the key and another run is owed afterwards
    QueuedAgain,
}

#[derive(Default)]
struct QueueState {
    keys: HashMap<ObjectKey, KeyState>,
    ready: VecDeque<ObjectKey>,
    /// Latest delayed-requeue ticket per key; older timers are stale
    timers: HashMap<ObjectKey, u64>,
    next_ticket: u64,
}

/// Work queue with per-key coalescing and delayed requeue
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing panics while the lock is held
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule a run for `key`, coalescing with any pending run
    pub fn add(&self, key: ObjectKey) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut state = self.lock();
        match state.keys.get(&key).copied() {
            None => {
                state.keys.insert(key.clone(), KeyState::Queued);
                state.ready.push_back(key);
                drop(state);
                self.notify.notify_one();
            }
            Some(KeyState::Running) => {
                trace!(key = %key, "key running, owing another pass");
                state.keys.insert(key, KeyState::QueuedAgain);
            }
            Some(KeyState::Queued) | Some(KeyState::QueuedAgain) => {}
        }
    }

    /// Schedule a run for `key` after `delay`.
    ///
    /// Replaces any earlier delayed run of the same key. Timers die with the
    /// queue on shutdown.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let ticket = {
            let mut state = self.lock();
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.timers.insert(key.clone(), ticket);
            ticket
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let current = {
                        let mut state = queue.lock();
                        if state.timers.get(&key) == Some(&ticket) {
                            state.timers.remove(&key);
                            true
                        } else {
                            false
                        }
                    };
                    if current {
                        queue.add(key);
                    }
                }
            }
        });
    }

    /// Drop any pending delayed run of `key`
    pub fn cancel_delayed(&self, key: &ObjectKey) {
        self.lock().timers.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            {
                let mut state = self.lock();
                if let Some(key) = state.ready.pop_front() {
                    state.keys.insert(key.clone(), KeyState::Running);
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        // Permits do not accumulate; pass the wakeup on
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Mark the run of `key` finished, requeueing it if events arrived meanwhile
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        match state.keys.get(key).copied() {
            Some(KeyState::QueuedAgain) => {
                state.keys.insert(key.clone(), KeyState::Queued);
                state.ready.push_back(key.clone());
                drop(state);
                self.notify.notify_one();
            }
            Some(KeyState::Running) => {
                state.keys.remove(key);
            }
            Some(KeyState::Queued) | None => {}
        }
    }

    /// Current state of `key`, `None` when idle
    pub fn state_of(&self, key: &ObjectKey) -> Option<KeyState> {
        self.lock().keys.get(key).copied()
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// True when no key is waiting for a worker
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and drop pending timers
    pub fn shut_down(&self) {
        self.shutdown.cancel();
    }

    /// True once [`shut_down`](Self::shut_down) was called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[tokio::test]
    async fn test_repeated_adds_coalesce_while_queued() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("a"));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.state_of(&key("a")), Some(KeyState::Queued));
    }

    // =========================================================================
    // Story Tests: serializing work on one Application
    // =========================================================================

    /// Story: While a worker reconciles an Application, three more edits land.
    /// The key is not handed to a second worker; exactly one follow-up pass
    /// runs after the first finishes.
    #[tokio::test]
    async fn story_events_during_a_run_collapse_into_one_follow_up() {
        let queue = WorkQueue::new();
        queue.add(key("a"));

        let running = queue.next().await.unwrap();
        assert_eq!(queue.state_of(&running), Some(KeyState::Running));

        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("a"));
        assert_eq!(queue.state_of(&running), Some(KeyState::QueuedAgain));
        assert!(queue.is_empty(), "running key must not be handed out twice");

        queue.done(&running);
        assert_eq!(queue.len(), 1);

        let again = queue.next().await.unwrap();
        assert_eq!(again, key("a"));
        queue.done(&again);
        assert_eq!(queue.state_of(&key("a")), None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_keys_are_handed_out_together() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("b"));

        let first = queue.next().await.unwrap();
        let second = queue.next().await.unwrap();
        assert_eq!(first, key("a"));
        assert_eq!(second, key("b"));
        assert_eq!(queue.state_of(&key("a")), Some(KeyState::Running));
        assert_eq!(queue.state_of(&key("b")), Some(KeyState::Running));
    }

    #[tokio::test]
    async fn test_waiting_worker_wakes_on_add() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::task::yield_now().await;
        queue.add(key("a"));

        assert_eq!(waiter.await.unwrap(), Some(key("a")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_workers() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("a"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_add_fires_after_delay() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_delayed_add_replaces_earlier_one() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_secs(1));
        queue.add_after(key("a"), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(queue.is_empty(), "superseded timer must not fire");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_delay_never_fires() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_secs(1));
        queue.cancel_delayed(&key("a"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(queue.is_empty());
    }
}
