//! Rate-limited, deduplicating work queue
//!
//! Notebook keys flow through this queue with three guarantees: duplicate
//! adds collapse while a key is pending, a key held by one worker is
//! never handed to another until `done`, and failed keys come back on an
//! exponential per-key backoff. The contract matches the queue the
//! controller's sync loop was designed around.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

/// Work queue of `namespace/name` keys.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    /// Create a queue with the default backoff schedule (5ms base,
    /// 1000s cap).
    pub fn new() -> Self {
        Self::with_backoff(BASE_DELAY, MAX_DELAY)
    }

    /// Create a queue with a custom backoff schedule.
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Add a key for processing.
    ///
    /// A key already pending is collapsed; a key currently being
    /// processed is marked dirty and re-queued when its holder calls
    /// [`WorkQueue::done`].
    pub fn add(&self, key: &str) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shutdown || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    /// Wait for the next key, or `None` once the queue is shut down.
    ///
    /// The returned key is marked as processing; no other caller receives
    /// it until [`WorkQueue::done`] runs.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key after processing, re-queuing it if adds arrived
    /// while it was held.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutdown {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Reset the backoff counter for a key after a successful sync.
    pub fn forget(&self, key: &str) {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .failures
            .remove(key);
    }

    /// Re-add a key after a failure, delayed by its exponential backoff.
    pub fn add_rate_limited(self: Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = backoff_for(self.base_delay, self.max_delay, *failures);
            *failures += 1;
            delay
        };
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // add() is a no-op once the queue is shut down.
            self.add(&key);
        });
    }

    /// Number of failures recorded for a key since its last `forget`.
    pub fn requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").queue.len()
    }

    /// True when no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut the queue down: pending keys are still handed out, blocked
    /// and future `get` calls observe `None`, adds become no-ops.
    pub fn shut_down(&self) {
        self.state.lock().expect("queue lock poisoned").shutdown = true;
        self.notify.notify_waiters();
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_for(base: Duration, max: Duration, failures: u32) -> Duration {
    let shift = failures.min(48);
    let nanos = base.as_nanos().saturating_mul(1u128 << shift);
    Duration::from_nanos(nanos.min(max.as_nanos()) as u64)
}

/// Table of per-key locks serializing reconciles of one notebook across
/// workers, on top of the queue's own guarantee.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for the given key, created on first use.
    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    async fn try_get(queue: &WorkQueue) -> Option<String> {
        timeout(Duration::from_millis(50), queue.get())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("u/a");
        queue.add("u/a");
        queue.add("u/a");

        assert_eq!(queue.get().await.as_deref(), Some("u/a"));
        queue.done("u/a");
        // Nothing left: the three adds collapsed into one.
        assert!(try_get(&queue).await.is_none());
    }

    /// Adds that arrive while a key is held defer until `done`, then
    /// collapse into a single successor entry.
    #[tokio::test]
    async fn in_flight_key_gains_at_most_one_successor() {
        let queue = WorkQueue::new();
        queue.add("u/a");
        let key = queue.get().await.unwrap();

        queue.add("u/a");
        queue.add("u/a");
        queue.add("u/a");
        // The key is processing; it must not be handed out again yet.
        assert!(try_get(&queue).await.is_none());

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("u/a"));
        queue.done("u/a");
        assert!(try_get(&queue).await.is_none());
    }

    /// N adds for one key yield at most N+1 hand-outs.
    #[tokio::test]
    async fn event_coalescing_bounds_hand_outs() {
        let queue = WorkQueue::new();
        let n = 10;
        let mut hand_outs = 0;
        for _ in 0..n {
            queue.add("u/a");
        }
        while let Some(key) = try_get(&queue).await {
            hand_outs += 1;
            // More events arrive mid-processing.
            if hand_outs == 1 {
                for _ in 0..n {
                    queue.add("u/a");
                }
            }
            queue.done(&key);
        }
        assert!(hand_outs <= n + 1, "hand_outs = {hand_outs}");
        assert_eq!(hand_outs, 2);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let queue = WorkQueue::new();
        queue.add("u/a");
        queue.add("u/b");
        let first = queue.get().await.unwrap();
        let second = queue.get().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_two_workers_hold_the_same_key() {
        let queue = Arc::new(WorkQueue::new());
        let holders = Arc::new(AtomicU32::new(0));
        let max_holders = Arc::new(AtomicU32::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            workers.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    queue.done(&key);
                }
            }));
        }

        for _ in 0..100 {
            queue.add("u/a");
            tokio::task::yield_now().await;
        }
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_are_delayed_exponentially() {
        let queue = Arc::new(WorkQueue::with_backoff(
            Duration::from_secs(1),
            Duration::from_secs(8),
        ));

        Arc::clone(&queue).add_rate_limited("u/a");
        assert_eq!(queue.requeues("u/a"), 1);
        // First failure: 1s delay.
        assert_eq!(queue.get().await.as_deref(), Some("u/a"));
        queue.done("u/a");

        Arc::clone(&queue).add_rate_limited("u/a");
        assert_eq!(queue.requeues("u/a"), 2);
        // Second failure: 2s delay; paused time auto-advances.
        assert_eq!(queue.get().await.as_deref(), Some("u/a"));
        queue.done("u/a");

        // Success resets the counter.
        queue.forget("u/a");
        assert_eq!(queue.requeues("u/a"), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(backoff_for(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff_for(base, max, 1), Duration::from_millis(10));
        assert_eq!(backoff_for(base, max, 10), Duration::from_millis(5120));
        assert_eq!(backoff_for(base, max, 60), max);
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters_and_rejects_adds() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("u/a");
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_by_key() {
        let locks = KeyedLocks::new();
        let first = locks.lock_for("u/a");
        let second = locks.lock_for("u/a");
        // Same underlying lock for the same key.
        assert!(Arc::ptr_eq(&first, &second));

        let guard = first.lock().await;
        assert!(second.try_lock().is_err());
        drop(guard);
        assert!(second.try_lock().is_ok());

        // Different key, different lock.
        let other = locks.lock_for("u/b");
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
