//! A rate-limited work queue in the style of the Kubernetes client's
//! workqueue: items are deduplicated while queued and serialized while
//! processing, so at most one worker handles a given key at a time.

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use registry_bridge_core::RateLimiter;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Failed items are requeued with back-off at most this many times.
pub const MAX_RETRIES: u32 = 5;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(30);

const REQUEUE_LIMIT: u32 = 256;
const REQUEUE_BURST: u32 = 512;

#[derive(Debug)]
struct State<K> {
    order: VecDeque<K>,
    dirty: AHashSet<K>,
    processing: AHashSet<K>,
    retries: AHashMap<K, u32>,
    shutting_down: bool,
}

#[derive(Debug)]
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    wake: Notify,
    limiter: RateLimiter,
}

// === impl WorkQueue ===

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                dirty: AHashSet::new(),
                processing: AHashSet::new(),
                retries: AHashMap::new(),
                shutting_down: false,
            }),
            wake: Notify::new(),
            limiter: RateLimiter::new(REQUEUE_LIMIT, REQUEUE_BURST),
        })
    }

    /// Enqueues a key. No-op if the key is already queued; if the key is
    /// being processed, it is requeued when the worker calls [`Self::done`].
    pub fn add(&self, key: K) {
        let queued = {
            let mut state = self.state.lock();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                false
            } else if state.processing.contains(&key) {
                false
            } else {
                state.order.push_back(key);
                true
            }
        };
        if queued {
            self.wake.notify_one();
        }
    }

    /// Dequeues the next key, suspending while the queue is empty. Returns
    /// `None` once the queue has shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(key) = state.order.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.wake.notified().await;
        }
    }

    /// Marks a key's processing as finished, requeueing it if it was
    /// re-added while in flight.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.order.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.wake.notify_one();
        }
    }

    /// Clears a key's failure count after a successful handling.
    pub fn forget(&self, key: &K) {
        self.state.lock().retries.remove(key);
    }

    /// Requeues a failed key through the rate limiter: exponential per-item
    /// back-off bounded by a shared token bucket. Returns `false` once the
    /// key has exhausted its retry budget; the caller should drop it.
    pub fn retry(self: &Arc<Self>, key: K) -> bool {
        let attempt = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return false;
            }
            let n = state.retries.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt > MAX_RETRIES {
            self.state.lock().retries.remove(&key);
            return false;
        }

        let delay = Self::backoff(attempt);
        let queue = self.clone();
        tokio::spawn(async move {
            queue.limiter.acquire().await;
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
        true
    }

    /// Shuts the queue down. Idempotent; queued items are still handed out
    /// until the queue drains, but no new items are accepted.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.wake.notify_waiters();
        // A worker parked between the drain check and notified() still
        // holds no permit; hand one out so it re-checks.
        self.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff(attempt: u32) -> Duration {
        BASE_DELAY
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedupes_while_queued() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn serializes_inflight_keys() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();

        // Re-added while in flight: not handed out again until done().
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_then_drops() {
        let queue = WorkQueue::<&str>::new();
        for _ in 0..MAX_RETRIES {
            assert!(queue.retry("a"));
            tokio::time::sleep(Duration::from_secs(31)).await;
            assert_eq!(queue.get().await, Some("a"));
            queue.done(&"a");
        }
        assert!(!queue.retry("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_the_budget() {
        let queue = WorkQueue::<&str>::new();
        for _ in 0..MAX_RETRIES {
            assert!(queue.retry("a"));
            tokio::time::sleep(Duration::from_secs(31)).await;
            queue.get().await;
            queue.done(&"a");
        }
        queue.forget(&"a");
        assert!(queue.retry("a"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_parks() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.shut_down();
        queue.add("b");
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_per_attempt() {
        assert_eq!(WorkQueue::<&str>::backoff(1), Duration::from_millis(5));
        assert_eq!(WorkQueue::<&str>::backoff(2), Duration::from_millis(10));
        assert_eq!(WorkQueue::<&str>::backoff(20), Duration::from_secs(30));
    }
}
