//! Rate-limited work queue.
//!
//! Follows the classic controller work-queue discipline: adds are
//! deduplicated, a key being processed is never handed to a second worker,
//! and re-adds during processing are parked and re-queued when the worker
//! calls [`WorkQueue::done`]. Delayed adds share the same queue so per-key
//! serialisation also covers requeues.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::Notify;

/// First retry delay.
const BASE_DELAY: Duration = Duration::from_millis(5);
/// Retry delay ceiling.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key failure count to backoff delay: exponential, capped.
pub(crate) fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(28);
    BASE_DELAY
        .checked_mul(1u32 << exp)
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY)
}

struct DelayedEntry<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for DelayedEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for DelayedEntry<K> {}

impl<K> PartialOrd for DelayedEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for DelayedEntry<K> {
    // Reversed so the earliest deadline sits on top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    delayed: BinaryHeap<DelayedEntry<K>>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
    seq: u64,
}

/// Deduplicating, per-key-serialising, rate-limited work queue.
pub struct WorkQueue<K> {
    name: String,
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send,
{
    /// Create a named queue; the name labels its metrics.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: BinaryHeap::new(),
                failures: HashMap::new(),
                shutting_down: false,
                seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key. Duplicate adds coalesce; keys currently being
    /// processed are parked and re-queued at [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        if inner.shutting_down {
            return;
        }
        Self::enqueue_locked(&mut inner, key);
        counter!("workqueue_adds_total", "name" => self.name.clone()).increment(1);
        drop(inner);
        self.notify.notify_one();
    }

    fn enqueue_locked(inner: &mut Inner<K>, key: K) {
        if inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
    }

    /// Enqueue a key after a delay, through the same queue.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        if inner.shutting_down {
            return;
        }
        inner.seq += 1;
        let entry = DelayedEntry {
            at: Instant::now() + delay,
            seq: inner.seq,
            key,
        };
        inner.delayed.push(entry);
        drop(inner);
        // Wake a waiter so it can re-arm its timer to the new deadline.
        self.notify.notify_one();
    }

    /// Enqueue a key after its per-key exponential backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let failures = {
            let mut inner = self.inner.lock().expect("work queue mutex poisoned");
            let count = inner.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        counter!("workqueue_retries_total", "name" => self.name.clone()).increment(1);
        self.add_after(key, backoff_delay(failures));
    }

    /// Reset the backoff counter for a key.
    pub fn forget(&self, key: &K) {
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.failures.remove(key);
    }

    /// Current backoff counter for a key.
    pub fn retries(&self, key: &K) -> u32 {
        let inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.queue.len()
    }

    /// Whether no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next key. Returns `None` once the queue shuts down.
    ///
    /// The returned key is marked processing; the caller must call
    /// [`WorkQueue::done`] when finished with it.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            let wait_until = {
                let mut inner = self.inner.lock().expect("work queue mutex poisoned");
                let now = Instant::now();
                while let Some(entry) = inner.delayed.peek() {
                    if entry.at > now {
                        break;
                    }
                    let entry = inner.delayed.pop().expect("peeked entry");
                    Self::enqueue_locked(&mut inner, entry.key);
                }

                if inner.shutting_down {
                    return None;
                }

                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }

                inner.delayed.peek().map(|e| e.at)
            };

            match wait_until {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at.into()) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key finished. If it was re-added while processing, it goes
    /// back on the queue.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys; wakes every waiting worker.
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock().expect("work queue mutex poisoned");
        inner.shutting_down = true;
        drop(inner);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(3), Duration::from_millis(20));
        assert_eq!(backoff_delay(40), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn adds_deduplicate() {
        let q: WorkQueue<String> = WorkQueue::new("test");
        q.add("a".into());
        q.add("a".into());
        q.add("b".into());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.unwrap(), "a");
        assert_eq!(q.get().await.unwrap(), "b");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_never_handed_out_twice() {
        let q: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new("test"));
        q.add("a".into());

        let key = q.get().await.unwrap();
        assert_eq!(key, "a");

        // Re-added while processing: parked, not handed out.
        q.add("a".into());
        let second = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
        assert!(second.is_err(), "key handed out while still processing");

        // done() releases the parked re-add.
        q.done(&key);
        let key = tokio::time::timeout(Duration::from_millis(200), q.get())
            .await
            .expect("parked key re-queued")
            .unwrap();
        assert_eq!(key, "a");
        q.done(&key);
    }

    #[tokio::test]
    async fn delayed_add_waits_for_its_deadline() {
        let q: WorkQueue<String> = WorkQueue::new("test");
        q.add_after("a".into(), Duration::from_millis(80));

        let early = tokio::time::timeout(Duration::from_millis(20), q.get()).await;
        assert!(early.is_err());

        let key = tokio::time::timeout(Duration::from_millis(500), q.get())
            .await
            .expect("delayed key delivered")
            .unwrap();
        assert_eq!(key, "a");
    }

    #[tokio::test]
    async fn rate_limited_adds_count_failures_and_forget_resets() {
        let q: WorkQueue<String> = WorkQueue::new("test");
        q.add_rate_limited("a".into());
        q.add_rate_limited("a".into());
        assert_eq!(q.retries(&"a".to_string()), 2);

        q.forget(&"a".to_string());
        assert_eq!(q.retries(&"a".to_string()), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let q: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new("test"));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("worker woke up")
            .unwrap();
        assert!(got.is_none());

        // Adds after shutdown are ignored.
        q.add("late".into());
        assert!(q.is_empty());
    }
}
