//! Deduplicating, rate-limited work queue
//!
//! Each key moves through `Idle -> Queued -> InFlight -> {Idle, Queued}`:
//!
//! - `dirty` holds keys that need processing and have not been handed out yet.
//! - `processing` holds keys a worker currently owns.
//! - A key added while in flight stays only in `dirty` and is re-queued by
//!   [`WorkQueue::done`], so it is delivered again exactly once and never to two
//!   workers at the same time.
//!
//! Delayed re-adds sit in a min-heap ordered by the instant they become
//! eligible. Waiting workers sleep until the earliest deadline or until new
//! work is signalled, and promote due entries themselves.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows `failures` earlier failures
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug)]
struct Delayed<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[derive(Debug)]
struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    waiting: BinaryHeap<Reverse<Delayed<K>>>,
    /// Earliest pending delayed add per key; heap entries that disagree are stale
    ready_at: HashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            waiting: BinaryHeap::new(),
            ready_at: HashMap::new(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the key became available to `get`
    fn add(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(next)) = self.waiting.peek() {
            if next.at > now {
                break;
            }
            let Some(Reverse(due)) = self.waiting.pop() else {
                break;
            };
            if self.ready_at.get(&due.key) == Some(&due.at) {
                self.ready_at.remove(&due.key);
                self.add(due.key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse(d)| d.at)
    }
}

/// Work queue shared by the event source and the workers
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a key; coalesces with an entry that has not been handed out yet
    pub fn add(&self, key: K) {
        let added = self.lock().add(key);
        if added {
            self.notify.notify_one();
        }
    }

    /// Wait for the oldest available key and mark it in flight.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                inner.promote_due(Instant::now());
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    if !inner.queue.is_empty() {
                        // Hand the remaining work to another waiting worker
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                inner.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key handed out by `get`. A key re-added meanwhile is queued again.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if !inner.shutting_down && inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key once `delay` has elapsed. An earlier pending delay for the same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }
        let at = Instant::now() + delay;
        if inner.ready_at.get(&key).is_some_and(|existing| *existing <= at) {
            return;
        }
        inner.ready_at.insert(key.clone(), at);
        inner.seq += 1;
        let seq = inner.seq;
        inner.waiting.push(Reverse(Delayed { at, seq, key }));
        drop(inner);

        // Let a sleeping worker pick up the new deadline
        self.notify.notify_one();
    }

    /// Re-add after a failure, backing off further with each consecutive failure
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut inner = self.lock();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures += 1;
            delay
        };
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for a key
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys scheduled for a delayed add
    pub fn delayed_len(&self) -> usize {
        self.lock().ready_at.len()
    }

    /// Stop handing out work and wake every waiting worker
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
