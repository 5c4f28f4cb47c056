use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::*;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl RateLimit {
    fn backoff(&self, failures: u32) -> Duration {
        // past 2^31 the cap has long been hit
        let exp = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(exp)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Default)]
struct QueueState {
    /// keys ready to be handed out, in order
    queue: VecDeque<String>,
    /// keys that need processing; a superset of `queue`
    dirty: HashSet<String>,
    /// keys currently handed out to a worker
    processing: HashSet<String>,
    /// consecutive failures per key since it was last forgotten
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limit: RateLimit,
}

/// A deduplicating, rate limited queue of resource keys.
///
/// A key is queued at most once no matter how often it is added, and is never handed to two
/// workers at the same time: adding a key while it is being processed marks it dirty, and it
/// becomes available again once the worker calls [`WorkQueue::done`].
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RateLimit::default())
    }
}

impl WorkQueue {
    pub fn new(rate_limit: RateLimit) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                rate_limit,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // the state is left consistent at every await-free step, so a poisoned lock is still usable
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a key as needing processing. Adding a key that is already pending is a no-op.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // picked up again by done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<String> {
        loop {
            // registered before checking the state so a concurrent add or shutdown can't be missed
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // pass the wakeup on to another idle worker
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by [`WorkQueue::get`]
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Add the key after `delay`
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            return self.add(key);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add the key once its backoff has elapsed, increasing the backoff for next time
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.rate_limit.backoff(*failures);
            *failures += 1;
            delay
        };
        trace!(%key, ?delay, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff for a key
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// How many times the key has been requeued with backoff since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every blocked [`WorkQueue::get`]
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
