// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rate-limited, delaying, de-duplicating work queue.
//!
//! The queue keeps three pieces of bookkeeping behind one mutex:
//!
//! - a *dirty* set of items that need processing,
//! - a *processing* set of items currently handed out to a worker,
//! - a min-heap of items waiting for their ready time.
//!
//! An item is never handed out to two workers at once. Adding an item that is
//! being processed marks it dirty, and it is queued again once the worker
//! calls [`WorkQueue::done`]. Delayed items are promoted by the consumers
//! blocked in [`WorkQueue::get`], so the queue owns no background task.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

/// Ready time used for delays too long to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An item waiting in the delay heap.
struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Waiting<T> {
    // Reversed so that `BinaryHeap` pops the earliest ready time first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: BinaryHeap<Waiting<T>>,
    // Current (ready_at, seq) of every delayed item; heap entries not matching are stale.
    waiting_for: HashMap<T, (Instant, u64)>,
    next_seq: u64,
    shutting_down: bool,
}

impl<T> State<T>
where
    T: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            waiting_for: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
        }
    }

    /// Marks `item` dirty. Returns true when it was appended to the ready queue.
    fn insert(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn schedule(&mut self, item: T, ready_at: Instant) {
        if let Some((existing, _)) = self.waiting_for.get(&item) {
            if *existing <= ready_at {
                return;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.waiting_for.insert(item.clone(), (ready_at, seq));
        self.waiting.push(Waiting {
            ready_at,
            seq,
            item,
        });
    }

    fn promote_ready(&mut self, now: Instant) {
        while let Some(next) = self.waiting.peek() {
            if next.ready_at > now {
                break;
            }
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            let current = self.waiting_for.get(&entry.item).copied();
            if current != Some((entry.ready_at, entry.seq)) {
                continue;
            }
            self.waiting_for.remove(&entry.item);
            self.insert(entry.item);
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|w| w.ready_at)
    }
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

/// A cheaply cloneable handle to a shared work queue.
///
/// All clones refer to the same queue; the queue is safe for any number of
/// concurrent producers and consumers.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates a queue using [`default_controller_rate_limiter`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, default_controller_rate_limiter())
    }

    /// Creates a queue backed by the given rate limiter.
    pub fn with_rate_limiter(
        name: impl Into<String>,
        rate_limiter: impl RateLimiter<T> + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::new()),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Returns the name the queue was created with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `item` as needing processing.
    ///
    /// Items already pending collapse into one entry. Items currently being
    /// processed are delivered again after [`WorkQueue::done`].
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if state.insert(item) {
            self.inner.notify.notify_one();
        }
    }

    /// Adds `item` once `delay` has elapsed. When the item is already
    /// waiting, the earlier of the two ready times wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        state.schedule(item, ready_at);
        drop(state);

        // Wake a consumer so it re-arms its timer for the new deadline.
        self.inner.notify.notify_one();
    }

    /// Adds `item` after the delay its rate limiter allows.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Adds `item` no sooner than `delay` from now and no sooner than its rate
    /// limiter allows, whichever is later.
    pub fn add_rate_limited_after(&self, item: T, delay: Duration) {
        let limited = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay.max(limited));
    }

    /// Resets the rate limiter's backoff for `item`.
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    /// Returns how many times `item` was rate-limited since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> usize {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Blocks until an item is ready and hands it out, marking it as being
    /// processed. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state();
                state.promote_ready(Instant::now());

                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_ready_at()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks `item` as done processing. If it was added again meanwhile it is
    /// put back on the ready queue.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.inner.notify.notify_one();
        }
    }

    /// Returns the number of items ready for processing.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Returns true if no item is ready for processing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new items and wakes every blocked consumer.
    ///
    /// Items already on the ready queue are still handed out; delayed items
    /// are discarded.
    pub fn shut_down(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        state.waiting.clear();
        state.waiting_for.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Returns true once [`WorkQueue::shut_down`] was called.
    pub fn shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
