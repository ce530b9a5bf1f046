//! Timer substrate shared by the STUN, TURN and ICE layers.
//!
//! [`TimerQueue`] is a min-heap of scheduled payloads driven by one tokio
//! task per queue. Each session/agent owns its own queue instance and reads
//! expirations from the paired mpsc receiver, so all timer-driven mutation
//! for one object flows through that object's own event loop. Cancellation
//! is cheap: a [`TimerHandle`] marks the entry dead and the driver skips it
//! on pop, which means a cancelled timer is guaranteed never to be
//! delivered, even if it was already due.
//!
//! [`RetransmitProfile`] carries the RFC 8489 retransmission constants
//! (initial RTO, doubling cap, request count, final wait). Defaults follow
//! the RFC; tests and embedders shrink them.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::trace;

/// Retransmission timing profile for unreliable transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitProfile {
    /// Initial retransmission timeout.
    pub initial_rto: Duration,
    /// Cap applied to the doubled RTO.
    pub max_rto: Duration,
    /// Total number of transmissions (first send included).
    pub request_count: u32,
    /// Wait after the last transmission before declaring a timeout.
    pub final_wait: Duration,
}

impl Default for RetransmitProfile {
    fn default() -> Self {
        // RFC 8489 section 6.2.1: RTO = 500 ms, Rc = 7, Rm = 16.
        let initial_rto = Duration::from_millis(500);
        RetransmitProfile {
            initial_rto,
            max_rto: initial_rto * 8,
            request_count: 7,
            final_wait: initial_rto * 16,
        }
    }
}

impl RetransmitProfile {
    /// A short profile for tests and for gathering transactions that must
    /// resolve quickly.
    pub fn short() -> Self {
        let initial_rto = Duration::from_millis(100);
        RetransmitProfile {
            initial_rto,
            max_rto: initial_rto * 8,
            request_count: 3,
            final_wait: initial_rto * 4,
        }
    }

    /// Delay before transmission number `attempt + 1`, i.e. `delay(0)` is
    /// the wait after the first send. Doubles each time, capped at
    /// `max_rto`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_rto
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(self.max_rto);
        doubled.min(self.max_rto)
    }

    /// Upper bound on the whole transaction lifetime. Useful for callers
    /// that need a single deadline (gathering budget checks).
    pub fn total_budget(&self) -> Duration {
        let mut total = self.final_wait;
        for attempt in 0..self.request_count.saturating_sub(1) {
            total += self.delay(attempt);
        }
        total
    }
}

struct Entry<T> {
    deadline: Instant,
    id: u64,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap (a max-heap) surfaces the earliest
        // deadline first. Ties break by insertion order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    next_id: u64,
    closed: bool,
}

/// Handle to one scheduled timer. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Weak<Mutex<HashSet<u64>>>,
    notify: Weak<Notify>,
}

impl TimerHandle {
    /// Cancel the timer. Idempotent; cancelling an already-fired or
    /// already-cancelled timer is a no-op.
    pub fn cancel(&self) {
        if let Some(cancelled) = self.cancelled.upgrade() {
            cancelled.lock().insert(self.id);
        }
        if let Some(notify) = self.notify.upgrade() {
            notify.notify_one();
        }
    }
}

/// A timer queue delivering expired payloads on an mpsc channel, in
/// deadline order.
pub struct TimerQueue<T> {
    state: Arc<Mutex<State<T>>>,
    cancelled: Arc<Mutex<HashSet<u64>>>,
    notify: Arc<Notify>,
}

impl<T: Send + 'static> TimerQueue<T> {
    /// Create a queue and spawn its driver task. Must be called from within
    /// a tokio runtime. Expired payloads arrive on the returned receiver.
    pub fn new() -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(64);
        let queue = TimerQueue {
            state: Arc::new(Mutex::new(State {
                heap: BinaryHeap::new(),
                next_id: 0,
                closed: false,
            })),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            notify: Arc::new(Notify::new()),
        };

        let state = queue.state.clone();
        let cancelled = queue.cancelled.clone();
        let notify = queue.notify.clone();
        tokio::spawn(async move {
            Self::drive(state, cancelled, notify, tx).await;
        });

        (queue, rx)
    }

    /// Schedule `payload` to be delivered after `delay`.
    pub fn schedule(&self, delay: Duration, payload: T) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, payload)
    }

    /// Schedule `payload` to be delivered at `deadline`.
    pub fn schedule_at(&self, deadline: Instant, payload: T) -> TimerHandle {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.heap.push(Entry {
                deadline,
                id,
                payload,
            });
            id
        };
        self.notify.notify_one();
        TimerHandle {
            id,
            cancelled: Arc::downgrade(&self.cancelled),
            notify: Arc::downgrade(&self.notify),
        }
    }

    /// Stop the driver task. Pending timers are dropped without firing.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.heap.clear();
        }
        self.notify.notify_one();
    }

    async fn drive(
        state: Arc<Mutex<State<T>>>,
        cancelled: Arc<Mutex<HashSet<u64>>>,
        notify: Arc<Notify>,
        tx: mpsc::Sender<T>,
    ) {
        loop {
            let next_deadline = {
                let state = state.lock();
                if state.closed {
                    trace!("timer queue closed, driver exiting");
                    return;
                }
                state.heap.peek().map(|entry| entry.deadline)
            };

            match next_deadline {
                None => notify.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            let due = Self::pop_due(&state, &cancelled);
                            for payload in due {
                                if tx.send(payload).await.is_err() {
                                    // Receiver gone; nothing left to drive.
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn pop_due(state: &Mutex<State<T>>, cancelled: &Mutex<HashSet<u64>>) -> Vec<T> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut state = state.lock();
        let mut cancelled = cancelled.lock();
        while let Some(entry) = state.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = state.heap.pop().unwrap();
            if !cancelled.remove(&entry.id) {
                due.push(entry.payload);
            }
        }
        due
    }
}

impl<T> Drop for TimerQueue<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.heap.clear();
        drop(state);
        self.notify.notify_one();
    }
}
