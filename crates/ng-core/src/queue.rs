//! Bounded ingestion queue in front of the router.
//!
//! A full queue never loses a signal silently: `Reject` returns it to the
//! producer as an error, `DropOldest` hands the displaced signal back in the
//! outcome, and `Block` waits for space.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signal::Signal;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Fail the push with `QueueFull`.
    #[default]
    Reject,
    /// Evict the oldest queued signal to make room.
    DropOldest,
    /// Wait until a consumer makes room or the queue closes.
    Block,
}

#[derive(Debug, PartialEq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting this signal.
    Displaced(Signal),
}

struct State {
    items: VecDeque<Signal>,
    closed: bool,
}

pub struct IngestQueue {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: BackpressurePolicy,
}

impl IngestQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    pub fn push(&self, signal: Signal) -> Result<PushOutcome> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::QueueClosed);
        }

        let mut outcome = PushOutcome::Queued;
        if state.items.len() >= self.capacity {
            match self.policy {
                BackpressurePolicy::Reject => return Err(Error::QueueFull(self.capacity)),
                BackpressurePolicy::DropOldest => {
                    if let Some(old) = state.items.pop_front() {
                        outcome = PushOutcome::Displaced(old);
                    }
                }
                BackpressurePolicy::Block => {
                    while state.items.len() >= self.capacity && !state.closed {
                        self.not_full.wait(&mut state);
                    }
                    if state.closed {
                        return Err(Error::QueueClosed);
                    }
                }
            }
        }

        state.items.push_back(signal);
        drop(state);
        self.not_empty.notify_one();
        Ok(outcome)
    }

    /// Wait for the next signal. `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<Signal> {
        let mut state = self.state.lock();
        loop {
            if let Some(signal) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(signal);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn try_pop(&self) -> Option<Signal> {
        let signal = self.state.lock().items.pop_front();
        if signal.is_some() {
            self.not_full.notify_one();
        }
        signal
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Signal> {
        let mut state = self.state.lock();
        if state.items.is_empty() && !state.closed {
            self.not_empty.wait_for(&mut state, timeout);
        }
        let signal = state.items.pop_front();
        drop(state);
        if signal.is_some() {
            self.not_full.notify_one();
        }
        signal
    }

    /// Refuse further pushes and wake every waiter. Queued signals can still
    /// be drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }
}
