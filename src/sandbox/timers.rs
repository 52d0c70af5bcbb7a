//! Virtual-clock timer queue.
//!
//! `setTimeout` never sleeps: callbacks are ordered by (due time, registration order) and drained after every
//! execution segment, advancing the clock to each callback's due time.

use std::collections::BTreeMap;

use super::interp::{Abort, Interrupt, Runtime};
use super::value::Value;
use super::Uncaught;

pub struct Timer {
    pub id: u64,
    pub callback: Value,
    pub args: Vec<Value>,
}

pub struct TimerQueue {
    now: u64,
    seq: u64,
    next_id: u64,
    max_runs: usize,
    pending: BTreeMap<(u64, u64), Timer>,
}

impl TimerQueue {
    pub fn new(max_runs: usize) -> Self {
        Self {
            now: 0,
            seq: 0,
            next_id: 1,
            max_runs,
            pending: BTreeMap::new(),
        }
    }

    /// Schedule `callback` after `delay` virtual milliseconds and return its handle.
    pub fn schedule(&mut self, callback: Value, delay: f64, args: Vec<Value>) -> u64 {
        let delay = if delay.is_finite() && delay > 0.0 { delay as u64 } else { 0 };
        let id = self.next_id;
        self.next_id += 1;
        self.seq += 1;
        self.pending
            .insert((self.now.saturating_add(delay), self.seq), Timer { id, callback, args });
        id
    }

    pub fn cancel(&mut self, id: u64) {
        self.pending.retain(|_, timer| timer.id != id);
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    fn pop_due(&mut self) -> Option<Timer> {
        let ((due, _), timer) = self.pending.pop_first()?;
        self.now = self.now.max(due);
        Some(timer)
    }
}

impl Runtime {
    /// Run every pending timer, including ones scheduled by callbacks, within the run budget.
    ///
    /// Exceptions escaping a callback are collected as asynchronous uncaught errors; aborts stop the drain.
    pub(super) fn drain_timers(&mut self, uncaught: &mut Vec<Uncaught>) -> Result<usize, Interrupt> {
        let mut runs = 0;
        while let Some(timer) = self.timers.pop_due() {
            runs += 1;
            if runs > self.timers.max_runs {
                return Err(Interrupt::Abort(Abort::TimerBudget(self.timers.max_runs)));
            }
            tracing::trace!(timer = timer.id, now = self.timers.now(), "running timer");
            match self.call_function(&timer.callback, timer.args) {
                Ok(_) => {}
                Err(Interrupt::Throw(thrown)) => uncaught.push(Uncaught {
                    message: thrown.describe_thrown(),
                    asynchronous: true,
                }),
                Err(abort) => return Err(abort),
            }
        }
        Ok(runs)
    }
}
