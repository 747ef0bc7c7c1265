// src/reactor.rs
// Single-shot completion used to block the control loop until an MCU
// reports back, with an explicit upper bound on the wait.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One producer completes, one consumer waits. Later completions are ignored.
#[derive(Debug, Default)]
pub struct Completion<T> {
    result: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Returns false if the completion already held a result.
    pub fn complete(&self, value: T) -> bool {
        let mut result = self.result.lock();
        if result.is_some() {
            return false;
        }
        *result = Some(value);
        self.cond.notify_all();
        true
    }

    pub fn test(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Blocks until completed or `timeout` elapses; `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut result = self.result.lock();
        while result.is_none() {
            if self.cond.wait_until(&mut result, deadline).timed_out() {
                break;
            }
        }
        result.clone()
    }
}
