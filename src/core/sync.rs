// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Outstanding-task accounting and the completion barrier.

use super::util::Status;
use crate::macros::log_debug;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts the tasks that were submitted to a thread pool but haven't finished
/// executing yet, and lets threads block until that count drops to zero.
///
/// A task is counted when it's pushed to the queue and uncounted once its own
/// execution has completed. Because a task submits its children while it's
/// still executing, the children are always counted before the parent is
/// uncounted: once the counter reaches zero, no work remains anywhere.
pub struct TaskCounter {
    /// Number of tasks submitted but not finished.
    num_active: CachePadded<AtomicUsize>,
    /// Number of tasks submitted since the pool was built.
    num_submitted: CachePadded<AtomicUsize>,
    /// Number of tasks that panicked since the last call to
    /// [`wait_idle()`](Self::wait_idle).
    num_panicked: AtomicUsize,
    /// Wakes up the threads waiting for the counter to reach zero.
    idle: Status<()>,
}

impl TaskCounter {
    /// Creates a counter with no outstanding task.
    pub fn new() -> Self {
        Self {
            num_active: CachePadded::new(AtomicUsize::new(0)),
            num_submitted: CachePadded::new(AtomicUsize::new(0)),
            num_panicked: AtomicUsize::new(0),
            idle: Status::new(()),
        }
    }

    /// Records the submission of a task.
    pub fn increment(&self) {
        self.num_active.fetch_add(1, Ordering::SeqCst);
        self.num_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the completion (or the discarding) of a task, waking up the
    /// waiters if it was the last one.
    pub fn decrement(&self) {
        let count = self.num_active.fetch_sub(1, Ordering::SeqCst);
        assert!(count > 0, "Decremented the task counter below zero");
        if count == 1 {
            log_debug!("No more outstanding tasks. Waking up the waiters.");
            // Notifying under the lock guarantees that a waiter either observes
            // the zero count or is already parked on the condition variable.
            self.idle.update_notify_all(|_| ());
        }
    }

    /// Records that a task panicked. The task must still be
    /// [`decrement()`](Self::decrement)ed.
    pub fn record_panic(&self) {
        self.num_panicked.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of outstanding tasks.
    pub fn active(&self) -> usize {
        self.num_active.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks submitted so far.
    pub fn submitted(&self) -> usize {
        self.num_submitted.load(Ordering::Relaxed)
    }

    /// Blocks until there is no outstanding task, then returns (and resets)
    /// the number of tasks that panicked in the meantime.
    pub fn wait_idle(&self) -> usize {
        let guard = self
            .idle
            .wait_while(|_| self.num_active.load(Ordering::SeqCst) != 0);
        drop(guard);
        self.num_panicked.swap(0, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_starts_idle() {
        let counter = TaskCounter::new();
        assert_eq!(counter.active(), 0);
        assert_eq!(counter.submitted(), 0);
        assert_eq!(counter.wait_idle(), 0);
    }

    #[test]
    fn counter_tracks_submissions() {
        let counter = TaskCounter::new();
        counter.increment();
        counter.increment();
        counter.decrement();
        assert_eq!(counter.active(), 1);
        assert_eq!(counter.submitted(), 2);
        counter.decrement();
        assert_eq!(counter.active(), 0);
        assert_eq!(counter.submitted(), 2);
    }

    #[test]
    #[should_panic(expected = "Decremented the task counter below zero")]
    fn counter_underflow() {
        TaskCounter::new().decrement();
    }

    #[test]
    fn counter_reports_panics_once() {
        let counter = TaskCounter::new();
        counter.increment();
        counter.record_panic();
        counter.decrement();
        assert_eq!(counter.wait_idle(), 1);
        assert_eq!(counter.wait_idle(), 0);
    }

    #[test]
    fn wait_idle_blocks_until_zero() {
        let counter = Arc::new(TaskCounter::new());
        for _ in 0..100 {
            counter.increment();
        }

        let workers = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        std::thread::yield_now();
                        counter.decrement();
                    }
                })
            })
            .collect::<Vec<_>>();

        assert_eq!(counter.wait_idle(), 0);
        assert_eq!(counter.active(), 0);

        for worker in workers {
            worker.join().unwrap();
        }
    }
}
