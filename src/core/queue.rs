// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tasks and the FIFO queue that the worker threads pull them from.

use super::shared::SharedSlice;
use super::sync::TaskCounter;
use super::util::Status;
#[cfg(feature = "log_parallelism")]
use crate::macros::log_trace;
use crate::macros::log_warn;
use std::collections::VecDeque;
use std::ops::RangeInclusive;

/// Lifecycle state of a [`ThreadPool`](crate::ThreadPool).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// The pool was built but no worker thread was spawned yet.
    NotStarted,
    /// The worker threads are running tasks.
    Running,
    /// The worker threads were notified to exit, but some of them haven't
    /// exited yet.
    Stopping,
    /// All the worker threads have exited.
    Stopped,
}

/// A deferred unit of work.
pub struct Task {
    f: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Wraps a callable that takes no argument.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Binds a callable to a range of a shared buffer.
    ///
    /// The buffer handle is released as soon as the callable returns.
    pub fn bind<T, F>(f: F, sequence: SharedSlice<T>, range: RangeInclusive<usize>) -> Self
    where
        T: Send + 'static,
        F: FnOnce(&SharedSlice<T>, usize, usize) + Send + 'static,
    {
        let (low, high) = range.into_inner();
        Self::new(move || f(&sequence, low, high))
    }

    /// Runs the task, consuming it along with everything it captured.
    pub fn run(self) {
        (self.f)()
    }
}

/// State protected by the queue's mutex.
struct QueueState {
    phase: PoolState,
    tasks: VecDeque<Task>,
}

/// An unbounded FIFO queue of tasks, paired with the run flag of the pool.
///
/// Pushing never blocks beyond the time the lock is held and never rejects a
/// task while the pool can still run it. The queue can therefore grow without
/// bound if tasks are submitted faster than they're executed.
pub struct TaskQueue {
    status: Status<QueueState>,
}

impl TaskQueue {
    /// Creates an empty queue for a pool that isn't started yet.
    pub fn new() -> Self {
        Self {
            status: Status::new(QueueState {
                phase: PoolState::NotStarted,
                tasks: VecDeque::new(),
            }),
        }
    }

    /// Returns the lifecycle state of the pool.
    pub fn phase(&self) -> PoolState {
        self.status.lock().phase
    }

    /// Returns the number of tasks waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.status.lock().tasks.len()
    }

    /// Appends a task to the back of the queue, counting it in `counter`, and
    /// wakes up one worker.
    ///
    /// Once the pool is stopped, the task is dropped without being counted.
    pub fn push(&self, task: Task, counter: &TaskCounter) {
        let rejected = self.status.update_notify_one(|state| {
            if state.phase == PoolState::Stopped {
                return Some(task);
            }
            counter.increment();
            state.tasks.push_back(task);
            #[cfg(feature = "log_parallelism")]
            log_trace!("Queued a task, {} task(s) waiting", state.tasks.len());
            None
        });
        if let Some(task) = rejected {
            log_warn!("Dropping a task submitted to a stopped thread pool");
            // Dropped outside of the lock.
            drop(task);
        }
    }

    /// Blocks until a task is available and dequeues it, or returns [`None`]
    /// once the pool isn't running anymore.
    pub fn next_task(&self) -> Option<Task> {
        let mut state = self
            .status
            .wait_while(|state| state.phase == PoolState::Running && state.tasks.is_empty());
        if state.phase != PoolState::Running {
            return None;
        }
        state.tasks.pop_front()
    }

    /// Transitions from [`PoolState::NotStarted`] to [`PoolState::Running`].
    ///
    /// Returns the previous state if the transition isn't possible.
    pub fn start(&self) -> Result<(), PoolState> {
        let mut state = self.status.lock();
        match state.phase {
            PoolState::NotStarted => {
                state.phase = PoolState::Running;
                Ok(())
            }
            phase => Err(phase),
        }
    }

    /// Clears the run flag and wakes up all the workers.
    ///
    /// Returns false if the pool was already stopping or stopped.
    pub fn request_stop(&self) -> bool {
        self.status.update_notify_all(|state| match state.phase {
            PoolState::NotStarted | PoolState::Running => {
                state.phase = PoolState::Stopping;
                true
            }
            PoolState::Stopping | PoolState::Stopped => false,
        })
    }

    /// Marks the pool as stopped and returns the tasks that were never
    /// dequeued.
    pub fn finish(&self) -> Vec<Task> {
        let mut state = self.status.lock();
        state.phase = PoolState::Stopped;
        state.tasks.drain(..).collect()
    }
}
