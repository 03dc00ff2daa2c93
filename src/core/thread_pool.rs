// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size thread pool executing tasks from a shared FIFO queue.

use super::queue::{PoolState, Task, TaskQueue};
use super::shared::SharedSlice;
use super::sync::TaskCounter;
#[cfg(feature = "log_parallelism")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_warn};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::ops::RangeInclusive;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`], or a single thread if that
    /// number can't be determined.
    #[default]
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the actual number of threads to spawn.
    fn resolve(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or_else(|_e| {
                    log_warn!("Getting the available parallelism failed ({_e}), using 1 thread");
                    NonZeroUsize::MIN
                })
            }
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    #[default]
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), or if any worker fails to pin itself,
    /// starting a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Creates a thread pool. No thread is spawned until
    /// [`ThreadPool::start()`] is called.
    ///
    /// ```
    /// # use sortpool::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// let mut thread_pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    /// thread_pool.start();
    ///
    /// let (sender, receiver) = std::sync::mpsc::channel();
    /// thread_pool.submit(move || sender.send(6 * 7).unwrap());
    /// thread_pool.wait_idle();
    /// assert_eq!(receiver.recv().unwrap(), 42);
    /// ```
    pub fn build(&self) -> ThreadPool {
        ThreadPool::new(self)
    }
}

/// Context shared between the pool owner, the worker threads and the
/// [`PoolHandle`]s.
struct PoolShared {
    queue: TaskQueue,
    counter: TaskCounter,
}

/// A thread pool that executes tasks pulled from a shared FIFO queue.
///
/// Tasks are dequeued in submission order by whichever worker is free, and may
/// themselves submit more tasks via a [`PoolHandle`]. Dropping the pool stops
/// it.
pub struct ThreadPool {
    /// Number of worker threads to spawn.
    num_threads: NonZeroUsize,
    /// Policy to pin worker threads to CPUs.
    cpu_pinning: CpuPinningPolicy,
    /// Context shared with the worker threads.
    shared: Arc<PoolShared>,
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Self {
        Self {
            num_threads: builder.num_threads.resolve(),
            cpu_pinning: builder.cpu_pinning,
            shared: Arc::new(PoolShared {
                queue: TaskQueue::new(),
                counter: TaskCounter::new(),
            }),
            threads: Vec::new(),
        }
    }

    /// Returns the number of worker threads of this thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }

    /// Returns the lifecycle state of this thread pool.
    pub fn state(&self) -> PoolState {
        self.shared.queue.phase()
    }

    /// Returns a handle to submit tasks to this pool, including from within
    /// tasks.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: self.shared.clone(),
        }
    }

    /// Spawns the worker threads, and waits until each of them has applied the
    /// CPU pinning policy.
    ///
    /// # Panics
    ///
    /// Panics if the pool was already started, or if a worker thread couldn't
    /// be pinned under [`CpuPinningPolicy::Always`]. In the latter case, the
    /// pool is stopped before panicking.
    pub fn start(&mut self) {
        if let Err(state) = self.shared.queue.start() {
            panic!("Cannot start a thread pool in the {state:?} state");
        }

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match self.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let cpu_pinning = self.cpu_pinning;
        let (pinned_sender, pinned_receiver) = mpsc::channel();
        self.threads = (0..self.num_threads.get())
            .map(|id| {
                let context = WorkerContext {
                    #[cfg(feature = "log")]
                    id,
                    shared: self.shared.clone(),
                };
                let pinned_sender = pinned_sender.clone();
                WorkerThreadHandle {
                    handle: std::thread::spawn(move || {
                        let pinned = pin_current_thread(id, cpu_pinning);
                        let pinned_ok = pinned.is_ok();
                        // The pool owner waits for this report in `start()`.
                        let _ = pinned_sender.send(pinned);
                        drop(pinned_sender);
                        if pinned_ok {
                            context.run()
                        }
                    }),
                }
            })
            .collect();
        drop(pinned_sender);
        log_debug!("[main thread] Spawned {} threads", self.threads.len());

        let failures = pinned_receiver
            .iter()
            .take(self.threads.len())
            .filter_map(Result::err)
            .collect::<Vec<_>>();
        if let Some(first) = failures.first() {
            for _failure in &failures {
                log_error!("[main thread] {_failure}");
            }
            self.stop();
            panic!(
                "Failed to pin {} worker thread(s) to CPUs: {first}",
                failures.len()
            );
        }
    }

    /// Notifies the worker threads to exit and joins them.
    ///
    /// A worker finishes the task it's currently running but doesn't dequeue
    /// new ones, so this should only be called once the pool is idle. Tasks
    /// that remain in the queue are dropped without running. Calling this
    /// more than once is a no-op.
    #[allow(clippy::unused_enumerate_index)]
    pub fn stop(&mut self) {
        if !self.shared.queue.request_stop() {
            return;
        }

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");

        let stranded = self.shared.queue.finish();
        if !stranded.is_empty() {
            log_warn!(
                "[main thread] Dropping {} task(s) that were never dequeued",
                stranded.len()
            );
        }
        for task in stranded {
            drop(task);
            self.shared.counter.decrement();
        }
    }

    /// Submits a task to the pool. See [`PoolHandle::submit()`].
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.submit(Task::new(f));
    }

    /// Submits a task operating on a range of a shared buffer. See
    /// [`PoolHandle::submit_range()`].
    pub fn submit_range<T, F>(&self, sequence: SharedSlice<T>, range: RangeInclusive<usize>, f: F)
    where
        T: Send + 'static,
        F: FnOnce(&SharedSlice<T>, usize, usize) + Send + 'static,
    {
        self.shared.submit(Task::bind(f, sequence, range));
    }

    /// Returns the number of tasks that were submitted but haven't finished
    /// executing.
    pub fn active_task_count(&self) -> usize {
        self.shared.counter.active()
    }

    /// Returns the number of tasks waiting in the queue to be dequeued by a
    /// worker.
    pub fn queued_task_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns the total number of tasks submitted to this pool.
    pub fn submitted_task_count(&self) -> usize {
        self.shared.counter.submitted()
    }

    /// Blocks until no task is queued or executing.
    ///
    /// A task submitted by another task is counted before its parent
    /// finishes, so returning from this function means that the whole tree of
    /// tasks has completed.
    ///
    /// # Panics
    ///
    /// Panics if any task panicked since the last call, or if tasks are
    /// pending on a pool that isn't running (which would never complete).
    pub fn wait_idle(&self) {
        let state = self.state();
        let active = self.active_task_count();
        if state != PoolState::Running && active != 0 {
            panic!("Waiting for {active} task(s) on a thread pool in the {state:?} state");
        }

        let num_panicked = self.shared.counter.wait_idle();
        if num_panicked != 0 {
            log_error!("[main thread] {num_panicked} task(s) panicked!");
            panic!("{num_panicked} task(s) panicked!");
        }
    }
}

impl Drop for ThreadPool {
    /// Stops the pool and joins all the threads.
    fn drop(&mut self) {
        self.stop();
    }
}

/// A cloneable handle to submit tasks to a [`ThreadPool`].
///
/// Handles remain valid after the pool is stopped, but tasks submitted at that
/// point are dropped without running.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    /// Submits a task to the pool.
    ///
    /// The task is appended to the queue and counted as active until it
    /// finishes executing. This never blocks beyond a short lock and never
    /// rejects a task while the pool is running: the queue is unbounded.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.submit(Task::new(f));
    }

    /// Submits a task that receives the given shared buffer and the bounds of
    /// the given inclusive range.
    pub fn submit_range<T, F>(&self, sequence: SharedSlice<T>, range: RangeInclusive<usize>, f: F)
    where
        T: Send + 'static,
        F: FnOnce(&SharedSlice<T>, usize, usize) + Send + 'static,
    {
        self.shared.submit(Task::bind(f, sequence, range));
    }

    /// Returns the number of tasks that were submitted but haven't finished
    /// executing.
    pub fn active_task_count(&self) -> usize {
        self.shared.counter.active()
    }
}

impl PoolShared {
    fn submit(&self, task: Task) {
        self.queue.push(task, &self.counter);
    }
}

/// Pins the current thread to the CPU matching its worker index.
///
/// Returns an error only if pinning failed under [`CpuPinningPolicy::Always`].
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    if cpu_pinning == CpuPinningPolicy::No {
        return Ok(());
    }

    let mut cpu_set = CpuSet::new();
    let pinned = cpu_set
        .set(id)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set));
    match (pinned, cpu_pinning) {
        (Ok(()), _) => {
            log_debug!("Pinned thread #{id} to CPU #{id}");
            Ok(())
        }
        (Err(_e), CpuPinningPolicy::IfSupported) => {
            log_warn!("Failed to set CPU affinity for thread #{id}: {_e}");
            Ok(())
        }
        (Err(e), _) => Err(format!("Failed to set CPU affinity for thread #{id}: {e}")),
    }
}

/// Pinning is unsupported here: the policy was already checked by
/// [`ThreadPool::start()`].
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    Ok(())
}

/// Context object owned by a worker thread.
struct WorkerContext {
    /// Thread index.
    #[cfg(feature = "log")]
    id: usize,
    /// Context shared with the pool.
    shared: Arc<PoolShared>,
}

impl WorkerContext {
    /// Main function run by this thread.
    fn run(&self) {
        log_debug!("[thread {}] Waiting for tasks", self.id);
        #[cfg(feature = "log_parallelism")]
        let mut num_executed = 0usize;

        while let Some(task) = self.shared.queue.next_task() {
            self.execute(task);
            #[cfg(feature = "log_parallelism")]
            {
                num_executed += 1;
            }
        }

        #[cfg(feature = "log_parallelism")]
        log_info!("[thread {}] Executed {num_executed} task(s)", self.id);
        log_debug!("[thread {}] Received finish signal", self.id);
    }

    /// Runs a task to completion and uncounts it. A panicking task doesn't
    /// bring the worker down: it is recorded and reported by
    /// [`ThreadPool::wait_idle()`].
    fn execute(&self, task: Task) {
        // The task and everything it captured are dropped before the counter is
        // decremented, including on panic.
        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            log_error!("[thread {}] Detected panic in a task", self.id);
            self.shared.counter.record_panic();
        }
        self.shared.counter.decrement();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn build_started(num_threads: usize) -> ThreadPool {
        let mut thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();
        thread_pool.start();
        thread_pool
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_num_threads() {
        let thread_pool = ThreadPoolBuilder::default().build();
        assert_eq!(
            thread_pool.num_threads(),
            std::thread::available_parallelism().unwrap()
        );

        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(4).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();
        assert_eq!(
            thread_pool.num_threads(),
            NonZeroUsize::try_from(4).unwrap()
        );
    }

    #[test]
    fn test_lifecycle() {
        let mut thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();
        assert_eq!(thread_pool.state(), PoolState::NotStarted);

        thread_pool.start();
        assert_eq!(thread_pool.state(), PoolState::Running);
        assert_eq!(thread_pool.threads.len(), 2);

        thread_pool.stop();
        assert_eq!(thread_pool.state(), PoolState::Stopped);
        assert!(thread_pool.threads.is_empty());

        // Stopping twice is a no-op.
        thread_pool.stop();
        assert_eq!(thread_pool.state(), PoolState::Stopped);
    }

    #[test]
    #[should_panic = "Cannot start a thread pool in the Running state"]
    fn test_start_twice() {
        let mut thread_pool = build_started(1);
        thread_pool.start();
    }

    #[test]
    fn test_submit_and_wait() {
        let thread_pool = build_started(4);
        let sum = Arc::new(AtomicUsize::new(0));
        for i in 1..=100 {
            let sum = sum.clone();
            thread_pool.submit(move || {
                sum.fetch_add(i, Ordering::Relaxed);
            });
        }
        thread_pool.wait_idle();
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
        assert_eq!(thread_pool.active_task_count(), 0);
        assert_eq!(thread_pool.submitted_task_count(), 100);
    }

    #[test]
    fn test_single_worker_runs_in_fifo_order() {
        let thread_pool = build_started(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            thread_pool.submit(move || order.lock().unwrap().push(i));
        }
        thread_pool.wait_idle();
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_nested_submissions_are_awaited() {
        let thread_pool = build_started(3);
        let count = Arc::new(AtomicUsize::new(0));

        fn spawn_tree(pool: PoolHandle, count: Arc<AtomicUsize>, depth: usize) {
            count.fetch_add(1, Ordering::Relaxed);
            if depth > 0 {
                for _ in 0..2 {
                    let (child_pool, count) = (pool.clone(), count.clone());
                    pool.submit(move || spawn_tree(child_pool, count, depth - 1));
                }
            }
        }

        let (pool, tree_count) = (thread_pool.handle(), count.clone());
        thread_pool.submit(move || spawn_tree(pool, tree_count, 10));
        thread_pool.wait_idle();

        // A full binary tree of depth 10 has 2^11 - 1 nodes.
        assert_eq!(count.load(Ordering::Relaxed), 2047);
        assert_eq!(thread_pool.submitted_task_count(), 2047);
    }

    #[test]
    fn test_submit_before_start() {
        let mut thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();
        let (sender, receiver) = std::sync::mpsc::channel();
        thread_pool.submit(move || sender.send(()).unwrap());
        assert_eq!(thread_pool.active_task_count(), 1);

        thread_pool.start();
        thread_pool.wait_idle();
        receiver.recv().unwrap();
    }

    #[test]
    #[should_panic = "Waiting for 1 task(s) on a thread pool in the NotStarted state"]
    fn test_wait_before_start() {
        let thread_pool = ThreadPoolBuilder::default().build();
        thread_pool.submit(|| ());
        thread_pool.wait_idle();
    }

    #[test]
    fn test_stop_drops_stranded_tasks() {
        let mut thread_pool = ThreadPoolBuilder::default().build();
        let shared = SharedSlice::from(vec![1, 2, 3]);
        thread_pool.submit_range(shared.clone(), 0..=2, |_, _, _| unreachable!());
        assert_eq!(shared.handle_count(), 2);
        assert_eq!(thread_pool.queued_task_count(), 1);

        thread_pool.stop();
        assert_eq!(thread_pool.state(), PoolState::Stopped);
        assert_eq!(thread_pool.active_task_count(), 0);
        assert_eq!(thread_pool.queued_task_count(), 0);
        assert_eq!(shared.handle_count(), 1);
    }

    #[test]
    fn test_submit_after_stop_is_dropped() {
        let mut thread_pool = build_started(2);
        let handle = thread_pool.handle();
        thread_pool.stop();

        handle.submit(|| unreachable!());
        assert_eq!(handle.active_task_count(), 0);
        assert_eq!(thread_pool.submitted_task_count(), 0);
    }

    #[test]
    #[should_panic = "2 task(s) panicked!"]
    fn test_panics_are_reported() {
        let thread_pool = build_started(2);
        for i in 0..10 {
            thread_pool.submit(move || {
                if i % 5 == 0 {
                    panic!("task panic");
                }
            });
        }
        thread_pool.wait_idle();
    }

    #[test]
    fn test_workers_survive_panics() {
        let thread_pool = build_started(1);
        thread_pool.submit(|| panic!("task panic"));
        let result = catch_unwind(AssertUnwindSafe(|| thread_pool.wait_idle()));
        assert!(result.is_err());

        let (sender, receiver) = std::sync::mpsc::channel();
        thread_pool.submit(move || sender.send(42).unwrap());
        thread_pool.wait_idle();
        assert_eq!(receiver.recv().unwrap(), 42);
    }

    #[test]
    fn test_cpu_pinning_if_supported() {
        let mut thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(1).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();
        thread_pool.start();

        let (sender, receiver) = std::sync::mpsc::channel();
        thread_pool.submit(move || sender.send(()).unwrap());
        thread_pool.wait_idle();
        receiver.recv().unwrap();
    }

    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    #[test]
    fn test_pin_out_of_range_cpu() {
        // No CPU set can hold this index, so nothing gets pinned.
        let id = CpuSet::count();
        assert!(pin_current_thread(id, CpuPinningPolicy::Always).is_err());
        assert!(pin_current_thread(id, CpuPinningPolicy::IfSupported).is_ok());
        assert!(pin_current_thread(id, CpuPinningPolicy::No).is_ok());
    }

    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    #[test]
    fn test_cpu_pinning_always_failure_panics_in_start() {
        // The last worker can't be pinned whatever the machine.
        let mut thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(CpuSet::count() + 1).unwrap(),
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build();

        let result = catch_unwind(AssertUnwindSafe(|| thread_pool.start()));
        let message = result.unwrap_err();
        let message = message
            .downcast_ref::<String>()
            .map(String::as_str)
            .unwrap_or_default();
        assert!(
            message.starts_with("Failed to pin "),
            "unexpected panic message: {message}"
        );
        assert!(message.contains("worker thread(s) to CPUs"));

        // No worker is left behind to silently hold queued tasks.
        assert_eq!(thread_pool.state(), PoolState::Stopped);
        assert!(thread_pool.threads.is_empty());
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_cpu_pinning_always_not_supported() {
        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build()
        .start();
    }
}
