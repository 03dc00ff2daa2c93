// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Quicksort that hands large sub-ranges to a thread pool.

use super::partition::{partition, quick_sort};
use crate::core::{PoolHandle, SharedSlice, ThreadPool};
#[cfg(feature = "log_parallelism")]
use crate::macros::log_trace;

/// Default value of [`SortOptions::threshold`].
pub const DEFAULT_THRESHOLD: usize = 1000;

/// Parameters of the parallel sort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortOptions {
    /// Sub-ranges longer than this are submitted to the pool as new tasks,
    /// shorter ones are sorted inline by the task that produced them.
    ///
    /// A threshold of zero submits every non-empty sub-range.
    pub threshold: usize,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Sorts `sequence[low..=high]`: partitions it, then for each side either
/// submits a new task to the pool or sorts it inline, depending on its length
/// compared to the threshold.
///
/// The submitted tasks are counted by the pool before this function returns,
/// so [`ThreadPool::wait_idle()`] only returns once the whole range is sorted.
///
/// # Safety
///
/// No other thread may access `sequence[low..=high]` until all the tasks
/// submitted by this call (and transitively by them) have completed.
pub unsafe fn parallel_sort<T: Ord + Send + 'static>(
    pool: &PoolHandle,
    sequence: &SharedSlice<T>,
    low: usize,
    high: usize,
    options: SortOptions,
) {
    if low >= high {
        return;
    }

    let p = {
        // SAFETY: This call has exclusive access to the range, as ensured by the
        // caller. The view is dropped before any sub-range is handed out.
        let items = unsafe { sequence.range_mut(low..=high) };
        low + partition(items, 0, high - low)
    };

    // SAFETY: Both sides are disjoint sub-ranges of our exclusive range, and the
    // pivot at index `p` isn't touched anymore.
    unsafe {
        if p > low {
            sort_side(pool, sequence, low, p - 1, options);
        }
        if p < high {
            sort_side(pool, sequence, p + 1, high, options);
        }
    }
}

/// Sorts `sequence[low..=high]` inline, or submits it as a task if it's
/// longer than the threshold.
///
/// # Safety
///
/// Same contract as [`parallel_sort()`].
unsafe fn sort_side<T: Ord + Send + 'static>(
    pool: &PoolHandle,
    sequence: &SharedSlice<T>,
    low: usize,
    high: usize,
    options: SortOptions,
) {
    let len = high - low + 1;
    if len > options.threshold {
        #[cfg(feature = "log_parallelism")]
        log_trace!("Submitting range {low}..={high} ({len} items)");
        // SAFETY: The exclusive access to the range moves to the task.
        unsafe { submit_sort(pool, sequence, low, high, options) };
    } else {
        #[cfg(feature = "log_parallelism")]
        log_trace!("Sorting range {low}..={high} ({len} items) inline");
        // SAFETY: This call has exclusive access to the range, as ensured by the
        // caller.
        let items = unsafe { sequence.range_mut(low..=high) };
        quick_sort(items, 0, high - low);
    }
}

/// Submits a task running [`parallel_sort()`] over `sequence[low..=high]`.
///
/// # Safety
///
/// Same contract as [`parallel_sort()`].
unsafe fn submit_sort<T: Ord + Send + 'static>(
    pool: &PoolHandle,
    sequence: &SharedSlice<T>,
    low: usize,
    high: usize,
    options: SortOptions,
) {
    let task_pool = pool.clone();
    pool.submit_range(sequence.clone(), low..=high, move |sequence, low, high| {
        // SAFETY: The task inherits the exclusive access to the range from its
        // submitter.
        unsafe { parallel_sort(&task_pool, sequence, low, high, options) }
    });
}

/// Sorts a vector on the given thread pool and returns it.
///
/// This submits a single top-level task and blocks until the pool is idle.
///
/// ```
/// # use sortpool::{sort_vec, SortOptions, ThreadPoolBuilder};
/// let mut thread_pool = ThreadPoolBuilder::default().build();
/// thread_pool.start();
///
/// let sorted = sort_vec(&thread_pool, vec![5, 3, 8, 1, 9, 2], SortOptions::default());
/// assert_eq!(sorted, vec![1, 2, 3, 5, 8, 9]);
/// ```
///
/// # Panics
///
/// Panics if the pool isn't running, or if a task panicked.
pub fn sort_vec<T: Ord + Send + 'static>(
    pool: &ThreadPool,
    items: Vec<T>,
    options: SortOptions,
) -> Vec<T> {
    if items.len() < 2 {
        return items;
    }

    let high = items.len() - 1;
    let sequence = SharedSlice::from(items);
    // SAFETY: The buffer was just created and no other handle to it escapes this
    // function, so the top-level task has exclusive access to it.
    unsafe { submit_sort(&pool.handle(), &sequence, 0, high, options) };
    pool.wait_idle();

    match sequence.try_into_vec() {
        Ok(items) => items,
        Err(sequence) => panic!("All tasks completed but {sequence:?} is still shared"),
    }
}
