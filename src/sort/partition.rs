// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Sequential building blocks: the partition step and the quicksort built on
//! top of it.

/// Partitions `slice[low..=high]` around the pivot `slice[high]` and returns
/// the final index of the pivot.
///
/// After this call, the items at indices `low..p` are less than the pivot, and
/// the items at indices `p..=high` are greater than or equal to it, where `p`
/// is the returned index.
///
/// The caller must ensure that `low <= high` and that `high` is in bounds.
///
/// ```
/// # use sortpool::partition;
/// let mut items = [5, 3, 8, 1, 9, 2];
/// let p = partition(&mut items, 0, 5);
/// assert_eq!(p, 1);
/// assert_eq!(items[p], 2);
/// assert!(items[..p].iter().all(|&x| x < 2));
/// assert!(items[p..].iter().all(|&x| x >= 2));
/// ```
pub fn partition<T: Ord>(slice: &mut [T], low: usize, high: usize) -> usize {
    let mut store = low;
    for j in low..high {
        if slice[j] < slice[high] {
            slice.swap(store, j);
            store += 1;
        }
    }
    slice.swap(store, high);
    store
}

/// Sorts `slice[low..=high]` in place on the current thread.
///
/// Recursion happens on the smaller side of each partition while the larger
/// side is handled iteratively, which bounds the stack depth logarithmically.
pub fn quick_sort<T: Ord>(slice: &mut [T], mut low: usize, mut high: usize) {
    while low < high {
        let p = partition(slice, low, high);
        if p - low < high - p {
            if p > low {
                quick_sort(slice, low, p - 1);
            }
            low = p + 1;
        } else {
            quick_sort(slice, p + 1, high);
            // Here p > low, otherwise the left side would be the smaller one.
            high = p - 1;
        }
    }
}

/// Sorts a whole slice in place on the current thread.
pub fn sequential_sort<T: Ord>(slice: &mut [T]) {
    if slice.len() > 1 {
        quick_sort(slice, 0, slice.len() - 1);
    }
}
