// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A buffer shared by reference between tasks, each of which mutates its own
//! disjoint range.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// A reference-counted handle to a buffer whose disjoint ranges can be
/// mutated concurrently by different tasks.
///
/// Cloning the handle doesn't copy the buffer. Once all the tasks that hold a
/// clone have finished, the owner recovers the buffer with
/// [`try_into_vec()`](Self::try_into_vec).
///
/// ```
/// # use sortpool::SharedSlice;
/// let shared = SharedSlice::from(vec![3, 1, 2]);
/// let clone = shared.clone();
/// // SAFETY: No other reference to the buffer's items is alive.
/// unsafe { clone.range_mut(0..=2) }.sort();
/// drop(clone);
/// assert_eq!(shared.try_into_vec().unwrap(), vec![1, 2, 3]);
/// ```
pub struct SharedSlice<T> {
    inner: Arc<SliceCell<T>>,
}

struct SliceCell<T> {
    cells: Box<[UnsafeCell<T>]>,
}

/// SAFETY:
///
/// A [`SliceCell`] hands out `&mut [T]` views of disjoint ranges to different
/// threads, which is equivalent to sending the items to these threads.
/// Therefore it is [`Send`] and [`Sync`] if `T` is [`Send`].
unsafe impl<T: Send> Send for SliceCell<T> {}
/// SAFETY: See the [`Send`] implementation.
unsafe impl<T: Send> Sync for SliceCell<T> {}

impl<T> SharedSlice<T> {
    /// Returns the number of items in the buffer.
    pub fn len(&self) -> usize {
        self.inner.cells.len()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.cells.is_empty()
    }

    /// Returns a mutable view of the given inclusive range of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    ///
    /// # Safety
    ///
    /// For the whole lifetime of the returned slice, no other reference to
    /// any item in `range` may be alive, on this thread or any other. Tasks
    /// uphold this by only ever claiming the range they were submitted with,
    /// and by submitting only ranges that don't overlap with the range they
    /// keep working on.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, range: RangeInclusive<usize>) -> &mut [T] {
        let cells = &self.inner.cells[range];
        let ptr = UnsafeCell::raw_get(cells.as_ptr());
        // SAFETY:
        // - `UnsafeCell<T>` has the same memory layout as `T`, so the `cells.len()`
        //   items starting at `ptr` are valid initialized `T`s.
        // - Nobody else accesses these items during the output lifetime, as ensured by
        //   the caller.
        unsafe { std::slice::from_raw_parts_mut(ptr, cells.len()) }
    }

    /// Recovers the underlying buffer if this is the last handle to it, or
    /// returns the handle unchanged otherwise.
    pub fn try_into_vec(self) -> Result<Vec<T>, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(slice) => Ok(slice
                .cells
                .into_vec()
                .into_iter()
                .map(UnsafeCell::into_inner)
                .collect()),
            Err(inner) => Err(Self { inner }),
        }
    }

    /// Returns the number of handles to this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T> From<Vec<T>> for SharedSlice<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            inner: Arc::new(SliceCell {
                cells: items.into_iter().map(UnsafeCell::new).collect(),
            }),
        }
    }
}

impl<T> Clone for SharedSlice<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for SharedSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSlice")
            .field("len", &self.len())
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}
