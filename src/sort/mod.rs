// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Sorting algorithms: the sequential quicksort and its adaptive parallel
//! driver.

mod parallel;
mod partition;

pub use parallel::{parallel_sort, sort_vec, SortOptions, DEFAULT_THRESHOLD};
pub use partition::{partition, quick_sort, sequential_sort};
