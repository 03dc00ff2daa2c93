// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod core;
mod macros;
mod sort;

pub use crate::core::{
    CpuPinningPolicy, PoolHandle, PoolState, SharedSlice, ThreadCount, ThreadPool,
    ThreadPoolBuilder,
};
pub use crate::sort::{
    parallel_sort, partition, quick_sort, sequential_sort, sort_vec, SortOptions,
    DEFAULT_THRESHOLD,
};
