// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread pool, task queue and synchronization primitives.

mod queue;
mod shared;
mod sync;
mod thread_pool;
mod util;

pub use queue::PoolState;
pub use shared::SharedSlice;
pub use thread_pool::{CpuPinningPolicy, PoolHandle, ThreadCount, ThreadPool, ThreadPoolBuilder};
