// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool that sorts a random array on a thread pool and checks the result.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use sortpool::{
    parallel_sort, CpuPinningPolicy, SharedSlice, SortOptions, ThreadCount, ThreadPoolBuilder,
    DEFAULT_THRESHOLD,
};
use std::num::NonZeroUsize;
use std::time::Instant;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut thread_pool = ThreadPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: if cli.pin_cpus {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
    }
    .build();
    thread_pool.start();

    let input = fill_random(cli.input_size, cli.seed);
    let options = SortOptions {
        threshold: cli.threshold,
    };
    println!(
        "Sorting {} items on {} thread(s) with threshold {}",
        input.len(),
        thread_pool.num_threads(),
        options.threshold
    );

    let start = Instant::now();
    let output = if input.is_empty() {
        input
    } else {
        let high = input.len() - 1;
        let sequence = SharedSlice::from(input);
        let handle = thread_pool.handle();
        let task_pool = handle.clone();
        handle.submit_range(sequence.clone(), 0..=high, move |sequence, low, high| {
            // SAFETY: The main thread doesn't touch the buffer until the pool is
            // idle.
            unsafe { parallel_sort(&task_pool, sequence, low, high, options) }
        });

        match cli.wait {
            WaitStrategy::Block => thread_pool.wait_idle(),
            WaitStrategy::Poll => {
                while thread_pool.active_task_count() > 0 {
                    std::thread::yield_now();
                }
            }
        }

        match sequence.try_into_vec() {
            Ok(output) => output,
            Err(_) => panic!("The buffer is still shared after all tasks completed"),
        }
    };
    let elapsed = start.elapsed();
    thread_pool.stop();

    println!(
        "Sorted in {:.6} s using {} task(s)",
        elapsed.as_secs_f64(),
        thread_pool.submitted_task_count()
    );

    if output.windows(2).all(|w| w[0] <= w[1]) {
        println!("The array is sorted!");
    } else {
        println!("The array is NOT sorted!");
        std::process::exit(1);
    }
}

/// Creates a vector of `input_size` random integers in `0..2 * input_size`,
/// reproducible from the given seed.
fn fill_random(input_size: usize, seed: u64) -> Vec<u64> {
    let mut rng = ChaCha12Rng::seed_from_u64(seed);
    let bound = (2 * input_size as u64).max(1);
    (0..input_size).map(|_| rng.random_range(0..bound)).collect()
}

/// CLI tool that sorts a random array on a thread pool.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Number of items to sort.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: usize,

    /// Sub-ranges longer than this are sorted by a new task.
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: usize,

    /// Seed of the random input.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// How the main thread waits for the sort to complete.
    #[arg(long, value_enum, default_value_t = WaitStrategy::Block)]
    wait: WaitStrategy,

    /// Whether to pin worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_cpus: bool,
}

/// How to wait for all tasks to complete.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum WaitStrategy {
    /// Block until the pool is idle.
    Block,
    /// Spin on the number of active tasks, yielding between reads.
    Poll,
}
