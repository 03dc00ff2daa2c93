// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// No user code ever runs while the mutex is held, so a poisoned mutex still
/// contains a consistent value and is recovered transparently.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status without notifying anyone.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the status with the given function and notifies one waiting
    /// thread.
    pub fn update_notify_one<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.condvar.notify_one();
        result
    }

    /// Updates the status with the given function and notifies all waiting
    /// threads.
    pub fn update_notify_all<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.condvar.notify_all();
        result
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.lock(), predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn status_wakes_up_waiter() {
        let status = Arc::new(Status::new(0));

        let waiter = {
            let status = status.clone();
            std::thread::spawn(move || *status.wait_while(|x| *x < 3))
        };

        for _ in 0..3 {
            status.update_notify_all(|x| *x += 1);
        }

        assert_eq!(waiter.join().unwrap(), 3);
    }

    #[test]
    fn status_update_returns_value() {
        let status = Status::new(vec![1, 2]);
        let len = status.update_notify_one(|v| {
            v.push(3);
            v.len()
        });
        assert_eq!(len, 3);
        assert_eq!(*status.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn status_recovers_from_poison() {
        let status = Arc::new(Status::new(42));
        {
            let status = status.clone();
            let result = std::thread::spawn(move || {
                let _guard = status.lock();
                panic!("poisoning the mutex");
            })
            .join();
            assert!(result.is_err());
        }
        assert_eq!(*status.lock(), 42);
        assert_eq!(*status.wait_while(|_| false), 42);
    }
}
