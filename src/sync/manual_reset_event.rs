// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::PoisonError;

use crate::loom::sync::{Condvar, Mutex, MutexGuard};
use crate::util::loom_const_fn;

/// A manually reset event for blocking OS threads.
///
/// The event starts out unset. [`wait`] blocks the calling thread until the
/// event becomes set and keeps letting threads through until [`reset`] is
/// called. This is the thread-blocking counterpart of [`Event`]; it backs
/// [`sync_wait`], which parks the calling thread between polls.
///
/// [`wait`]: Self::wait
/// [`reset`]: Self::reset
/// [`Event`]: crate::sync::Event
/// [`sync_wait`]: crate::sync_wait
pub struct ManualResetEvent {
    set: Mutex<bool>,
    cv: Condvar,
}

// === impl ManualResetEvent ===

impl ManualResetEvent {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                set: Mutex::new(false),
                cv: Condvar::new(),
            }
        }
    }

    /// Put the event into the set state, releasing every current and future
    /// [`wait`](Self::wait) until the next [`reset`](Self::reset).
    #[tracing::instrument]
    pub fn set(&self) {
        {
            let mut set = self.lock();
            *set = true;
        }
        self.cv.notify_all();
    }

    /// Put the event back into the unset state.
    #[tracing::instrument]
    pub fn reset(&self) {
        *self.lock() = false;
    }

    /// Returns `true` if the event is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Block the calling thread until the event is set.
    ///
    /// Returns immediately if the event is already set.
    #[tracing::instrument]
    pub fn wait(&self) {
        let mut set = self.lock();
        while !*set {
            set = self
                .cv
                .wait(set)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panicked setter cannot leave the flag torn, so waiting through a
        // poisoned lock is sound.
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualResetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualResetEvent")
            .field("set", &self.is_set())
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_before_wait() {
        let event = ManualResetEvent::new();
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        // Must not block.
        event.wait();
    }

    #[test]
    fn reset_rearms() {
        let event = ManualResetEvent::new();
        event.set();
        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn wait_releases_parked_threads() {
        let event = Arc::new(ManualResetEvent::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || event.wait())
            })
            .collect();

        event.set();

        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::{model, thread};

    #[test]
    fn set_wakes_waiter() {
        model(|| {
            let event = Arc::new(ManualResetEvent::new());

            let setter = thread::spawn({
                let event = event.clone();
                move || event.set()
            });

            event.wait();
            assert!(event.is_set());

            setter.join().unwrap();
        });
    }
}
