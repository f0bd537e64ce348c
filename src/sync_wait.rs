// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking bridge from synchronous code into awaitables.

use core::mem::ManuallyDrop;
use core::pin::pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::awaitable::{AwaitResult, Awaitable};
use crate::loom::sync::Arc;
use crate::sync::ManualResetEvent;

/// Runs an [`Awaitable`] to completion on the calling thread, parking the
/// thread whenever the operation suspends.
///
/// This is the entry point from synchronous code into the async world: the
/// operation is started lazily on the current thread and the thread blocks
/// on a [`ManualResetEvent`] between polls, until a wake arrives from
/// wherever the operation registered itself.
///
/// A panic escaping the operation propagates to the caller. Note that
/// [`Task`](crate::Task) and [`SharedTask`](crate::SharedTask) capture
/// panics from their bodies and surface them as
/// [`JoinError`](crate::JoinError)s instead.
///
/// # Examples
///
/// ```
/// use cotask::{Task, sync_wait};
///
/// let task = Task::new(async { 6 * 7 });
/// assert_eq!(sync_wait(task).unwrap(), 42);
/// ```
pub fn sync_wait<A: Awaitable>(op: A) -> AwaitResult<A> {
    let mut fut = pin!(op.into_future());

    let signal = Arc::new(ManualResetEvent::new());
    let waker = signal_waker(&signal);
    let mut cx = Context::from_waker(&waker);

    loop {
        if let Poll::Ready(output) = fut.as_mut().poll(&mut cx) {
            return output;
        }

        tracing::trace!("sync_wait: parking until woken");
        signal.wait();
        signal.reset();
    }
}

const SIGNAL_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

fn signal_waker(signal: &Arc<ManualResetEvent>) -> Waker {
    // Safety: the raw waker owns a strong reference to the signal and the
    // vtable below upholds the `RawWaker` contract for `Arc`-based wakers.
    unsafe { Waker::from_raw(raw_waker(Arc::clone(signal))) }
}

// Keep a single instantiation so every waker handed out by `sync_wait`
// shares one vtable address and `Waker::will_wake` stays meaningful.
#[inline(never)]
fn raw_waker(signal: Arc<ManualResetEvent>) -> RawWaker {
    RawWaker::new(Arc::into_raw(signal).cast::<()>(), &SIGNAL_VTABLE)
}

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    // Safety: `ptr` came from `Arc::into_raw` in `raw_waker`.
    unsafe { Arc::increment_strong_count(ptr.cast::<ManualResetEvent>()) };
    RawWaker::new(ptr, &SIGNAL_VTABLE)
}

unsafe fn waker_wake(ptr: *const ()) {
    // Safety: `ptr` came from `Arc::into_raw`; waking by value consumes the
    // reference.
    let signal = unsafe { Arc::from_raw(ptr.cast::<ManualResetEvent>()) };
    signal.set();
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    // Safety: `ptr` came from `Arc::into_raw`. The reference is only
    // borrowed here, so the strong count must stay untouched.
    let signal = unsafe { ManuallyDrop::new(Arc::from_raw(ptr.cast::<ManualResetEvent>())) };
    signal.set();
}

unsafe fn waker_drop(ptr: *const ()) {
    // Safety: `ptr` came from `Arc::into_raw`; this consumes the reference.
    drop(unsafe { Arc::from_raw(ptr.cast::<ManualResetEvent>()) });
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use crate::awaitable::ready;
    use crate::sync::Event;
    use crate::task::Task;
    use core::future::poll_fn;
    use std::thread;
    use std::time::Duration;

    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn returns_a_ready_value_without_parking() {
        assert_eq!(sync_wait(ready(42)), 42);
    }

    #[test]
    fn drives_a_lazy_task_to_completion() {
        let task = Task::new(async { String::from("foo") });
        assert_eq!(sync_wait(task).unwrap(), "foo");
    }

    #[test]
    fn waits_for_a_wake_from_another_thread() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let event = Arc::new(Event::new());

        let setter = thread::spawn({
            let event = event.clone();
            move || {
                thread::sleep(Duration::from_millis(20));
                event.set();
            }
        });

        let value = sync_wait({
            let event = event.clone();
            async move {
                event.wait().await;
                5u32
            }
        });
        assert_eq!(value, 5);

        setter.join().unwrap();
    }

    #[test]
    fn parks_and_wakes_many_times() {
        let mut remaining = 100u32;
        let value = sync_wait(poll_fn(move |cx| {
            if remaining == 0 {
                Poll::Ready(7u32)
            } else {
                remaining -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }));
        assert_eq!(value, 7);
    }

    #[test]
    fn many_sequential_waits() {
        const ITERATIONS: u32 = 1_000_000;

        for i in 0..ITERATIONS {
            assert_eq!(sync_wait(Task::new(async move { i })).unwrap(), i);
        }
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panics_from_bare_futures_propagate() {
        let _value: u32 = sync_wait(async { panic!("boom") });
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{model, thread};
    use crate::sync::Event;

    #[test]
    fn cross_thread_wake_is_never_lost() {
        model(|| {
            let event = Arc::new(Event::new());

            let setter = thread::spawn({
                let event = event.clone();
                move || event.set()
            });

            let value = sync_wait({
                let event = event.clone();
                async move {
                    event.wait().await;
                    5u32
                }
            });
            assert_eq!(value, 5);

            setter.join().unwrap();
        });
    }
}
