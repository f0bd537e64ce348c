// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::ptr;
use core::task::{Context, Poll};

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::WaitCell;
use crate::util::loom_const_fn;

/// Sentinel state value marking the event as set.
///
/// Never dereferenced, only compared.
const SET: *mut Waiter = ptr::without_provenance_mut(1);

/// An asynchronous manually reset event.
///
/// The event starts out unset. Any number of tasks can await it through
/// [`wait`]; they all suspend until [`set`] is called and stay runnable until
/// the event is [`reset`]. Unlike [`ManualResetEvent`] this never blocks a
/// thread, so it is the tool for fan-out signalling between tasks.
///
/// The waiter list is a lock-free intrusive-style stack: the state word is
/// either the [`SET`] sentinel, null (unset, empty), or the head of a list of
/// reference-counted waiter nodes. [`set`] detaches the whole list with a
/// single swap and wakes every node.
///
/// [`wait`]: Self::wait
/// [`set`]: Self::set
/// [`reset`]: Self::reset
/// [`ManualResetEvent`]: crate::sync::ManualResetEvent
pub struct Event {
    state: AtomicPtr<Waiter>,
}

struct Waiter {
    cell: WaitCell,
    /// Previous list head at the time this node was pushed.
    ///
    /// Written only before the node is published, read only after the list
    /// has been detached.
    next: AtomicPtr<Waiter>,
}

/// Future returned from [`Event::wait()`].
///
/// This future is fused; polling it after completion returns
/// [`Poll::Ready`] immediately.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    event: &'a Event,
    state: WaitState,
}

#[derive(Debug)]
enum WaitState {
    /// Not yet queued.
    Init,
    /// Queued; the node's twin reference lives in the event's list.
    Queued(Arc<Waiter>),
    /// Completed.
    Done,
}

// === impl Event ===

impl Event {
    loom_const_fn! {
        /// Returns a new event in the unset state.
        pub const fn new() -> Self {
            Self {
                state: AtomicPtr::new(ptr::null_mut()),
            }
        }
    }

    /// Returns `true` if the event is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == SET
    }

    /// Wait until the event is set.
    ///
    /// Completes immediately if the event is already set.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            event: self,
            state: WaitState::Init,
        }
    }

    /// Put the event into the set state, waking every queued waiter.
    ///
    /// Tasks that call [`wait`](Self::wait) after this resume immediately,
    /// until the event is [`reset`](Self::reset).
    #[tracing::instrument]
    pub fn set(&self) {
        let head = self.state.swap(SET, Ordering::AcqRel);
        if head == SET {
            return;
        }

        tracing::trace!(event = ?self, "set, draining waiters");
        // Everything queued before the swap belongs to us now; waiters
        // arriving after it observe SET and never queue.
        drain(head);
    }

    /// Put the event back into the unset state.
    ///
    /// Does nothing unless the event is currently set, so waiters queued
    /// concurrently are never stranded.
    pub fn reset(&self) {
        let _ = self
            .state
            .compare_exchange(SET, ptr::null_mut(), Ordering::Relaxed, Ordering::Relaxed);
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Acquire);
        let state = if state == SET {
            "set"
        } else if state.is_null() {
            "unset"
        } else {
            "unset (queued waiters)"
        };
        f.debug_struct("Event")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // No `Wait` future can outlive the event it borrows, so the nodes
        // left in the list are only kept alive by the list itself.
        let head = self.state.load(Ordering::Acquire);
        if head != SET {
            drain(head);
        }
    }
}

/// Walks the detached list starting at `head`, waking and releasing every
/// node.
fn drain(head: *mut Waiter) {
    let mut curr = head;
    while !curr.is_null() {
        // Safety: every non-sentinel list pointer was leaked from an `Arc`
        // by `Wait::poll`; detaching the list transferred that reference
        // to this call, which releases it exactly once.
        let node = unsafe { Arc::from_raw(curr) };
        curr = node.next.load(Ordering::Relaxed);
        node.cell.wake();
    }
}

// === impl Waiter ===

impl Waiter {
    fn new() -> Self {
        Self {
            cell: WaitCell::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("cell", &self.cell)
            .finish_non_exhaustive()
    }
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            WaitState::Init => {
                let node = Arc::new(Waiter::new());
                // Register the waker before the node becomes visible so a
                // drain racing with the push always finds it.
                let registered = node.cell.poll_wait(cx);
                assert!(
                    registered.is_pending(),
                    "freshly created waiter cell cannot be woken"
                );

                let raw = Arc::into_raw(Arc::clone(&node)).cast_mut();
                let mut head = this.event.state.load(Ordering::Acquire);
                loop {
                    if head == SET {
                        // Set while we prepared; don't queue after all.
                        // Safety: `raw` was leaked above and never published.
                        drop(unsafe { Arc::from_raw(raw) });
                        this.state = WaitState::Done;
                        return Poll::Ready(());
                    }

                    node.next.store(head, Ordering::Relaxed);
                    match this.event.state.compare_exchange_weak(
                        head,
                        raw,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            this.state = WaitState::Queued(node);
                            return Poll::Pending;
                        }
                        Err(actual) => head = actual,
                    }
                }
            }
            WaitState::Queued(node) => {
                // The cell is only ever woken by `set` (or the event's own
                // teardown), so any completion means the event fired.
                if node.cell.poll_wait(cx).is_ready() {
                    this.state = WaitState::Done;
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            WaitState::Done => Poll::Ready(()),
        }
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio_test::{assert_pending, assert_ready, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn wait_on_set_event_completes_immediately() {
        let event = Event::new();
        event.set();

        futures::executor::block_on(event.wait());
        assert!(event.is_set());
    }

    #[test]
    fn set_wakes_single_waiter() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let event = Arc::new(Event::new());

        let mut task = task::spawn({
            let event = event.clone();
            async move { event.wait().await }
        });

        assert_pending!(task.poll());

        event.set();

        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn set_wakes_every_waiter() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let event = Arc::new(Event::new());

        let mut waiters: Vec<_> = (0..3)
            .map(|_| {
                task::spawn({
                    let event = event.clone();
                    async move { event.wait().await }
                })
            })
            .collect();

        for waiter in &mut waiters {
            assert_pending!(waiter.poll());
        }

        event.set();

        for waiter in &mut waiters {
            assert!(waiter.is_woken());
            assert_ready!(waiter.poll());
        }
    }

    #[test]
    fn reset_rearms_the_event() {
        let event = Arc::new(Event::new());
        event.set();
        event.reset();
        assert!(!event.is_set());

        let mut task = task::spawn({
            let event = event.clone();
            async move { event.wait().await }
        });

        assert_pending!(task.poll());
        event.set();
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn reset_of_unset_event_is_a_no_op() {
        let event = Arc::new(Event::new());

        let mut task = task::spawn({
            let event = event.clone();
            async move { event.wait().await }
        });
        assert_pending!(task.poll());

        // Queued waiters must survive a spurious reset.
        event.reset();
        event.set();
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn canceled_waiter_leaves_the_list_intact() {
        let event = Arc::new(Event::new());

        let mut canceled = task::spawn({
            let event = event.clone();
            async move { event.wait().await }
        });
        assert_pending!(canceled.poll());
        drop(canceled);

        let mut task = task::spawn({
            let event = event.clone();
            async move { event.wait().await }
        });
        assert_pending!(task.poll());

        event.set();
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::{future, model, thread};

    #[test]
    fn set_wakes_queued_waiter() {
        model(|| {
            let event = Arc::new(Event::new());

            let setter = thread::spawn({
                let event = event.clone();
                move || event.set()
            });

            future::block_on(event.wait());
            assert!(event.is_set());

            setter.join().unwrap();
        });
    }

    #[test]
    fn concurrent_waiters_all_wake() {
        model(|| {
            let event = Arc::new(Event::new());

            let waiter = thread::spawn({
                let event = event.clone();
                move || future::block_on(event.wait())
            });

            event.set();
            future::block_on(event.wait());

            waiter.join().unwrap();
        });
    }
}
