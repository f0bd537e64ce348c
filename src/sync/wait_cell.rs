// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::panic::{RefUnwindSafe, UnwindSafe};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::{fmt, task};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Closed;
use crate::util::{CachePadded, loom_const_fn};

/// An atomically registered [`Waker`].
///
/// The cell holds the [`Waker`] of at most one task. A waker is stored by
/// calling [`poll_wait`] (or polling the [`wait`]/[`subscribe`] futures) and
/// consumed by [`wake`], which hands the registered task exactly one wakeup.
/// Wakeups arriving while no waker is registered are buffered in the state
/// word and consumed by the next registration attempt.
///
/// The synchronization strategy follows Tokio's `AtomicWaker` as extended by
/// `maitake-sync` with a close bit, so a dropped cell can evict its waiter
/// with an error instead of leaving it stranded.
///
/// [`poll_wait`]: Self::poll_wait
/// [`wait`]: Self::wait
/// [`subscribe`]: Self::subscribe
/// [`wake`]: Self::wake
pub struct WaitCell {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq)]
    struct State: usize {
        const WAITING = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING = 0b0010;
        const WOKEN = 0b0100;
        const CLOSED = 0b1000;
    }
}
// WAITING MUST be zero
const_assert_eq!(State::WAITING.bits(), 0);

/// Future returned from [`WaitCell::wait()`].
///
/// This future is fused, so once it has completed, any future calls to poll
/// will immediately return [`Poll::Ready`].
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    cell: &'a WaitCell,

    /// Outcome of an eager registration performed by [`WaitCell::subscribe`],
    /// if any.
    presubscribe: Poll<Result<(), Closed>>,
}

/// Future returned from [`WaitCell::subscribe()`].
///
/// See the documentation for [`WaitCell::subscribe()`] for details.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Subscribe<'a> {
    cell: &'a WaitCell,
}

/// An error indicating that a [`WaitCell`] was closed or busy while
/// attempting to register a [`Waker`].
///
/// This error is returned by the [`WaitCell::poll_wait`] method.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollWaitError {
    /// The [`Waker`] was not registered because the [`WaitCell`] has been
    /// [closed](WaitCell::close).
    Closed,

    /// The [`Waker`] was not registered because another task was concurrently
    /// storing its own [`Waker`] in the [`WaitCell`].
    Busy,
}

// === impl WaitCell ===

impl WaitCell {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                state: CachePadded(AtomicUsize::new(State::WAITING.bits())),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Register the waker from `cx`, or consume a buffered wakeup.
    ///
    /// # Returns
    ///
    /// - [`Poll::Pending`] if the waker was registered.
    /// - [`Poll::Ready`]`(Ok(()))` if the cell was woken while registering or
    ///   a previous wakeup was buffered in the cell.
    /// - [`Poll::Ready`]`(Err(PollWaitError::Closed))` if the cell is closed.
    /// - [`Poll::Ready`]`(Err(PollWaitError::Busy))` if another task was
    ///   concurrently registering its waker.
    #[tracing::instrument]
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), PollWaitError>> {
        // this is based on tokio's AtomicWaker synchronization strategy
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(Err(PollWaitError::Closed));
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // take the buffered wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(Ok(()));
            }
            // someone else is waking the cell right now, so don't wait!
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(Ok(()));
            }
            Err(_) => return Poll::Ready(Err(PollWaitError::Busy)),
            Ok(_) => {}
        }

        let waker = cx.waker();
        tracing::trace!(wait_cell = ?self, ?waker, "registering waker");

        // Safety: the REGISTERING bit is set, so this thread has exclusive
        // access to the waker slot.
        let prev_waker = self.waker.with_mut(|old_waker| unsafe {
            match &mut *old_waker {
                Some(old_waker) if waker.will_wake(old_waker) => None,
                old => old.replace(waker.clone()),
            }
        });

        if let Some(prev_waker) = prev_waker {
            tracing::trace!("replaced an old waker in cell, waking");
            prev_waker.wake();
        }

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // The state changed while the waker was being stored, which can
            // only mean the cell was woken or closed. Undo the registration
            // and report the wakeup to the caller directly.
            tracing::trace!(state = ?actual, "was notified while registering");

            // Safety: the REGISTERING bit is still set, waking threads back
            // off from the slot while it is.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // Reset to WAITING, preserving only the CLOSED bit. This does not
            // close the cell, it just refrains from reopening it.
            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);
            debug_assert!(
                state == actual || state == actual | State::CLOSED,
                "state changed unexpectedly while registering!"
            );

            if let Some(waker) = waker {
                waker.wake();
            }

            if state.contains(State::CLOSED) {
                return Poll::Ready(Err(PollWaitError::Closed));
            }

            return Poll::Ready(Ok(()));
        }

        // Waker registered, time to yield!
        Poll::Pending
    }

    /// Wait to be woken up by this cell.
    ///
    /// # Returns
    ///
    /// The future completes with `Ok(())` once [`wake`] is called, or with
    /// `Err(`[`Closed`]`)` if the cell is [closed](Self::close) first.
    ///
    /// **Note**: the calling task's [`Waker`] is not registered until AFTER
    /// the first time the returned [`Wait`] future is polled. A wakeup that
    /// happens in between is lost; when the caller itself triggers the
    /// eventual wakeup, register first with [`subscribe`].
    ///
    /// [`wake`]: Self::wake
    /// [`subscribe`]: Self::subscribe
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            cell: self,
            presubscribe: Poll::Pending,
        }
    }

    /// Eagerly subscribe to notifications from this `WaitCell`.
    ///
    /// This method returns a [`Subscribe`] [`Future`], which outputs a
    /// [`Wait`] future. Awaiting the [`Subscribe`] future registers the
    /// calling task with the cell immediately, so wakeups that occur between
    /// that registration and the `.await` of the returned [`Wait`] future are
    /// buffered rather than lost.
    ///
    /// Use this when the waiting task is about to perform the operation that
    /// ultimately wakes the cell, such as handing a waker-carrying frame to
    /// another thread.
    pub fn subscribe(&self) -> Subscribe<'_> {
        Subscribe { cell: self }
    }

    /// Wake the [`Waker`] stored in this cell.
    ///
    /// # Returns
    ///
    /// - `true` if a waiting task was woken.
    /// - `false` if no task was woken (no [`Waker`] was stored in the cell)
    #[tracing::instrument]
    pub fn wake(&self) -> bool {
        if let Some(waker) = self.take_waker(false) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Close the [`WaitCell`].
    ///
    /// This wakes any waiting task with an error indicating the `WaitCell` is
    /// closed. Subsequent calls to [`wait`] or [`poll_wait`] will return an
    /// error indicating that the cell has been closed.
    ///
    /// [`wait`]: Self::wait
    /// [`poll_wait`]: Self::poll_wait
    #[tracing::instrument]
    pub fn close(&self) -> bool {
        if let Some(waker) = self.take_waker(true) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Returns `true` if this `WaitCell` is [closed](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current_state().contains(State::CLOSED)
    }

    #[tracing::instrument]
    fn take_waker(&self, close: bool) -> Option<Waker> {
        // Set the WAKING bit (to indicate that we're touching the waker) and
        // the WOKEN bit (to indicate that we intend to wake it up).
        let state = {
            let mut bits = State::WAKING | State::WOKEN;
            if close {
                bits |= State::CLOSED;
            }
            self.fetch_or(bits, Ordering::AcqRel)
        };

        // Is anyone else touching the waker?
        if !state.intersects(State::WAKING | State::REGISTERING | State::CLOSED) {
            // Safety: the WAKING bit is set and no registering task holds the
            // slot, so this thread has exclusive access to the waker.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // Release the lock.
            self.fetch_and(!State::WAKING, Ordering::Release);

            if let Some(waker) = waker {
                tracing::trace!(wait_cell = ?self, ?close, ?waker, "taking waker");
                return Some(waker);
            }
        }

        None
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: State, new: State, success: Ordering) -> Result<State, State> {
        self.state
            .0
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.0.load(Ordering::Acquire))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell::new()
    }
}

impl RefUnwindSafe for WaitCell {}
impl UnwindSafe for WaitCell {}

// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Send for WaitCell {}
// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Drop for WaitCell {
    fn drop(&mut self) {
        self.close();
    }
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = Result<(), Closed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Did a wakeup occur while we were pre-registering the future?
        if self.presubscribe.is_ready() {
            return self.presubscribe;
        }

        // Okay, actually poll the cell, then.
        match task::ready!(self.cell.poll_wait(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(PollWaitError::Closed) => Poll::Ready(Err(Closed::new())),
            Err(PollWaitError::Busy) => {
                // If some other task was registering, yield and try to
                // re-register our waker when that task is done.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

// === impl Subscribe ===

impl<'cell> Future for Subscribe<'cell> {
    type Output = Wait<'cell>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Pre-register the waker in the cell.
        let presubscribe = match self.cell.poll_wait(cx) {
            Poll::Ready(Err(PollWaitError::Busy)) => {
                // Someone else is in the process of registering. Yield now so
                // we can wait until that task is done, and then try again.
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Poll::Ready(Err(PollWaitError::Closed)) => Poll::Ready(Err(Closed::new())),
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        };

        Poll::Ready(Wait {
            cell: self.cell,
            presubscribe,
        })
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn wait_smoke() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let wait = Arc::new(WaitCell::new());

        let mut task = task::spawn({
            let wait = wait.clone();
            async move { wait.wait().await }
        });

        assert_pending!(task.poll());

        assert!(wait.wake());

        assert!(task.is_woken());
        assert_ready_ok!(task.poll());
    }

    /// Re-polling a pending `Wait` must keep the registration intact rather
    /// than treating its own waker as a wakeup.
    #[test]
    fn wait_spurious_poll() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let cell = Arc::new(WaitCell::new());
        let mut task = task::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });

        assert_pending!(task.poll(), "first poll should be pending");
        assert_pending!(task.poll(), "second poll should be pending");

        cell.wake();

        assert_ready_ok!(task.poll(), "should have been woken");
    }

    #[test]
    fn subscribe() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        futures::executor::block_on(async {
            let cell = WaitCell::new();
            let wait = cell.subscribe().await;
            cell.wake();
            wait.await.unwrap();
        })
    }

    #[test]
    fn wake_before_subscribe() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let cell = Arc::new(WaitCell::new());
        cell.wake();

        let mut task = task::spawn({
            let cell = cell.clone();
            async move {
                let wait = cell.subscribe().await;
                wait.await.unwrap();
            }
        });

        assert_ready!(task.poll(), "woken task should complete");

        let mut task = task::spawn({
            let cell = cell.clone();
            async move {
                let wait = cell.subscribe().await;
                wait.await.unwrap();
            }
        });

        assert_pending!(task.poll(), "wait cell hasn't been woken yet");
        cell.wake();
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn wake_debounce() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let cell = Arc::new(WaitCell::new());

        let mut task = task::spawn({
            let cell = cell.clone();
            async move {
                cell.wait().await.unwrap();
            }
        });

        assert_pending!(task.poll());
        cell.wake();
        cell.wake();
        assert!(task.is_woken());
        assert_ready!(task.poll());

        let mut task = task::spawn({
            let cell = cell.clone();
            async move {
                cell.wait().await.unwrap();
            }
        });

        assert_pending!(task.poll());
        assert!(!task.is_woken());

        cell.wake();
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn close_evicts_waiter() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let cell = Arc::new(WaitCell::new());

        let mut task = task::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });

        assert_pending!(task.poll());
        assert!(cell.close());
        assert!(task.is_woken());
        assert_eq!(assert_ready!(task.poll()), Err(Closed::new()));

        // Registration attempts after close fail immediately.
        let mut task = task::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });
        assert_eq!(assert_ready!(task.poll()), Err(Closed::new()));
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::{model, thread};

    fn poll_fn_waker(cell: &WaitCell, waker: &Waker) -> Poll<Result<(), PollWaitError>> {
        let mut cx = Context::from_waker(waker);
        cell.poll_wait(&mut cx)
    }

    #[test]
    fn wake_vs_register() {
        model(|| {
            let cell = Arc::new(WaitCell::new());

            let waker_side = thread::spawn({
                let cell = cell.clone();
                move || {
                    cell.wake();
                }
            });

            // A registration either parks and is later woken, or observes the
            // buffered wakeup immediately. Either way it must not hang.
            let waker = Waker::noop();
            match poll_fn_waker(&cell, waker) {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(err)) => panic!("unexpected poll_wait error: {err:?}"),
            }

            waker_side.join().unwrap();
        });
    }

    #[test]
    fn close_vs_register() {
        model(|| {
            let cell = Arc::new(WaitCell::new());

            let closer = thread::spawn({
                let cell = cell.clone();
                move || {
                    cell.close();
                }
            });

            let waker = Waker::noop();
            match poll_fn_waker(&cell, waker) {
                Poll::Ready(Err(PollWaitError::Busy)) => panic!("no concurrent registration"),
                Poll::Ready(_) | Poll::Pending => {}
            }

            closer.join().unwrap();
        });
    }
}
