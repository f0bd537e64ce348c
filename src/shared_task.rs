// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::mem::ManuallyDrop;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::ptr;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use core::{fmt, task};
use std::panic;

use static_assertions::assert_impl_all;

use crate::error::JoinError;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use crate::sync::WaitCell;
use crate::task::BoxFuture;

/// A lazily started unit of work that any number of owners can await.
///
/// Like [`Task`](crate::Task), the body does not run until a handle is first
/// awaited; that first awaiter starts it on its own thread. Unlike `Task`,
/// the handle is [`Clone`], the body runs at most once no matter how many
/// handles exist, and every awaiter receives the same outcome: a clone of the
/// output on success, or a [`JoinError`] carrying the one shared panic
/// payload on failure.
///
/// Handles created by [`Clone`] refer to the same computation; [`ptr_eq`]
/// tells handles of the same computation apart from handles of another one.
/// The computation's state lives as long as any handle (or in-flight await)
/// referencing it, and the parked output is dropped together with the last
/// of them.
///
/// Awaiting consumes one handle, so sharing an await across consumers is
/// `shared.clone().await`. Requires `T: Clone`; a non-cloneable computation
/// can still be driven and observed through [`when_ready`] and
/// [`is_ready`].
///
/// [`ptr_eq`]: Self::ptr_eq
/// [`when_ready`]: Self::when_ready
/// [`is_ready`]: Self::is_ready
///
/// # Examples
///
/// ```
/// use cotask::{SharedTask, sync_wait};
///
/// let shared = SharedTask::new(async { String::from("shared") });
/// let twin = shared.clone();
///
/// assert_eq!(sync_wait(shared).unwrap(), "shared");
/// assert_eq!(sync_wait(twin).unwrap(), "shared");
/// ```
#[must_use = "tasks do nothing unless awaited"]
pub struct SharedTask<T> {
    frame: Option<Arc<Frame<T>>>,
}

assert_impl_all!(SharedTask<u32>: Send, Sync, Clone);

/// State value of a frame whose body has not been started yet.
///
/// Never dereferenced, only compared.
const NOT_STARTED: *mut Waiter = ptr::without_provenance_mut(1);

/// State value of a frame whose output has been published.
///
/// Never dereferenced, only compared.
const READY: *mut Waiter = ptr::without_provenance_mut(2);

/// Driver latch: nobody is polling the body.
const IDLE: u8 = 0;
/// Driver latch: a thread is polling the body.
const POLLING: u8 = 1;
/// Driver latch: a wake arrived while a thread was polling; that thread
/// must poll again before releasing the latch.
const REPOLL: u8 = 2;

/// The shared computation: body, output slot and waiter list.
///
/// The `waiters` word doubles as the lifecycle state:
///
/// - [`NOT_STARTED`]: the body has never been polled.
/// - null: the body has started and no awaiter is queued.
/// - anything else but [`READY`]: head of the queued waiter list.
/// - [`READY`]: the output is published; the list is gone for good.
///
/// The body itself is polled only while holding the `driver` latch, which
/// serializes the frame waker's re-entrant wakes against in-flight polls.
struct Frame<T> {
    waiters: AtomicPtr<Waiter>,
    driver: AtomicU8,
    body: UnsafeCell<Option<BoxFuture<T>>>,
    output: UnsafeCell<Option<Result<T, JoinError>>>,
}

// Safety: the driver latch serializes all body accesses, and the output is
// written once before READY is published and then only read. `T: Send`
// allows the output to be produced on one thread and land on another.
unsafe impl<T: Send> Send for Frame<T> {}
// Safety: see the `Send` impl; additionally `T: Sync` is required because
// awaiters on separate threads clone the output through a shared reference.
unsafe impl<T: Send + Sync> Sync for Frame<T> {}

#[derive(Debug)]
struct Waiter {
    cell: WaitCell,
    /// Previous list head at the time this node was pushed.
    ///
    /// Written only before the node is published, read only after the list
    /// has been detached.
    next: AtomicPtr<Waiter>,
}

/// Per-awaiter progress through the frame's waiter protocol.
#[derive(Debug)]
enum JoinState {
    /// Not yet queued.
    Init,
    /// Queued; the node's twin reference lives in the frame's list.
    Queued(Arc<Waiter>),
    /// The frame was observed READY.
    Done,
}

/// Future returned from awaiting a [`SharedTask`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Join<T> {
    frame: Option<Arc<Frame<T>>>,
    state: JoinState,
}

/// Future returned from [`SharedTask::when_ready()`].
///
/// Completes once the shared computation has completed, without touching
/// the output. This is how a `SharedTask<T>` with `T: !Clone` can be driven.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WhenReady<T> {
    frame: Option<Arc<Frame<T>>>,
    state: JoinState,
}

// === impl SharedTask ===

impl<T> SharedTask<T> {
    /// Creates a new shared task running `body`.
    ///
    /// The body is not started here; it first runs when one of the handles
    /// is awaited.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::from_body(Box::pin(body))
    }

    pub(crate) fn from_body(body: BoxFuture<T>) -> Self {
        Self {
            frame: Some(Arc::new(Frame {
                waiters: AtomicPtr::new(NOT_STARTED),
                driver: AtomicU8::new(IDLE),
                body: UnsafeCell::new(Some(body)),
                output: UnsafeCell::new(None),
            })),
        }
    }

    /// Creates a shared task whose output is already available.
    pub(crate) fn from_output(output: Result<T, JoinError>) -> Self {
        Self {
            frame: Some(Arc::new(Frame {
                waiters: AtomicPtr::new(READY),
                driver: AtomicU8::new(IDLE),
                body: UnsafeCell::new(None),
                output: UnsafeCell::new(Some(output)),
            })),
        }
    }

    pub(crate) fn empty() -> Self {
        Self { frame: None }
    }

    /// Returns `true` if awaiting this handle will complete without
    /// suspending.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.frame.as_ref().is_none_or(|frame| frame.is_ready())
    }

    /// Returns a future that completes once the shared computation has
    /// completed, without consuming or cloning the output.
    ///
    /// Unlike awaiting the handle itself this puts no bounds on `T`.
    pub fn when_ready(&self) -> WhenReady<T> {
        WhenReady {
            frame: self.frame.clone(),
            state: JoinState::Init,
        }
    }

    /// Returns `true` if both handles refer to the same computation.
    ///
    /// Two empty handles compare equal; an empty handle never equals a
    /// non-empty one.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.frame, &other.frame) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> Clone for SharedTask<T> {
    fn clone(&self) -> Self {
        Self {
            frame: self.frame.clone(),
        }
    }
}

impl<T> Default for SharedTask<T> {
    /// Creates a shared task with no body attached.
    ///
    /// Awaiting it yields [`JoinError::BrokenPromise`].
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for SharedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.frame {
            None => "empty",
            Some(frame) => frame.state_name(),
        };
        f.debug_struct("SharedTask")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> IntoFuture for SharedTask<T> {
    type Output = Result<T, JoinError>;
    type IntoFuture = Join<T>;

    fn into_future(self) -> Join<T> {
        Join {
            frame: self.frame,
            state: JoinState::Init,
        }
    }
}

// === impl Frame ===

impl<T> Frame<T> {
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    fn is_ready(&self) -> bool {
        self.waiters.load(Ordering::Acquire) == READY
    }

    fn state_name(&self) -> &'static str {
        let head = self.waiters.load(Ordering::Acquire);
        if head == READY {
            "ready"
        } else if head == NOT_STARTED {
            "not started"
        } else {
            "running"
        }
    }

    /// Starts the body if nobody has, then either observes the published
    /// output or queues a waiter registered with `cx`'s waker.
    fn poll_ready(this: &Arc<Self>, state: &mut JoinState, cx: &mut Context<'_>) -> Poll<()> {
        match state {
            JoinState::Init => {
                // Exactly one awaiter wins this exchange and runs the first
                // poll of the body inline on its own thread.
                if this
                    .waiters
                    .compare_exchange(
                        NOT_STARTED,
                        ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::trace!("starting shared task body");
                    Self::drive(this);
                }

                if this.is_ready() {
                    *state = JoinState::Done;
                    return Poll::Ready(());
                }

                let node = Arc::new(Waiter {
                    cell: WaitCell::new(),
                    next: AtomicPtr::new(ptr::null_mut()),
                });
                // Register the waker before the node becomes visible so the
                // completing drain always finds it.
                let registered = node.cell.poll_wait(cx);
                assert!(
                    registered.is_pending(),
                    "freshly created waiter cell cannot be woken"
                );

                let raw = Arc::into_raw(Arc::clone(&node)).cast_mut();
                let mut head = this.waiters.load(Ordering::Acquire);
                loop {
                    if head == READY {
                        // Completed while we prepared; don't queue after all.
                        // Safety: `raw` was leaked above and never published.
                        drop(unsafe { Arc::from_raw(raw) });
                        *state = JoinState::Done;
                        return Poll::Ready(());
                    }
                    debug_assert!(head != NOT_STARTED, "the body was started above");

                    node.next.store(head, Ordering::Relaxed);
                    match this.waiters.compare_exchange_weak(
                        head,
                        raw,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            *state = JoinState::Queued(node);
                            return Poll::Pending;
                        }
                        Err(actual) => head = actual,
                    }
                }
            }
            JoinState::Queued(node) => {
                // Queued cells are only woken by the completing drain, so
                // any completion means the output is published.
                if node.cell.poll_wait(cx).is_ready() {
                    *state = JoinState::Done;
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            JoinState::Done => Poll::Ready(()),
        }
    }

    /// Polls the body while holding the driver latch, rerunning whenever a
    /// wake arrived during a poll.
    ///
    /// The body's own dependencies hold the frame waker, whose wake lands
    /// back here, so a shared task progresses on whichever thread signalled
    /// it. The latch collapses concurrent wakes into a single repoll and
    /// guarantees the body is never polled from two threads at once.
    fn drive(this: &Arc<Self>) {
        // Take the latch, or leave the current holder a repoll request.
        loop {
            match this
                .driver
                .compare_exchange(IDLE, POLLING, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(_) => {
                    match this.driver.compare_exchange(
                        POLLING,
                        REPOLL,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        // The holder will observe the request when it tries
                        // to release the latch.
                        Ok(_) => return,
                        // Someone else already requested a repoll.
                        Err(REPOLL) => return,
                        // The holder released the latch in between; take
                        // over.
                        Err(_) => {}
                    }
                }
            }
        }

        enum Step<U> {
            /// The body is still pending.
            Pending,
            /// The body completed during this poll.
            Ready(Result<U, JoinError>),
            /// The body had already completed; nothing left to poll.
            Done,
        }

        let waker = Self::frame_waker(this);
        let mut cx = Context::from_waker(&waker);

        loop {
            let step = this.body.with_mut(|slot| {
                // Safety: the driver latch gives this thread exclusive
                // access to the body slot.
                let slot = unsafe { &mut *slot };
                let Some(body) = slot.as_mut() else {
                    return Step::Done;
                };

                let poll = AssertUnwindSafe(|| body.as_mut().poll(&mut cx));
                match panic::catch_unwind(poll) {
                    Ok(Poll::Pending) => Step::Pending,
                    Ok(Poll::Ready(value)) => {
                        *slot = None;
                        Step::Ready(Ok(value))
                    }
                    Err(payload) => {
                        tracing::trace!("shared task body panicked during poll");
                        *slot = None;
                        Step::Ready(Err(JoinError::panicked(payload)))
                    }
                }
            });

            match step {
                Step::Ready(output) => {
                    this.complete(output);
                    this.driver.store(IDLE, Ordering::Release);
                    return;
                }
                Step::Done => {
                    this.driver.store(IDLE, Ordering::Release);
                    return;
                }
                Step::Pending => {
                    // Release the latch, unless a wake arrived during the
                    // poll; then it is our job to poll again.
                    match this
                        .driver
                        .compare_exchange(POLLING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => return,
                        Err(_) => this.driver.store(POLLING, Ordering::Relaxed),
                    }
                }
            }
        }
    }

    /// Publishes `output` and wakes every queued waiter.
    fn complete(&self, output: Result<T, JoinError>) {
        self.output.with_mut(|slot| {
            // Safety: READY has not been published yet and the driver latch
            // is held, so nothing can race this one-time write.
            unsafe { *slot = Some(output) };
        });

        let head = self.waiters.swap(READY, Ordering::AcqRel);
        debug_assert!(head != READY, "completed twice");
        debug_assert!(head != NOT_STARTED, "completed without starting");
        tracing::trace!("shared task complete, draining waiters");

        let mut curr = head;
        while !curr.is_null() {
            // Safety: every list node was leaked from an `Arc` by
            // `poll_ready`; the swap above detached the whole list,
            // transferring those references here.
            let node = unsafe { Arc::from_raw(curr) };
            curr = node.next.load(Ordering::Relaxed);
            node.cell.wake();
        }
    }

    /// Clones the published output. Callers must have observed READY.
    fn output(&self) -> Result<T, JoinError>
    where
        T: Clone,
    {
        self.output.with(|slot| {
            // Safety: READY is published, so the slot is initialized and
            // never written again; concurrent shared reads are fine.
            unsafe { (*slot).as_ref() }
                .expect("output must be present once READY is published")
                .clone()
        })
    }

    /// Called when a dependency of the body signals progress: reruns the
    /// body on the signalling thread.
    fn on_wake(this: &Arc<Self>) {
        if this.is_ready() {
            return;
        }
        Self::drive(this);
    }

    fn frame_waker(this: &Arc<Self>) -> Waker {
        // Safety: the returned RawWaker's data pointer is a strong frame
        // reference, balanced by `waker_drop`/`waker_wake`.
        unsafe { Waker::from_raw(Self::raw_waker(Arc::clone(this))) }
    }

    // `Waker::will_wake` compares the data pointer and vtable address for
    // identity. Inlining this function could duplicate the vtable per call
    // site, making equal wakers compare unequal, so keep exactly one copy.
    #[inline(never)]
    fn raw_waker(this: Arc<Self>) -> RawWaker {
        RawWaker::new(Arc::into_raw(this).cast::<()>(), &Self::WAKER_VTABLE)
    }

    unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
        // Safety: `ptr` was produced by `Arc::into_raw` in `raw_waker`, and
        // the new waker carries its own strong reference.
        unsafe { Arc::increment_strong_count(ptr.cast::<Self>()) };
        RawWaker::new(ptr, &Self::WAKER_VTABLE)
    }

    unsafe fn waker_wake(ptr: *const ()) {
        // Safety: consumes the strong reference held by this waker.
        let this = unsafe { Arc::from_raw(ptr.cast::<Self>()) };
        Self::on_wake(&this);
    }

    unsafe fn waker_wake_by_ref(ptr: *const ()) {
        // Safety: borrows the strong reference held by this waker without
        // releasing it.
        let this = unsafe { ManuallyDrop::new(Arc::from_raw(ptr.cast::<Self>())) };
        Self::on_wake(&this);
    }

    unsafe fn waker_drop(ptr: *const ()) {
        // Safety: releases the strong reference held by this waker.
        drop(unsafe { Arc::from_raw(ptr.cast::<Self>()) });
    }
}

impl<T> Drop for Frame<T> {
    fn drop(&mut self) {
        // Queued futures keep the frame alive, so by the time the frame
        // drops any node left in the list belongs to an awaiter that was
        // itself dropped. Release the list's references.
        let head = self.waiters.load(Ordering::Acquire);
        if head == READY || head == NOT_STARTED {
            return;
        }
        let mut curr = head;
        while !curr.is_null() {
            // Safety: as in `complete`, each node reference was leaked by
            // `poll_ready` and is released exactly once.
            let node = unsafe { Arc::from_raw(curr) };
            curr = node.next.load(Ordering::Relaxed);
        }
    }
}

// === impl Join ===

impl<T: Clone> Future for Join<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(frame) = &this.frame else {
            return Poll::Ready(Err(JoinError::BrokenPromise));
        };

        task::ready!(Frame::poll_ready(frame, &mut this.state, cx));
        Poll::Ready(frame.output())
    }
}

impl<T> fmt::Debug for Join<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Join")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// === impl WhenReady ===

impl<T> Future for WhenReady<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(frame) = &this.frame else {
            return Poll::Ready(());
        };

        Frame::poll_ready(frame, &mut this.state, cx)
    }
}

impl<T> fmt::Debug for WhenReady<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenReady")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use crate::sync::Event;
    use crate::sync_wait;
    use crate::task::Task;
    use crate::test_util::DropGuard;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    use tokio_test::{assert_pending, assert_ready, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn body_does_not_run_until_awaited() {
        let started = Arc::new(AtomicBool::new(false));

        let shared = SharedTask::new({
            let started = started.clone();
            async move {
                started.store(true, Ordering::SeqCst);
            }
        });
        let twin = shared.clone();

        assert!(!started.load(Ordering::SeqCst));
        assert!(!shared.is_ready());

        sync_wait(twin).unwrap();
        assert!(started.load(Ordering::SeqCst));
        assert!(shared.is_ready());
    }

    #[test]
    fn body_runs_once_for_sequential_awaiters() {
        let runs = Arc::new(AtomicUsize::new(0));

        let shared = SharedTask::new({
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                String::from("once")
            }
        });

        assert_eq!(sync_wait(shared.clone()).unwrap(), "once");
        assert_eq!(sync_wait(shared.clone()).unwrap(), "once");
        assert_eq!(sync_wait(shared).unwrap(), "once");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unit_shared_tasks_broadcast_completion() {
        let runs = Arc::new(AtomicUsize::new(0));

        let shared = SharedTask::new({
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });
        let twin = shared.clone();

        sync_wait(shared).unwrap();
        sync_wait(twin).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_awaiters_all_wake_on_completion() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let event = Arc::new(Event::new());
        let shared = SharedTask::new({
            let event = event.clone();
            async move {
                event.wait().await;
                27u32
            }
        });

        let mut awaiters: Vec<_> = (0..3)
            .map(|_| {
                task::spawn({
                    let shared = shared.clone();
                    async move { shared.await }
                })
            })
            .collect();

        for awaiter in &mut awaiters {
            assert_pending!(awaiter.poll());
        }
        assert!(!shared.is_ready());

        // Completes the body inline and drains the queued waiters.
        event.set();
        assert!(shared.is_ready());

        for awaiter in &mut awaiters {
            assert!(awaiter.is_woken());
            assert_eq!(assert_ready!(awaiter.poll()).unwrap(), 27);
        }
    }

    #[test]
    fn panic_is_shared_with_every_awaiter() {
        let shared = SharedTask::<u32>::new(async { panic!("boom") });

        let first = sync_wait(shared.clone()).unwrap_err();
        let second = sync_wait(shared).unwrap_err();

        assert!(first.is_panic());
        assert!(second.is_panic());

        // Both errors carry the same payload; only one claim succeeds.
        let payload = first.into_panic();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
        assert!(second.try_into_panic().is_none());
    }

    #[test]
    fn output_is_dropped_with_the_last_handle() {
        let (guard, drops) = DropGuard::new();

        let shared = SharedTask::new(async move { guard });
        let twin = shared.clone();

        sync_wait(shared.when_ready());
        assert_eq!(drops.load(Ordering::SeqCst), 0, "output is parked in the frame");

        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 0, "another handle is still alive");

        drop(twin);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_unawaited_shared_task_drops_the_body_once() {
        let (guard, drops) = DropGuard::new();

        let shared = SharedTask::new(async move {
            let _guard = guard;
        });
        let twin = shared.clone();

        drop(shared);
        drop(twin);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_shared_task_reports_broken_promise() {
        let shared = SharedTask::<u32>::default();
        assert!(shared.is_ready());

        let err = sync_wait(shared).unwrap_err();
        assert!(err.is_broken_promise());
    }

    #[test]
    fn ptr_eq_tracks_the_underlying_computation() {
        let a = SharedTask::new(async { 1 });
        let b = a.clone();
        let c = SharedTask::new(async { 1 });

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));

        let empty_a = SharedTask::<u32>::default();
        let empty_b = SharedTask::<u32>::default();
        assert!(empty_a.ptr_eq(&empty_b));
        assert!(!empty_a.ptr_eq(&a));
    }

    #[test]
    fn when_ready_does_not_require_clone() {
        struct NonClone;

        let shared = SharedTask::new(async { NonClone });
        sync_wait(shared.when_ready());
        assert!(shared.is_ready());

        // The output stays parked in the frame until the last handle goes.
        drop(shared);
    }

    #[test]
    fn task_converts_into_shared_task() {
        let task = Task::new(async { String::from("foo") });
        let shared = task.into_shared();
        let twin = shared.clone();

        assert_eq!(sync_wait(shared).unwrap(), "foo");
        assert_eq!(sync_wait(twin).unwrap(), "foo");
    }

    #[test]
    fn completed_task_converts_with_its_output() {
        let mut task = Task::new(async { 5u32 });
        sync_wait(task.when_ready());

        let shared = task.into_shared();
        assert!(shared.is_ready());
        assert_eq!(sync_wait(shared).unwrap(), 5);
    }

    #[test]
    fn empty_task_converts_into_empty_shared_task() {
        let shared = Task::<u32>::default().into_shared();
        assert!(sync_wait(shared).unwrap_err().is_broken_promise());
    }

    #[test]
    fn concurrent_awaiters_share_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));

        let shared = SharedTask::new({
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                7u32
            }
        });

        let awaiters: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || sync_wait(shared).unwrap())
            })
            .collect();

        for awaiter in awaiters {
            assert_eq!(awaiter.join().unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_awaiters_wake_across_threads() {
        let event = Arc::new(Event::new());

        let shared = SharedTask::new({
            let event = event.clone();
            async move {
                event.wait().await;
                String::from("ready")
            }
        });

        let awaiters: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || sync_wait(shared).unwrap())
            })
            .collect();

        // Completes the body on this thread and unparks the awaiters.
        let setter = thread::spawn(move || event.set());

        for awaiter in awaiters {
            assert_eq!(awaiter.join().unwrap(), "ready");
        }
        setter.join().unwrap();
    }

    #[test]
    fn chain_of_synchronous_completions_is_stack_safe() {
        const ITERATIONS: u64 = 1_000_000;

        let total = sync_wait(async {
            let mut sum = 0u64;
            for _ in 0..ITERATIONS {
                sum += SharedTask::new(async { 1u64 }).await.unwrap();
            }
            sum
        });

        assert_eq!(total, ITERATIONS);
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::AtomicUsize;
    use crate::loom::{future, model, thread};
    use crate::sync::Event;

    #[test]
    fn racing_starters_run_the_body_once() {
        model(|| {
            let runs = Arc::new(AtomicUsize::new(0));

            let shared = SharedTask::new({
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    5u32
                }
            });

            let other = thread::spawn({
                let shared = shared.clone();
                move || future::block_on(shared.into_future()).unwrap()
            });

            let mine = future::block_on(shared.into_future()).unwrap();

            assert_eq!(mine, 5);
            assert_eq!(other.join().unwrap(), 5);
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn completion_races_queueing() {
        model(|| {
            let event = Arc::new(Event::new());

            let shared = SharedTask::new({
                let event = event.clone();
                async move {
                    event.wait().await;
                    1u8
                }
            });

            let setter = thread::spawn(move || event.set());

            let got = future::block_on(shared.into_future()).unwrap();
            assert_eq!(got, 1);

            setter.join().unwrap();
        });
    }
}
