// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::mem;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::{fmt, task};
use std::panic;

use crate::error::JoinError;
use crate::shared_task::SharedTask;

/// A boxed task body.
pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A lazily started, single-owner unit of work.
///
/// The body handed to [`Task::new`] does not run at all until the task is
/// awaited; the first poll starts it on the awaiting thread. Awaiting the
/// task yields `Result<T, `[`JoinError`]`>`: the body's return value, the
/// captured panic if it panicked, or [`JoinError::BrokenPromise`] for a
/// handle that never had a body.
///
/// A task that is dropped without ever being awaited simply drops its body,
/// destroying any captured state without running it.
///
/// A `Task` has exactly one owner and yields its result exactly once. To let
/// several consumers await the same computation, convert it with
/// [`into_shared`](Self::into_shared).
///
/// # Examples
///
/// ```
/// use cotask::{Task, sync_wait};
///
/// let task = Task::new(async { 6 * 7 });
/// assert_eq!(sync_wait(task).unwrap(), 42);
/// ```
#[must_use = "tasks do nothing unless awaited"]
pub struct Task<T> {
    stage: Stage<T>,
}

/// The current lifecycle stage of the task body. Either the body itself or
/// its output.
enum Stage<T> {
    /// No body was ever attached.
    Empty,

    /// The body has not completed yet (and has not run at all if the task
    /// was never polled).
    Pending(BoxFuture<T>),

    /// The body has completed; its output is parked here until the task is
    /// polled again.
    Ready(Result<T, JoinError>),

    /// The output has been handed to the awaiter.
    Consumed,
}

/// Future returned from [`Task::when_ready()`].
///
/// Drives the task to completion without consuming its output, leaving the
/// task itself [ready](Task::is_ready) to be awaited.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WhenReady<'a, T> {
    task: &'a mut Task<T>,
}

// === impl Task ===

impl<T> Task<T> {
    /// Creates a new task running `body`.
    ///
    /// The body is not started here; it first runs when the returned task is
    /// awaited or driven through [`when_ready`](Self::when_ready).
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            stage: Stage::Pending(Box::pin(body)),
        }
    }

    /// Returns `true` if awaiting this task will complete without
    /// suspending.
    ///
    /// This is the case once the body has run to completion, and also for
    /// handles with nothing left to run (empty or already consumed).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !matches!(self.stage, Stage::Pending(_))
    }

    /// Returns a future that completes when the task's body has completed,
    /// without consuming the output.
    ///
    /// Afterwards the task [is ready](Self::is_ready) and awaiting it yields
    /// the parked output immediately.
    pub fn when_ready(&mut self) -> WhenReady<'_, T> {
        WhenReady { task: self }
    }

    /// Converts this task into a [`SharedTask`], which can be cloned and
    /// awaited by any number of consumers.
    ///
    /// Output already produced by this task is carried over; a task that
    /// has given its output away converts into an empty shared handle that
    /// reports [`JoinError::BrokenPromise`].
    pub fn into_shared(self) -> SharedTask<T> {
        match self.stage {
            Stage::Pending(body) => SharedTask::from_body(body),
            Stage::Ready(output) => SharedTask::from_output(output),
            Stage::Empty | Stage::Consumed => SharedTask::empty(),
        }
    }
}

impl<T> Default for Task<T> {
    /// Creates a task with no body attached.
    ///
    /// Awaiting it yields [`JoinError::BrokenPromise`].
    fn default() -> Self {
        Self {
            stage: Stage::Empty,
        }
    }
}

// The body is heap-pinned; the handle itself is freely movable.
impl<T> Unpin for Task<T> {}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.stage {
            Stage::Empty => return Poll::Ready(Err(JoinError::BrokenPromise)),
            Stage::Pending(_) => task::ready!(this.stage.poll(cx)),
            Stage::Ready(_) => {}
            Stage::Consumed => panic!("`Task` polled after completion"),
        }

        match mem::replace(&mut this.stage, Stage::Consumed) {
            Stage::Ready(output) => Poll::Ready(output),
            _ => unreachable!("stage must be ready after a completed poll"),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("stage", &self.stage.name())
            .finish_non_exhaustive()
    }
}

// === impl Stage ===

impl<T> Stage<T> {
    /// Polls the pending body, parking its outcome in `Stage::Ready`.
    ///
    /// A body that panics is dropped mid-unwind and the payload is captured
    /// as the task's output, so a panicking computation destroys its state
    /// exactly once and surfaces the panic to whoever asks for the result.
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        struct Guard<'a, T> {
            stage: &'a mut Stage<T>,
        }
        impl<T> Drop for Guard<'_, T> {
            fn drop(&mut self) {
                // If the body panics on poll, we drop it inside the panic
                // guard.
                *self.stage = Stage::Consumed;
            }
        }

        let poll = AssertUnwindSafe(|| -> Poll<T> {
            let guard = Guard { stage: self };

            let Stage::Pending(body) = guard.stage else {
                unreachable!("unexpected stage");
            };

            let res = body.as_mut().poll(cx);
            mem::forget(guard);
            res
        });

        match panic::catch_unwind(poll) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                *self = Stage::Ready(Ok(value));
                Poll::Ready(())
            }
            Err(payload) => {
                tracing::trace!("task body panicked during poll");
                *self = Stage::Ready(Err(JoinError::panicked(payload)));
                Poll::Ready(())
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Pending(_) => "pending",
            Self::Ready(_) => "ready",
            Self::Consumed => "consumed",
        }
    }
}

// === impl WhenReady ===

impl<T> Future for WhenReady<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = &mut *self.get_mut().task;
        match &task.stage {
            Stage::Pending(_) => task.stage.poll(cx),
            Stage::Empty | Stage::Ready(_) | Stage::Consumed => Poll::Ready(()),
        }
    }
}

impl<T> fmt::Debug for WhenReady<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenReady")
            .field("task", &self.task)
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use crate::sync::Event;
    use crate::sync_wait;
    use crate::test_util::DropGuard;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio_test::{assert_pending, assert_ready, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn body_does_not_run_until_awaited() {
        let started = Arc::new(AtomicBool::new(false));

        let task = Task::new({
            let started = started.clone();
            async move {
                started.store(true, Ordering::SeqCst);
            }
        });

        assert!(!started.load(Ordering::SeqCst));
        assert!(!task.is_ready());

        sync_wait(task).unwrap();
        assert!(started.load(Ordering::SeqCst));
    }

    #[test]
    fn await_yields_the_body_output() {
        let task = Task::new(async { String::from("foo") });
        assert_eq!(sync_wait(task).unwrap(), "foo");
    }

    #[test]
    fn task_suspends_until_woken() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let event = Arc::new(Event::new());

        let mut join = task::spawn({
            let event = event.clone();
            async move {
                let task = Task::new(async move {
                    event.wait().await;
                    27
                });
                task.await.unwrap()
            }
        });

        assert_pending!(join.poll());

        event.set();
        assert!(join.is_woken());
        assert_eq!(assert_ready!(join.poll()), 27);
    }

    #[test]
    fn default_task_reports_broken_promise() {
        let task = Task::<u32>::default();
        assert!(task.is_ready());

        let err = sync_wait(task).unwrap_err();
        assert!(err.is_broken_promise());
        assert_eq!(err.to_string(), "broken promise");
    }

    #[test]
    fn panic_in_body_is_captured() {
        let task = Task::new(async { panic!("boom") });

        let err = sync_wait(task).unwrap_err();
        assert!(err.is_panic());

        let payload = err.into_panic();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
    }

    #[test]
    #[should_panic(expected = "polled after completion")]
    fn polling_after_completion_panics() {
        let mut join = task::spawn(Task::new(async { 1 }));
        assert_ready!(join.poll()).unwrap();
        let _ = join.poll();
    }

    #[test]
    fn dropping_an_unawaited_task_drops_captured_state_once() {
        let (guard, drops) = DropGuard::new();

        let task = Task::new(async move {
            let _guard = guard;
        });

        drop(task);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_body_destroys_captured_state_once() {
        let (guard, drops) = DropGuard::new();

        let task = Task::new(async move {
            let _guard = guard;
            panic!("boom");
        });

        let err = sync_wait(task).unwrap_err();
        assert!(err.is_panic());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unconsumed_output_is_dropped_with_the_task() {
        let (guard, drops) = DropGuard::new();

        let mut task = Task::new(async move { guard });

        sync_wait(task.when_ready());
        assert!(task.is_ready());
        assert_eq!(drops.load(Ordering::SeqCst), 0, "output is parked, not dropped");

        drop(task);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn when_ready_leaves_the_output_for_a_later_await() {
        let mut task = Task::new(async { 7 });
        assert!(!task.is_ready());

        sync_wait(task.when_ready());
        assert!(task.is_ready());

        assert_eq!(sync_wait(task).unwrap(), 7);
    }

    #[test]
    fn when_ready_on_an_empty_task_is_immediate() {
        let mut task = Task::<u32>::default();
        sync_wait(task.when_ready());
        assert!(task.is_ready());
    }

    #[test]
    fn chain_of_synchronous_completions_is_stack_safe() {
        const ITERATIONS: u64 = 1_000_000;

        let total = sync_wait(async {
            let mut sum = 0u64;
            for _ in 0..ITERATIONS {
                sum += Task::new(async { 1u64 }).await.unwrap();
            }
            sum
        });

        assert_eq!(total, ITERATIONS);
    }
}
