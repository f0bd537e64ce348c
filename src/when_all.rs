// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Joining awaitables: suspend once, resume when every branch is done.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};

use pin_project::pin_project;

use crate::awaitable::Awaitable;

/// Joins a fixed, possibly heterogeneous set of awaitables.
///
/// Takes a tuple of up to eight [`Awaitable`]s and returns a future that
/// completes once **all** of them have completed, yielding the tuple of
/// their outputs in input order. Branches are first polled in input order;
/// if every branch completes synchronously, the join completes on its first
/// poll without suspending.
///
/// The join itself never gives up early: a branch completing with an error
/// value does not cancel its siblings. Pass [`Task`](crate::Task)s (or
/// [`SharedTask`](crate::SharedTask)s) as branches to also capture panics
/// per branch as inspectable [`JoinError`](crate::JoinError)s; a panic in a
/// bare future branch propagates to the awaiter instead.
///
/// # Examples
///
/// ```
/// use cotask::{Task, sync_wait, when_all_ready};
///
/// let (a, b) = sync_wait(when_all_ready((
///     Task::new(async { 1 }),
///     Task::new(async { "two" }),
/// )));
/// assert_eq!(a.unwrap(), 1);
/// assert_eq!(b.unwrap(), "two");
/// ```
pub fn when_all_ready<L: WhenAll>(list: L) -> WhenAllReady<L::Branches> {
    WhenAllReady {
        branches: list.into_branches(),
    }
}

/// Joins a runtime-sized collection of homogeneous awaitables.
///
/// The returned future completes once every element has completed, yielding
/// the outputs in input order. An empty collection completes immediately
/// with an empty `Vec`.
///
/// # Examples
///
/// ```
/// use cotask::{Task, sync_wait, when_all_ready_vec};
///
/// let tasks: Vec<_> = (1..=3).map(|i| Task::new(async move { i })).collect();
/// let outputs = sync_wait(when_all_ready_vec(tasks));
///
/// let values: Vec<_> = outputs.into_iter().map(Result::unwrap).collect();
/// assert_eq!(values, [1, 2, 3]);
/// ```
pub fn when_all_ready_vec<A: Awaitable>(list: Vec<A>) -> WhenAllReadyVec<A::IntoFuture> {
    let branches: Box<[Branch<A::IntoFuture>]> = list
        .into_iter()
        .map(|awaitable| Branch::new(awaitable.into_future()))
        .collect();
    WhenAllReadyVec {
        branches: Box::into_pin(branches),
    }
}

/// Future returned from [`when_all_ready`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WhenAllReady<B: BranchList> {
    #[pin]
    branches: B,
}

impl<B: BranchList> Future for WhenAllReady<B> {
    type Output = B::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if this.branches.as_mut().poll_all(cx) {
            Poll::Ready(this.branches.take_outputs())
        } else {
            Poll::Pending
        }
    }
}

impl<B: BranchList> fmt::Debug for WhenAllReady<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenAllReady").finish_non_exhaustive()
    }
}

/// Future returned from [`when_all_ready_vec`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WhenAllReadyVec<F: Future> {
    branches: Pin<Box<[Branch<F>]>>,
}

impl<F: Future> Future for WhenAllReadyVec<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let mut settled = true;
        for branch in iter_pin_mut(this.branches.as_mut()) {
            settled &= branch.poll_settle(cx);
        }

        if !settled {
            return Poll::Pending;
        }

        let outputs = iter_pin_mut(this.branches.as_mut())
            .map(Branch::take_output)
            .collect();
        Poll::Ready(outputs)
    }
}

impl<F: Future> fmt::Debug for WhenAllReadyVec<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenAllReadyVec")
            .field("branches", &self.branches.len())
            .finish_non_exhaustive()
    }
}

fn iter_pin_mut<T>(slice: Pin<&mut [T]>) -> impl Iterator<Item = Pin<&mut T>> {
    // Safety: the elements of a pinned slice are structurally pinned; none
    // of them is ever moved out through the returned references.
    unsafe { slice.get_unchecked_mut() }.iter_mut().map(|item| {
        // Safety: see above, each element stays pinned in place.
        unsafe { Pin::new_unchecked(item) }
    })
}

/// A single join branch: either the still-running future or its parked
/// output.
#[pin_project(project = BranchProj)]
pub enum Branch<F: Future> {
    /// The wrapped future has not completed yet.
    Running(#[pin] F),
    /// The wrapped future has completed; the output waits here until every
    /// sibling branch has settled.
    Done(Option<F::Output>),
}

impl<F: Future> Branch<F> {
    fn new(fut: F) -> Self {
        Self::Running(fut)
    }

    /// Polls the wrapped future unless it already settled; returns `true`
    /// once the output is parked.
    fn poll_settle(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> bool {
        match self.as_mut().project() {
            BranchProj::Running(fut) => match fut.poll(cx) {
                Poll::Ready(output) => {
                    self.set(Branch::Done(Some(output)));
                    true
                }
                Poll::Pending => false,
            },
            BranchProj::Done(_) => true,
        }
    }

    /// Takes the parked output of a settled branch.
    fn take_output(self: Pin<&mut Self>) -> F::Output {
        match self.project() {
            BranchProj::Done(output) => output
                .take()
                .expect("branch output taken more than once"),
            BranchProj::Running(_) => {
                unreachable!("every branch settles before outputs are taken")
            }
        }
    }
}

mod sealed {
    pub trait SealedList {}
    pub trait SealedTuple {}
}

/// A fixed set of join branches driven by [`WhenAllReady`].
///
/// This trait is sealed; it is implemented for tuples of branches up to
/// arity eight.
pub trait BranchList: sealed::SealedList {
    /// The combined outputs, in input order.
    type Output;

    /// Polls every unsettled branch once; returns `true` when all of them
    /// have settled.
    fn poll_all(self: Pin<&mut Self>, cx: &mut Context<'_>) -> bool;

    /// Takes every parked output. Only valid once [`poll_all`] has returned
    /// `true`, and only once.
    ///
    /// [`poll_all`]: Self::poll_all
    fn take_outputs(self: Pin<&mut Self>) -> Self::Output;
}

/// A tuple of [`Awaitable`]s accepted by [`when_all_ready`].
///
/// This trait is sealed; it is implemented for tuples up to arity eight.
pub trait WhenAll: sealed::SealedTuple {
    /// The branch set driving this tuple.
    type Branches: BranchList;

    /// Converts every element into a fresh join branch.
    fn into_branches(self) -> Self::Branches;
}

impl sealed::SealedList for () {}

impl BranchList for () {
    type Output = ();

    fn poll_all(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> bool {
        true
    }

    fn take_outputs(self: Pin<&mut Self>) -> Self::Output {}
}

impl sealed::SealedTuple for () {}

impl WhenAll for () {
    type Branches = ();

    fn into_branches(self) -> Self::Branches {}
}

macro_rules! impl_when_all {
    ($(($($A:ident => $idx:tt),+)),+ $(,)?) => {$(
        impl<$($A: Future),+> sealed::SealedList for ($(Branch<$A>,)+) {}

        impl<$($A: Future),+> BranchList for ($(Branch<$A>,)+) {
            type Output = ($($A::Output,)+);

            fn poll_all(self: Pin<&mut Self>, cx: &mut Context<'_>) -> bool {
                // Safety: the tuple's fields are structurally pinned; they
                // are only ever repolled or replaced in place.
                let this = unsafe { self.get_unchecked_mut() };
                let mut settled = true;
                $(
                    // Safety: `this` came from a pinned reference and the
                    // field is never moved out.
                    settled &= unsafe { Pin::new_unchecked(&mut this.$idx) }
                        .poll_settle(cx);
                )+
                settled
            }

            fn take_outputs(self: Pin<&mut Self>) -> Self::Output {
                // Safety: as in `poll_all`; settled branches hold no pinned
                // data, only the parked output is moved out.
                let this = unsafe { self.get_unchecked_mut() };
                ($(
                    // Safety: see above.
                    unsafe { Pin::new_unchecked(&mut this.$idx) }.take_output(),
                )+)
            }
        }

        impl<$($A: Awaitable),+> sealed::SealedTuple for ($($A,)+) {}

        impl<$($A: Awaitable),+> WhenAll for ($($A,)+) {
            type Branches = ($(Branch<$A::IntoFuture>,)+);

            fn into_branches(self) -> Self::Branches {
                ($(Branch::new(self.$idx.into_future()),)+)
            }
        }
    )+};
}

impl_when_all! {
    (A1 => 0),
    (A1 => 0, A2 => 1),
    (A1 => 0, A2 => 1, A3 => 2),
    (A1 => 0, A2 => 1, A3 => 2, A4 => 3),
    (A1 => 0, A2 => 1, A3 => 2, A4 => 3, A5 => 4),
    (A1 => 0, A2 => 1, A3 => 2, A4 => 3, A5 => 4, A6 => 5),
    (A1 => 0, A2 => 1, A3 => 2, A4 => 3, A5 => 4, A6 => 5, A7 => 6),
    (A1 => 0, A2 => 1, A3 => 2, A4 => 3, A5 => 4, A6 => 5, A7 => 6, A8 => 7),
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use crate::awaitable::ready;
    use crate::shared_task::SharedTask;
    use crate::sync::Event;
    use crate::sync_wait;
    use crate::task::Task;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn empty_tuple_completes_immediately() {
        let mut join = task::spawn(when_all_ready(()));
        assert_ready!(join.poll());
    }

    #[test]
    fn single_branch_waits_for_its_task() {
        let event = Arc::new(Event::new());

        let worker = Task::new({
            let event = event.clone();
            async move {
                event.wait().await;
                13u32
            }
        });

        let mut join = task::spawn(when_all_ready((worker,)));
        assert_pending!(join.poll());

        event.set();
        assert!(join.is_woken());

        let (result,) = assert_ready!(join.poll());
        assert_eq!(result.unwrap(), 13);
    }

    #[test]
    fn join_waits_for_the_slowest_branch() {
        let first = Arc::new(Event::new());
        let second = Arc::new(Event::new());

        let a = Task::new({
            let first = first.clone();
            async move {
                first.wait().await;
                1u32
            }
        });
        let b = Task::new({
            let second = second.clone();
            async move {
                second.wait().await;
                String::from("two")
            }
        });

        let mut join = task::spawn(when_all_ready((a, b)));
        assert_pending!(join.poll());

        second.set();
        assert!(join.is_woken());
        assert_pending!(join.poll(), "one branch is still running");

        first.set();
        assert!(join.is_woken());

        let (a, b) = assert_ready!(join.poll());
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), "two");
    }

    #[test]
    fn tasks_and_shared_tasks_can_be_mixed() {
        let shared = SharedTask::new(async { 2u32 });

        let (a, b, c) = sync_wait(when_all_ready((
            Task::new(async { 1u32 }),
            shared.clone(),
            shared,
        )));

        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(c.unwrap(), 2);
    }

    #[test]
    fn failed_branches_do_not_abort_their_siblings() {
        let (failed, ok) = sync_wait(when_all_ready((
            Task::<u32>::new(async { panic!("boom") }),
            Task::new(async { 21u32 }),
        )));

        assert!(failed.unwrap_err().is_panic());
        assert_eq!(ok.unwrap(), 21);
    }

    #[test]
    fn outputs_keep_input_order() {
        let (a, b, c) = sync_wait(when_all_ready((
            Task::new(async { 1u32 }),
            Task::new(async { 2u32 }),
            Task::new(async { 3u32 }),
        )));
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(c.unwrap(), 3);
    }

    #[test]
    fn synchronous_branches_complete_on_the_first_poll() {
        let mut join = task::spawn(when_all_ready((ready("a"), ready("b"))));
        let (a, b) = assert_ready!(join.poll());
        assert_eq!((a, b), ("a", "b"));
    }

    #[test]
    fn vec_join_runs_every_task() {
        let event = Arc::new(Event::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let event = event.clone();
                let counter = counter.clone();
                Task::new(async move {
                    event.wait().await;
                    counter.fetch_add(1, Ordering::SeqCst)
                })
            })
            .collect();

        let mut join = task::spawn(when_all_ready_vec(tasks));
        assert_pending!(join.poll());
        assert_eq!(counter.load(Ordering::SeqCst), 0, "tasks are lazy");

        event.set();
        assert!(join.is_woken());

        let outputs = assert_ready!(join.poll());
        assert_eq!(outputs.len(), 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn vec_join_of_shared_task_clones() {
        let shared = SharedTask::new(async { String::from("same") });

        let outputs = sync_wait(when_all_ready_vec(vec![
            shared.clone(),
            shared.clone(),
            shared,
        ]));

        for output in outputs {
            assert_eq!(output.unwrap(), "same");
        }
    }

    #[test]
    fn empty_vec_completes_immediately() {
        let outputs = sync_wait(when_all_ready_vec(Vec::<Task<u32>>::new()));
        assert!(outputs.is_empty());
    }

    #[test]
    fn vec_outputs_keep_input_order_regardless_of_completion_order() {
        let first = Arc::new(Event::new());
        let second = Arc::new(Event::new());

        let tasks = vec![
            Task::new({
                let first = first.clone();
                async move {
                    first.wait().await;
                    1u32
                }
            }),
            Task::new({
                let second = second.clone();
                async move {
                    second.wait().await;
                    2u32
                }
            }),
        ];

        let mut join = task::spawn(when_all_ready_vec(tasks));
        assert_pending!(join.poll());

        // Complete in reverse order.
        second.set();
        assert_pending!(join.poll());
        first.set();

        let outputs = assert_ready!(join.poll());
        let values: Vec<_> = outputs.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, [1, 2]);
    }
}
