// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Transforming the output of an awaitable without awaiting it first.

use core::pin::Pin;
use core::task::{Context, Poll};
use core::{fmt, task};

use pin_project::pin_project;

use crate::awaitable::{AwaitResult, Awaitable};

/// Extension trait applying a synchronous transform to an awaitable's
/// output.
///
/// The transform runs inline on whichever thread completes the underlying
/// operation, right when the output becomes available. Nothing runs until
/// the returned [`Fmap`] is awaited, so transforms compose without starting
/// the work.
pub trait FmapExt: Awaitable + Sized {
    /// Maps the output of this awaitable through `f`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cotask::{FmapExt, Task, sync_wait};
    ///
    /// let task = Task::new(async { String::from("base") })
    ///     .fmap(|out| out.map(|s| format!("pre_{s}_post")));
    ///
    /// assert_eq!(sync_wait(task).unwrap(), "pre_base_post");
    /// ```
    fn fmap<Fun, U>(self, f: Fun) -> Fmap<Self::IntoFuture, Fun>
    where
        Fun: FnOnce(AwaitResult<Self>) -> U,
    {
        Fmap {
            fut: self.into_future(),
            f: Some(f),
        }
    }
}

impl<A: Awaitable> FmapExt for A {}

/// Awaitable returned from [`FmapExt::fmap`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Fmap<F, Fun> {
    #[pin]
    fut: F,
    f: Option<Fun>,
}

impl<F, Fun, U> Future for Fmap<F, Fun>
where
    F: Future,
    Fun: FnOnce(F::Output) -> U,
{
    type Output = U;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = task::ready!(this.fut.poll(cx));
        let f = this.f.take().expect("`Fmap` polled after completion");
        Poll::Ready(f(output))
    }
}

impl<F, Fun> fmt::Debug for Fmap<F, Fun> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fmap").finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use crate::awaitable::ready;
    use crate::shared_task::SharedTask;
    use crate::sync_wait;
    use crate::task::Task;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_ready, task};

    #[test]
    fn transforms_the_output_of_a_task() {
        let task = Task::new(async { String::from("base") })
            .fmap(|out| out.map(|s| format!("pre_{s}_post")));

        assert_eq!(sync_wait(task).unwrap(), "pre_base_post");
    }

    #[test]
    fn transform_does_not_start_the_work() {
        let started = Arc::new(AtomicUsize::new(0));

        let task = Task::new({
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                1u32
            }
        })
        .fmap(|out| out.map(|n| n + 1));

        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(sync_wait(task).unwrap(), 2);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_clone_of_a_shared_task_can_be_mapped() {
        let shared = SharedTask::new(async { 2u32 });

        let doubled = shared.clone().fmap(|out| out.map(|n| n * 2));
        let tripled = shared.fmap(|out| out.map(|n| n * 3));

        assert_eq!(sync_wait(doubled).unwrap(), 4);
        assert_eq!(sync_wait(tripled).unwrap(), 6);
    }

    #[test]
    fn maps_compose() {
        let chained = sync_wait(ready(1).fmap(|n| n + 1).fmap(|n| n * 10));
        let composed = sync_wait(ready(1).fmap(|n| (n + 1) * 10));

        assert_eq!(chained, 20);
        assert_eq!(chained, composed);
    }

    #[test]
    fn unit_tasks_can_be_mapped_to_values() {
        let task = Task::new(async {}).fmap(|out| out.map(|()| "done"));
        assert_eq!(sync_wait(task).unwrap(), "done");
    }

    #[test]
    fn bare_futures_can_be_mapped() {
        let value = sync_wait(async { 5u32 }.fmap(|n| n.to_string()));
        assert_eq!(value, "5");
    }

    #[test]
    #[should_panic(expected = "polled after completion")]
    fn polling_after_completion_panics() {
        let mut mapped = task::spawn(ready(1).fmap(|n| n + 1));
        assert_ready!(mapped.poll());
        let _ = mapped.poll();
    }
}
