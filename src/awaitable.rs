// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The awaitable protocol.
//!
//! A *suspendable operation* is anything a task can pause on and resume from:
//! it can report whether its result is already available, it can park a
//! continuation to be run on completion, and it can hand over the result once
//! there is one. Rust expresses exactly this triple through [`Future`]: a
//! poll that returns [`Poll::Ready`](core::task::Poll::Ready) answers the
//! readiness question, the [`Waker`](core::task::Waker) in the poll context
//! is the registered continuation, and the value inside `Ready` is the
//! result.
//!
//! The combinators in this crate therefore accept any [`IntoFuture`] value,
//! bound through the [`Awaitable`] alias: [`Task`](crate::Task) and
//! [`SharedTask`](crate::SharedTask) are the producers defined here, but
//! `async` blocks and foreign futures compose just as well.

use core::pin::Pin;
use core::task::{Context, Poll};

/// A suspendable operation: anything that can be converted into a [`Future`].
///
/// This is a blanket alias used as the vocabulary bound of the combinators
/// ([`when_all_ready`](crate::when_all_ready), [`fmap`](crate::FmapExt::fmap),
/// [`sync_wait`](crate::sync_wait)). It carries no methods of its own.
pub trait Awaitable: IntoFuture {}

impl<A: IntoFuture> Awaitable for A {}

/// The eventual output of awaiting `A`.
pub type AwaitResult<A> = <A as IntoFuture>::Output;

/// Returns an awaitable that is immediately ready with `value`.
///
/// # Examples
///
/// ```
/// use cotask::{ready, sync_wait};
///
/// assert_eq!(sync_wait(ready(42)), 42);
/// ```
pub fn ready<T>(value: T) -> Ready<T> {
    Ready(Some(value))
}

/// Awaitable returned from [`ready`].
#[derive(Debug, Clone)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Ready<T>(Option<T>);

// The parked value is plain data, polling only ever moves it out.
impl<T> Unpin for Ready<T> {}

impl<T> Future for Ready<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let value = self
            .get_mut()
            .0
            .take()
            .expect("`Ready` polled after completion");
        Poll::Ready(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_resolves_immediately() {
        let value = futures::executor::block_on(ready(42));
        assert_eq!(value, 42);
    }

    #[test]
    fn async_blocks_satisfy_the_alias() {
        fn assert_awaitable<A: Awaitable>(a: A) -> A {
            a
        }

        let out = futures::executor::block_on(assert_awaitable(async { "hello" }));
        assert_eq!(out, "hello");
    }
}
