//! Cooperative tasks without a runtime.
//!
//! This crate provides lazily started, coroutine-style computations
//! ([`Task`] and the multi-consumer [`SharedTask`]), the [`Awaitable`]
//! vocabulary that connects them to `async`/`await`, combinators over them
//! ([`when_all_ready`] and [`FmapExt::fmap`]), synchronization primitives
//! to signal between them ([`sync::Event`] and
//! [`sync::ManualResetEvent`]), and a blocking bridge back into
//! synchronous code ([`sync_wait`]).
//!
//! Everything here is lazy. No body runs before it is awaited, and awaiting
//! transfers control directly to the awaited computation on the current
//! thread: there is no executor, no spawning, no queues. Progress happens
//! exactly where the code awaits or signals.
//!
//! # Examples
//!
//! ```
//! use cotask::{FmapExt, SharedTask, Task, sync_wait, when_all_ready};
//!
//! let base = SharedTask::new(async { 21u32 });
//!
//! let (a, b) = sync_wait(when_all_ready((
//!     Task::new({
//!         let base = base.clone();
//!         async move { base.await.unwrap() * 2 }
//!     }),
//!     base.fmap(|out| out.unwrap() + 1),
//! )));
//!
//! assert_eq!(a.unwrap(), 42);
//! assert_eq!(b, 22);
//! ```

mod loom;
#[cfg(all(not(loom), test))]
mod test_util;
mod util;

pub mod awaitable;
pub mod error;
pub mod fmap;
pub mod shared_task;
pub mod sync;
pub mod sync_wait;
pub mod task;
pub mod when_all;

pub use self::awaitable::{AwaitResult, Awaitable, Ready, ready};
pub use self::error::JoinError;
pub use self::fmap::{Fmap, FmapExt};
pub use self::shared_task::SharedTask;
pub use self::sync_wait::sync_wait;
pub use self::task::Task;
pub use self::when_all::{WhenAllReady, WhenAllReadyVec, when_all_ready, when_all_ready_vec};
