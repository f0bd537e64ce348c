// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives backing the task types.
//!
//! [`WaitCell`] is the single-waiter building block, [`Event`] is the
//! multi-waiter broadcast flag built on top of it, and [`ManualResetEvent`]
//! is its thread-blocking sibling used to park OS threads.

use core::fmt;

pub mod event;
pub mod manual_reset_event;
pub mod wait_cell;

pub use event::Event;
pub use manual_reset_event::ManualResetEvent;
pub use wait_cell::WaitCell;

/// Error returned by [`WaitCell`] when the cell was closed while a waiter
/// was registered or attempting to register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(());

impl Closed {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}
