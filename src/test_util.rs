// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Increments the shared counter when dropped.
///
/// Every instance counts, including clones, so a test that must observe
/// "destroyed exactly once" should avoid cloning the guard.
#[derive(Debug)]
pub(crate) struct DropGuard {
    drops: Arc<AtomicUsize>,
}

impl DropGuard {
    pub(crate) fn new() -> (Self, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (
            Self {
                drops: drops.clone(),
            },
            drops,
        )
    }
}

impl Clone for DropGuard {
    fn clone(&self) -> Self {
        Self {
            drops: self.drops.clone(),
        }
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
