//! Errors returned when joining tasks.

use core::any::Any;
use core::fmt;
use std::sync::PoisonError;

use crate::loom::sync::{Arc, Mutex};

/// Error returned when awaiting a [`Task`](crate::Task) or
/// [`SharedTask`](crate::SharedTask) that did not run to completion.
#[derive(Debug, Clone)]
pub enum JoinError {
    /// The handle was never attached to a computation, either because it was
    /// default-constructed or because the computation was moved out of it.
    BrokenPromise,
    /// The computation panicked instead of returning a value.
    ///
    /// The captured panic payload travels with the error and can be resumed
    /// with [`JoinError::into_panic`].
    Panicked(PanicPayload),
}

impl JoinError {
    pub(crate) fn panicked(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self::Panicked(PanicPayload::new(payload))
    }

    /// Returns `true` if the computation panicked.
    #[inline]
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Returns `true` if the handle had no computation to run.
    #[inline]
    #[must_use]
    pub fn is_broken_promise(&self) -> bool {
        matches!(self, Self::BrokenPromise)
    }

    /// Consumes the error, returning the panic payload if the computation
    /// panicked and the payload has not been claimed yet.
    ///
    /// When the computation is shared, every observer sees the same payload
    /// but only one of them can claim it.
    #[must_use]
    pub fn try_into_panic(self) -> Option<Box<dyn Any + Send + 'static>> {
        match self {
            Self::BrokenPromise => None,
            Self::Panicked(payload) => payload.take(),
        }
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error is not [`JoinError::Panicked`] or if the payload
    /// was already claimed through another clone of this error.
    #[must_use]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.try_into_panic()
            .expect("`JoinError` does not carry a panic payload")
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokenPromise => f.pad("broken promise"),
            Self::Panicked(_) => f.pad("task panicked"),
        }
    }
}

impl core::error::Error for JoinError {}

/// A panic payload captured from a task body.
///
/// Clones of this value share the payload, so it can ride along every
/// [`JoinError`] handed to the awaiters of a shared computation.
#[derive(Clone)]
pub struct PanicPayload(Arc<Mutex<Option<Box<dyn Any + Send + 'static>>>>);

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self(Arc::new(Mutex::new(Some(payload))))
    }

    /// Claims the payload, leaving `None` behind for every other clone.
    #[must_use]
    pub fn take(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicPayload").finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;

    fn payload_of(msg: &'static str) -> JoinError {
        JoinError::panicked(Box::new(msg))
    }

    #[test]
    fn broken_promise_display() {
        let err = JoinError::BrokenPromise;
        assert!(err.is_broken_promise());
        assert!(!err.is_panic());
        assert_eq!(err.to_string(), "broken promise");
        assert!(err.try_into_panic().is_none());
    }

    #[test]
    fn panic_payload_claimed_once() {
        let err = payload_of("boom");
        let twin = err.clone();

        let payload = err.into_panic();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");

        // The payload travels with the clone but was already claimed.
        assert!(twin.is_panic());
        assert!(twin.try_into_panic().is_none());
    }
}
