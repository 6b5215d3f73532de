//! Utility functions and helper types.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::error::{Error, Result};
use crate::scope::Scope;

/// A future that gives up with [`Error::Cancelled`] once a scope is cancelled.
///
/// Cancellation is checked before the inner future on every poll, so a
/// future that becomes ready in the same instant the scope is cancelled
/// still reports cancellation.
pub struct Cancellable<F> {
    future: F,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<F> Cancellable<F> {
    /// Wrap `future` so that it races against `scope`.
    pub fn new(future: F, scope: &Scope) -> Self {
        Self {
            future,
            cancelled: Box::pin(scope.token().clone().cancelled_owned()),
        }
    }
}

impl<F> Future for Cancellable<F>
where
    F: Future + Unpin,
{
    type Output = Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(Error::Cancelled));
        }

        match Pin::new(&mut self.future).poll(cx) {
            Poll::Ready(output) => Poll::Ready(Ok(output)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Extension trait for racing futures against a scope
pub trait CancellableExt: Future + Sized {
    /// Resolve to `Err(Error::Cancelled)` if `scope` is cancelled first.
    fn within(self, scope: &Scope) -> Cancellable<Pin<Box<Self>>> {
        Cancellable::new(Box::pin(self), scope)
    }
}

impl<F: Future> CancellableExt for F {}
