//! Hierarchical cancellation scopes.
//!
//! A [`Scope`] is a node in a cancellation tree. Cancelling a scope records a
//! cause (first writer wins), cancels every descendant with the same cause and
//! wakes everything suspended on it. Scopes also act as task groups: work
//! spawned with [`Scope::spawn`] is awaited by [`Scope::wait`], and the first
//! task to fail cancels the scope for its siblings.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::{Error, Result};
use crate::signal::Signal;

/// A cancellation, deadline and error-aggregation context.
///
/// Cloning a `Scope` yields another handle to the same node.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    parent: Option<Weak<Inner>>,
    deadline: Option<Instant>,
    state: Mutex<State>,
    tasks: TaskTracker,
}

#[derive(Default)]
struct State {
    cause: Option<Error>,
    /// Owned: an intermediate scope stays reachable from its parent for as
    /// long as anything below it is alive.
    children: Vec<Arc<Inner>>,
    timer: Option<AbortHandle>,
}

impl Inner {
    fn new(token: CancellationToken, parent: Option<Weak<Inner>>, deadline: Option<Instant>) -> Self {
        // Closed up front so `wait` resolves whenever no task is running.
        let tasks = TaskTracker::new();
        tasks.close();
        Self {
            token,
            parent,
            deadline,
            state: Mutex::new(State::default()),
            tasks,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl Scope {
    /// Create a root scope with no deadline.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(CancellationToken::new(), None, None)),
        }
    }

    /// Create a root scope that cancels itself with
    /// [`Error::DeadlineExceeded`] after `timeout`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Create a root scope that cancels itself at `deadline`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_deadline(deadline: Instant) -> Self {
        let scope = Self {
            inner: Arc::new(Inner::new(CancellationToken::new(), None, Some(deadline))),
        };
        scope.arm_timer(deadline);
        scope
    }

    /// Derive a child scope.
    ///
    /// The child is cancelled whenever this scope is, with the same cause,
    /// but can be cancelled on its own without affecting this scope or its
    /// siblings.
    pub fn child(&self) -> Scope {
        self.derive(None)
    }

    /// Derive a child scope that additionally expires after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Scope {
        self.derive(Some(Instant::now() + timeout))
    }

    /// Derive a child scope that additionally expires at `deadline`.
    ///
    /// The effective deadline never exceeds this scope's own deadline.
    pub fn child_with_deadline(&self, deadline: Instant) -> Scope {
        self.derive(Some(deadline))
    }

    fn derive(&self, requested: Option<Instant>) -> Scope {
        let deadline = match (self.inner.deadline, requested) {
            (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
        let child = Scope {
            inner: Arc::new(Inner::new(
                self.inner.token.child_token(),
                Some(Arc::downgrade(&self.inner)),
                deadline,
            )),
        };

        let inherited = {
            let mut state = self.inner.state();
            match &state.cause {
                Some(cause) => Some(cause.clone()),
                None => {
                    state.children.retain(is_live);
                    state.children.push(child.inner.clone());
                    None
                }
            }
        };

        if let Some(cause) = inherited {
            child.cancel_with(cause);
        } else if let Some(deadline) = deadline {
            child.arm_timer(deadline);
        }
        child
    }

    fn arm_timer(&self, deadline: Instant) {
        let scope = Arc::downgrade(&self.inner);
        let token = self.inner.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(inner) = scope.upgrade() {
                        debug!("scope deadline elapsed");
                        Scope { inner }.cancel_with(Error::DeadlineExceeded);
                    }
                }
                _ = token.cancelled() => {}
            }
        });

        let mut state = self.inner.state();
        if state.cause.is_some() {
            handle.abort();
        } else {
            state.timer = Some(handle.abort_handle());
        }
    }

    fn release_timer(&self) {
        if let Some(timer) = self.inner.state().timer.take() {
            timer.abort();
        }
    }

    /// Cancel the scope with [`Error::Cancelled`] as the cause.
    pub fn cancel(&self) -> bool {
        self.cancel_with(Error::Cancelled)
    }

    /// Cancel the scope and every descendant, recording `cause`.
    ///
    /// Returns `true` if this call performed the cancellation. Later calls
    /// are no-ops and never replace the recorded cause.
    pub fn cancel_with(&self, cause: Error) -> bool {
        let (children, timer) = {
            let mut state = self.inner.state();
            if state.cause.is_some() {
                return false;
            }
            state.cause = Some(cause.clone());
            (std::mem::take(&mut state.children), state.timer.take())
        };
        debug!(cause = %cause, "scope cancelled");

        for child in children {
            Scope { inner: child }.cancel_with(cause.clone());
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        self.inner.token.cancel();
        true
    }

    /// Whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + '_ {
        self.inner.token.cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// A broadcast signal that fires when the scope is cancelled.
    ///
    /// Firing the returned signal by hand does not cancel the scope.
    pub fn done(&self) -> Signal {
        Signal::from_token(self.inner.token.child_token())
    }

    /// The recorded cancellation cause, if any.
    ///
    /// A cancelled scope always reports a cause; [`Error::Cancelled`] stands
    /// in if none was recorded.
    pub fn err(&self) -> Option<Error> {
        let cause = self.inner.state().cause.clone();
        cause.or_else(|| self.is_cancelled().then_some(Error::Cancelled))
    }

    /// The effective deadline of this scope.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// The parent scope, if this scope was derived and the parent is still alive.
    pub fn parent(&self) -> Option<Scope> {
        self.inner.parent.as_ref()?.upgrade().map(|inner| Scope { inner })
    }

    /// Cancel this scope once `signal` completes.
    ///
    /// Typical use is tearing down request-scoped work when a client
    /// disconnects. The watcher is released if the scope is cancelled first.
    pub fn cancel_on<F>(&self, signal: F)
    where
        F: Future + Send + 'static,
    {
        let scope = Arc::downgrade(&self.inner);
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal => {
                    if let Some(inner) = scope.upgrade() {
                        Scope { inner }.cancel();
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Spawn a task owned by this scope.
    ///
    /// If the task returns an error or panics, the scope is cancelled with
    /// that error (unless a cause was already recorded). Must be called from
    /// within a Tokio runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let scope = self.clone();
        self.inner.tasks.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(Error::Panicked(panic_message(panic.as_ref()))),
            };
            if let Err(err) = &result {
                scope.cancel_with(err.clone());
            }
        });
    }

    /// Wait for every task spawned into this scope to finish.
    ///
    /// Returns the first recorded cause if the scope was cancelled (by a
    /// failing task, an explicit cancel, a deadline or an ancestor), and
    /// `Ok(())` otherwise. Errors from tasks that failed after the first are
    /// discarded: the scope already holds the canonical cause. Completing
    /// the wait releases the deadline timer.
    ///
    /// Any number of handles may wait at once, and every one of them sees the
    /// same outcome. The wait is cancel-safe: dropping it (for example under
    /// `tokio::time::timeout`) leaves the scope's tasks running.
    pub async fn wait(&self) -> Result<()> {
        self.inner.tasks.wait().await;
        self.release_timer();

        match self.err() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}

/// A child is worth keeping while some handle other than its parent's list
/// refers to it, or while it still owns live children of its own.
fn is_live(child: &Arc<Inner>) -> bool {
    if Arc::strong_count(child) > 1 {
        return true;
    }
    let mut state = child.state();
    state.children.retain(is_live);
    !state.children.is_empty()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
