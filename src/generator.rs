//! Lazy value producers.
//!
//! A [`Generator`] is a restartable recipe for a sequence of values: every
//! call to [`Generator::spawn`] starts a fresh, independent producer task in
//! the given scope and returns the stream it writes to. No cursor is shared
//! between runs. [`generate`] and [`from_stream`] are one-shot producers.
//!
//! Producers stop when their sequence ends, when the scope is cancelled, or
//! when every receiver of their output is dropped, and they always close their
//! output on the way out.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_core::Stream;
use tokio_stream::StreamExt;
use tracing::trace;

use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::stream::{channel, Receiver, Sender};
use crate::util::CancellableExt;

type Values<T> = Box<dyn Iterator<Item = T> + Send>;

/// A restartable producer of values.
pub struct Generator<T> {
    make: Arc<dyn Fn() -> Values<T> + Send + Sync>,
    infinite: bool,
    capacity: usize,
}

impl<T: Send + 'static> Generator<T> {
    /// Cycle through `values` forever, in order.
    ///
    /// An empty `values` produces an empty sequence.
    pub fn repeat(values: Vec<T>) -> Self
    where
        T: Clone + Sync,
    {
        let values: Arc<[T]> = values.into();
        let infinite = !values.is_empty();
        let mut generator = Self::from_iter_fn(move || {
            let values = values.clone();
            (0..values.len()).cycle().map(move |i| values[i].clone())
        });
        generator.infinite = infinite;
        generator
    }

    /// Produce `f()` forever.
    pub fn repeat_with<F>(f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut generator = Self::from_iter_fn(move || {
            let f = f.clone();
            std::iter::repeat_with(move || f())
        });
        generator.infinite = true;
        generator
    }

    /// Produce each of `values` once.
    pub fn from_values(values: Vec<T>) -> Self
    where
        T: Clone + Sync,
    {
        let values: Arc<[T]> = values.into();
        Self::from_iter_fn(move || {
            let values = values.clone();
            (0..values.len()).map(move |i| values[i].clone())
        })
    }

    /// Build a generator from an iterator factory, called once per run.
    pub fn from_iter_fn<F, I>(make: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            make: Arc::new(move || Box::new(make().into_iter()) as Values<T>),
            infinite: false,
            capacity: 0,
        }
    }

    /// Set the output stream capacity (zero, the default, is rendezvous).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Whether the sequence never ends on its own.
    pub fn is_infinite(&self) -> bool {
        self.infinite
    }

    /// Start a fresh run of the sequence as a task owned by `scope`.
    pub fn spawn(&self, scope: &Scope) -> Receiver<T> {
        let (tx, rx) = channel(scope, self.capacity);
        let values = (self.make)();
        scope.spawn(async move {
            for value in values {
                if tx.send(value).await.is_err() {
                    break;
                }
            }
            tx.close();
            trace!("generator finished");
            Ok(())
        });
        rx
    }
}

impl<T> Clone for Generator<T> {
    fn clone(&self) -> Self {
        Self {
            make: self.make.clone(),
            infinite: self.infinite,
            capacity: self.capacity,
        }
    }
}

impl<T> fmt::Debug for Generator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("infinite", &self.infinite)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Stream that cycles through `values` until `scope` is cancelled or the
/// consumer goes away.
pub fn repeat<T>(scope: &Scope, values: Vec<T>) -> Receiver<T>
where
    T: Clone + Send + Sync + 'static,
{
    Generator::repeat(values).spawn(scope)
}

/// Run a one-shot producer function as a task owned by `scope`.
///
/// The producer owns the [`Sender`]; the stream closes when the producer
/// closes it or returns. A producer error cancels the scope with that error.
/// A producer that stops because every receiver is gone (for example by
/// propagating a failed send with `?`) is treated as finished, not failed.
pub fn generate<T, F, Fut>(scope: &Scope, capacity: usize, producer: F) -> Receiver<T>
where
    T: Send + 'static,
    F: FnOnce(Sender<T>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = channel(scope, capacity);
    let run = producer(tx);
    scope.spawn(async move {
        match run.await {
            Err(Error::Disconnected) => Ok(()),
            other => other,
        }
    });
    rx
}

/// Feed the values of an async stream into a pipeline stream.
pub fn from_stream<T, S>(scope: &Scope, capacity: usize, stream: S) -> Receiver<T>
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    generate(scope, capacity, |tx| async move {
        let scope = tx.scope().clone();
        tokio::pin!(stream);
        while let Some(value) = stream.next().within(&scope).await? {
            tx.send(value).await?;
        }
        Ok(())
    })
}
