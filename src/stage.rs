//! Worker-pool stages.
//!
//! A [`Stage`] runs `N` identical workers that pull from one input stream,
//! apply a [`Transform`], and push results into one shared output stream.
//! Workers exit independently on end-of-stream, cancellation, or a transform
//! failure; the last worker to exit closes the output.
//!
//! Items handled by different workers may reach the output in any order.
//! Only a single-worker stage preserves input order.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::scope::Scope;
use crate::stream::{channel, Receiver, Sender};

/// A transformation applied to each item flowing through a stage.
///
/// Implementations are shared by every worker of a stage, hence `&self`.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use pipeweld::{Result, Transform};
///
/// struct Double;
///
/// #[async_trait]
/// impl Transform for Double {
///     type Input = i64;
///     type Output = i64;
///
///     async fn apply(&self, item: i64) -> Result<i64> {
///         Ok(item * 2)
///     }
/// }
/// ```
#[async_trait]
pub trait Transform: Send + Sync + 'static {
    /// The type of items this transform accepts
    type Input: Send + 'static;
    /// The type of items this transform produces
    type Output: Send + 'static;

    /// Transform one item. An error cancels the stage's scope.
    async fn apply(&self, item: Self::Input) -> Result<Self::Output>;
}

/// Helper function to create a transform from an async function
pub fn transform_fn<F, Fut, T, U>(f: F) -> FnTransform<F, Fut, T, U>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    FnTransform {
        f,
        _phantom: PhantomData,
    }
}

/// A transform created from an async function
pub struct FnTransform<F, Fut, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> (Fut, U)>,
}

#[async_trait]
impl<F, Fut, T, U> Transform for FnTransform<F, Fut, T, U>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn apply(&self, item: T) -> Result<U> {
        (self.f)(item).await
    }
}

/// A transform that maps items with an infallible function.
pub struct MapTransform<F, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> U>,
}

impl<F, T, U> MapTransform<F, T, U> {
    /// Create a new map transform
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T, U> Transform for MapTransform<F, T, U>
where
    F: Fn(T) -> U + Send + Sync + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn apply(&self, item: T) -> Result<U> {
        Ok((self.f)(item))
    }
}

/// A transform that passes items through unchanged.
pub struct Identity<T> {
    _phantom: PhantomData<fn(T) -> T>,
}

impl<T> Identity<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for Identity<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Transform for Identity<T> {
    type Input = T;
    type Output = T;

    async fn apply(&self, item: T) -> Result<T> {
        Ok(item)
    }
}

/// Shared handle to a pool's output: whichever holder is dropped last
/// closes the stream.
pub(crate) struct LastOut<T> {
    remaining: Arc<AtomicUsize>,
    output: Sender<T>,
}

impl<T> LastOut<T> {
    /// Create `count` handles sharing one countdown over `output`.
    pub(crate) fn split(output: Sender<T>, count: usize) -> Vec<LastOut<T>> {
        let remaining = Arc::new(AtomicUsize::new(count));
        (0..count)
            .map(|_| LastOut {
                remaining: remaining.clone(),
                output: output.clone(),
            })
            .collect()
    }

    pub(crate) fn output(&self) -> &Sender<T> {
        &self.output
    }
}

impl<T> Drop for LastOut<T> {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.output.close();
            trace!("last worker out closed the output stream");
        }
    }
}

/// A pool of workers applying one transform between two streams.
pub struct Stage<X> {
    transform: Arc<X>,
    workers: usize,
    capacity: usize,
    limiter: Option<RateLimiter>,
    name: String,
}

impl<X: Transform> Stage<X> {
    /// Create a stage of `workers` workers (at least one) running `transform`.
    pub fn new(workers: usize, transform: X) -> Self {
        Self {
            transform: Arc::new(transform),
            workers: workers.max(1),
            capacity: 0,
            limiter: None,
            name: "stage".to_string(),
        }
    }

    /// Set the output stream capacity (zero, the default, is rendezvous).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Gate every item through `limiter` before it is transformed.
    pub fn rate_limit(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Name the stage in logs and metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of workers the stage will run.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start the workers as tasks owned by `scope` and return the output stream.
    pub fn spawn(self, scope: &Scope, input: Receiver<X::Input>) -> Receiver<X::Output> {
        let (output, rx) = channel(scope, self.capacity);
        let name: Arc<str> = self.name.into();

        for (id, out) in LastOut::split(output, self.workers).into_iter().enumerate() {
            let worker = Worker {
                id,
                name: name.clone(),
                scope: scope.clone(),
                transform: self.transform.clone(),
                limiter: self.limiter.clone(),
                input: input.clone(),
                out,
            };
            scope.spawn(worker.run());
        }
        rx
    }
}

struct Worker<X: Transform> {
    id: usize,
    name: Arc<str>,
    scope: Scope,
    transform: Arc<X>,
    limiter: Option<RateLimiter>,
    input: Receiver<X::Input>,
    out: LastOut<X::Output>,
}

impl<X: Transform> Worker<X> {
    async fn run(self) -> Result<()> {
        loop {
            let item = match self.input.recv().await {
                Ok(Some(item)) => item,
                Ok(None) | Err(_) => break,
            };
            if self.scope.is_cancelled() {
                break;
            }
            if let Some(limiter) = &self.limiter {
                if limiter.acquire().await.is_err() {
                    break;
                }
            }

            let output = match self.transform.apply(item).await {
                Ok(output) => output,
                Err(err) => {
                    crate::metrics::record_stage_error(&self.name);
                    debug!(stage = %self.name, worker = self.id, error = %err, "transform failed");
                    return Err(err);
                }
            };
            if self.out.output().send(output).await.is_err() {
                break;
            }
            crate::metrics::record_stage_item(&self.name);
        }

        trace!(stage = %self.name, worker = self.id, "worker exiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::generator::Generator;
    use std::time::Duration;
    use tokio::time::Instant;

    async fn drain<T>(rx: &Receiver<T>) -> Vec<T> {
        let mut values = Vec::new();
        while let Some(v) = rx.recv().await.unwrap() {
            values.push(v);
        }
        values
    }

    #[test]
    fn test_last_out_closes_once() {
        let scope = Scope::new();
        let (tx, rx) = channel::<u8>(&scope, 1);
        let mut handles = LastOut::split(tx, 3);

        drop(handles.pop());
        drop(handles.pop());
        assert!(!rx.is_closed());
        drop(handles.pop());
        assert!(rx.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_output_closed_after_all_workers() {
        for workers in 1..=8 {
            let scope = Scope::new();
            let input = Generator::from_values((0..200).collect()).spawn(&scope);
            let output = Stage::new(workers, MapTransform::new(|x: u32| x + 1))
                .capacity(4)
                .spawn(&scope, input);

            let mut values = drain(&output).await;
            values.sort_unstable();
            assert_eq!(values, (1..=200).collect::<Vec<_>>(), "workers = {workers}");
            scope.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let scope = Scope::new();
        let input = Generator::from_values(vec![3, 1, 2]).spawn(&scope);
        let output = Stage::new(1, transform_fn(|x: i32| async move { Ok(x * 10) })).spawn(&scope, input);

        assert_eq!(drain(&output).await, vec![30, 10, 20]);
        scope.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_transform_error_cancels_scope() {
        let scope = Scope::new();
        let input = Generator::from_values((0..100).collect()).spawn(&scope);
        let output = Stage::new(
            4,
            transform_fn(|x: i32| async move {
                if x == 13 {
                    Err(Error::custom("unlucky"))
                } else {
                    Ok(x)
                }
            }),
        )
        .spawn(&scope, input);

        // The output still reaches end-of-stream or cancellation; it never hangs.
        while let Ok(Some(_)) = output.recv().await {}

        let err = scope.wait().await.unwrap_err();
        assert!(matches!(err, Error::Custom(ref m) if m == "unlucky"));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_workers_mid_send() {
        let scope = Scope::new();
        let input = Generator::repeat(vec![1u8]).capacity(8).spawn(&scope);
        // Nobody reads the rendezvous output, so every worker parks in send.
        let _output = Stage::new(4, Identity::new()).spawn(&scope, input);
        tokio::time::sleep(Duration::from_millis(20)).await;

        scope.cancel_with(Error::custom("E"));
        let err = tokio::time::timeout(Duration::from_secs(1), scope.wait())
            .await
            .expect("workers did not unblock")
            .unwrap_err();
        assert!(matches!(err, Error::Custom(ref m) if m == "E"));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_workers_mid_receive() {
        let scope = Scope::new();
        let (_tx, input) = channel::<u8>(&scope, 0);
        let output = Stage::new(3, Identity::new()).spawn(&scope, input);
        tokio::task::yield_now().await;

        scope.cancel_with(Error::custom("E"));
        let err = tokio::time::timeout(Duration::from_secs(1), scope.wait())
            .await
            .expect("workers did not unblock")
            .unwrap_err();
        assert!(matches!(err, Error::Custom(ref m) if m == "E"));
        // Every worker exited, so the output was closed.
        assert!(output.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_stage() {
        let scope = Scope::new();
        let limiter = RateLimiter::new(&scope, Duration::from_millis(50), 2);
        let input = Generator::from_values(vec![1, 2, 3, 4]).spawn(&scope);
        let output = Stage::new(2, Identity::new())
            .rate_limit(limiter)
            .capacity(4)
            .spawn(&scope, input);

        let start = Instant::now();
        assert_eq!(drain(&output).await.len(), 4);
        // Two from the burst, then one per 50ms.
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        scope.wait().await.unwrap();
    }
}
