//! Pipeline assembly.
//!
//! A [`Pipeline`] is a convenience wrapper over the lower-level pieces: it
//! owns one [`Scope`], a stream head, and the configuration used to size the
//! stages appended to it. Every stage runs as tasks of that scope, and the
//! reducers ([`Pipeline::reduce`], [`Pipeline::collect`],
//! [`Pipeline::for_each`]) drain the final stream and then wait for every task
//! to finish, returning the first recorded failure.
//!
//! ```rust
//! use pipeweld::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let scope = Scope::new();
//! let squares = Pipeline::builder()
//!     .workers(4)
//!     .source(&scope, &Generator::from_values((1..=5).collect()))
//!     .map(|x: u64| x * x)
//!     .collect()
//!     .await?;
//!
//! assert_eq!(squares.iter().sum::<u64>(), 55);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use futures_core::Stream;
use tracing::debug;

use crate::combinators;
use crate::error::Result;
use crate::generator::{self, Generator};
use crate::limiter::RateLimiter;
use crate::scope::Scope;
use crate::stage::{transform_fn, Identity, MapTransform, Stage, Transform};
use crate::stream::{Receiver, Sender};

/// Configuration for pipeline execution
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineConfig {
    /// Capacity of the streams between stages
    pub buffer_size: usize,
    /// Number of workers per stage
    pub workers: usize,
    /// Overall time limit; the pipeline scope is cancelled with
    /// `DeadlineExceeded` once it elapses
    pub timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16,
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            timeout: None,
        }
    }
}

/// Builder that configures a pipeline before its source starts.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from an existing configuration
    pub fn with_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Set the capacity of the streams between stages
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the number of workers per stage
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    /// Set an overall time limit
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start a fresh run of `generator` in a scope derived from `parent`.
    pub fn source<T>(self, parent: &Scope, generator: &Generator<T>) -> Pipeline<T>
    where
        T: Send + 'static,
    {
        let scope = self.derive(parent);
        let stream = generator
            .clone()
            .capacity(self.config.buffer_size)
            .spawn(&scope);
        Pipeline::new(scope, self.config, stream)
    }

    /// Run a one-shot producer function as the pipeline's source.
    pub fn generate<T, F, Fut>(self, parent: &Scope, producer: F) -> Pipeline<T>
    where
        T: Send + 'static,
        F: FnOnce(Sender<T>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let scope = self.derive(parent);
        let stream = generator::generate(&scope, self.config.buffer_size, producer);
        Pipeline::new(scope, self.config, stream)
    }

    /// Use an async stream as the pipeline's source.
    pub fn from_stream<T, S>(self, parent: &Scope, source: S) -> Pipeline<T>
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
    {
        let scope = self.derive(parent);
        let stream = generator::from_stream(&scope, self.config.buffer_size, source);
        Pipeline::new(scope, self.config, stream)
    }

    fn derive(&self, parent: &Scope) -> Scope {
        match self.config.timeout {
            Some(timeout) => parent.child_with_timeout(timeout),
            None => parent.child(),
        }
    }
}

/// A running chain of stages ending in a stream of `T`.
#[derive(Debug)]
pub struct Pipeline<T> {
    scope: Scope,
    config: PipelineConfig,
    stream: Receiver<T>,
}

impl Pipeline<()> {
    /// Start configuring a new pipeline
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }
}

impl<T: Send + 'static> Pipeline<T> {
    fn new(scope: Scope, config: PipelineConfig, stream: Receiver<T>) -> Self {
        Self {
            scope,
            config,
            stream,
        }
    }

    /// Start a pipeline from `generator` with the default configuration.
    pub fn from_generator(parent: &Scope, generator: &Generator<T>) -> Self {
        PipelineBuilder::new().source(parent, generator)
    }

    /// The scope owning every task of this pipeline.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Append a stage running `transform` on the configured number of workers.
    pub fn stage<X>(self, transform: X) -> Pipeline<X::Output>
    where
        X: Transform<Input = T>,
    {
        let stage = Stage::new(self.config.workers, transform);
        self.stage_with(stage)
    }

    /// Append a preconfigured stage. Its output capacity is set from the
    /// pipeline's buffer size.
    pub fn stage_with<X>(self, stage: Stage<X>) -> Pipeline<X::Output>
    where
        X: Transform<Input = T>,
    {
        let stream = stage
            .capacity(self.config.buffer_size)
            .spawn(&self.scope, self.stream);
        Pipeline::new(self.scope, self.config, stream)
    }

    /// Append a stage mapping every item through `f`.
    pub fn map<U, F>(self, f: F) -> Pipeline<U>
    where
        F: Fn(T) -> U + Send + Sync + 'static,
        U: Send + 'static,
    {
        self.stage(MapTransform::new(f))
    }

    /// Append a stage running a fallible async function on every item.
    pub fn and_then<U, F, Fut>(self, f: F) -> Pipeline<U>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
        U: Send + 'static,
    {
        self.stage(transform_fn(f))
    }

    /// Gate items through `limiter` on a single worker, preserving order.
    pub fn throttle(self, limiter: RateLimiter) -> Pipeline<T> {
        let stage = Stage::new(1, Identity::new())
            .rate_limit(limiter)
            .name("throttle");
        self.stage_with(stage)
    }

    /// Keep at most the first `n` items.
    pub fn take(self, n: usize) -> Pipeline<T> {
        let stream = combinators::take(&self.scope, self.stream, n);
        Pipeline::new(self.scope, self.config, stream)
    }

    /// Give up the pipeline and keep its output stream.
    pub fn into_receiver(self) -> Receiver<T> {
        self.stream
    }

    /// Cancel every stage of the pipeline.
    pub fn cancel(&self) -> bool {
        self.scope.cancel()
    }

    /// Fold every output item into an accumulator.
    ///
    /// Returns the first error recorded by the pipeline's scope, if any, once
    /// every stage has stopped.
    pub async fn reduce<A, F>(self, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, T) -> A,
    {
        let mut acc = init;
        while let Ok(Some(item)) = self.stream.recv().await {
            acc = f(acc, item);
        }
        self.finish().await?;
        Ok(acc)
    }

    /// Collect every output item.
    pub async fn collect(self) -> Result<Vec<T>> {
        self.reduce(Vec::new(), |mut items, item| {
            items.push(item);
            items
        })
        .await
    }

    /// Run an async function on every output item. An error cancels the
    /// pipeline.
    pub async fn for_each<F, Fut>(self, mut f: F) -> Result<()>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while let Ok(Some(item)) = self.stream.recv().await {
            if let Err(err) = f(item).await {
                self.scope.cancel_with(err);
                break;
            }
        }
        self.finish().await
    }

    async fn finish(self) -> Result<()> {
        let Pipeline { scope, stream, .. } = self;
        drop(stream);
        let result = scope.wait().await;
        if let Err(err) = &result {
            debug!(error = %err, "pipeline stopped");
        }
        result
    }
}
