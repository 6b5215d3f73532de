//! # Bounded, cancellable data pipelines for tokio
//!
//! This crate runs producer → stage(s) → reducer chains with bounded
//! parallelism, backpressure, and cooperative cancellation.
//!
//! ## Core Concepts
//!
//! - **Scope**: a cancellation and error-aggregation context. Scopes form a
//!   tree; cancelling a scope cancels its descendants, and the first recorded
//!   cause wins.
//! - **Stream**: a bounded conduit between stages with explicit end-of-stream.
//!   Every blocking send and receive also gives up when its scope is cancelled.
//! - **Stage**: a pool of workers applying one [`Transform`] between two
//!   streams. The last worker to exit closes the output.
//! - **Generator**: a lazy, restartable, possibly infinite producer.
//! - **RateLimiter**: a token bucket with a burst allowance.
//! - **Signal**: a one-shot completion signal; [`signal::or`] races many.
//!
//! ## Example
//!
//! ```rust
//! use pipeweld::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scope = Scope::new();
//!
//!     let words = repeat(&scope, vec!["a", "b"]);
//!     let first = take(&scope, words, 5);
//!     let loud = Stage::new(2, MapTransform::new(|s: &'static str| s.to_uppercase()))
//!         .spawn(&scope, first);
//!
//!     let mut count = 0;
//!     while let Some(word) = loud.recv().await? {
//!         assert!(word == "A" || word == "B");
//!         count += 1;
//!     }
//!     assert_eq!(count, 5);
//!
//!     scope.wait().await
//! }
//! ```

pub mod combinators;
pub mod error;
pub mod generator;
pub mod limiter;
pub mod pipeline;
pub mod scope;
pub mod signal;
pub mod stage;
pub mod stream;
pub mod util;

mod metrics;

// Re-export commonly used items
pub mod prelude {
    pub use crate::combinators::{merge, take};
    pub use crate::error::{Error, IntoError, Result};
    pub use crate::generator::{from_stream, generate, repeat, Generator};
    pub use crate::limiter::RateLimiter;
    pub use crate::pipeline::{Pipeline, PipelineBuilder, PipelineConfig};
    pub use crate::scope::Scope;
    pub use crate::signal::{or, Signal};
    pub use crate::stage::{transform_fn, Identity, MapTransform, Stage, Transform};
    pub use crate::stream::{channel, Receiver, Sender};
    pub use crate::util::CancellableExt;
}

pub use error::{Error, Result};
pub use scope::Scope;
pub use signal::Signal;
pub use stage::Transform;
pub use stream::{channel, Receiver, Sender};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
