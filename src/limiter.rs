//! Token-bucket admission control.
//!
//! A [`RateLimiter`] starts with a full bucket of `burst` tokens and regains
//! one token per `interval`, never holding more than `burst`. Each admitted
//! item consumes one token; requesters block while the bucket is empty. The
//! result is "`burst` admissions immediately, then one per `interval`".

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::error::{Error, Result};
use crate::scope::Scope;

/// A token-bucket rate limiter bound to a scope.
///
/// Clones share the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<Semaphore>>,
    scope: Scope,
    interval: Duration,
    burst: usize,
}

impl RateLimiter {
    /// Create a limiter admitting `burst` items at once and one more per
    /// `interval` thereafter.
    ///
    /// A `burst` of zero is treated as one. An `interval` of zero disables
    /// throttling entirely. The refill ticker lives until `scope` is cancelled
    /// or every clone of the limiter is dropped. Must be called from within a
    /// Tokio runtime.
    pub fn new(scope: &Scope, interval: Duration, burst: usize) -> Self {
        let burst = burst.max(1);
        let bucket = (!interval.is_zero()).then(|| {
            let bucket = Arc::new(Semaphore::new(burst));
            spawn_refill(scope, Arc::downgrade(&bucket), interval, burst);
            bucket
        });

        Self {
            bucket,
            scope: scope.clone(),
            interval,
            burst,
        }
    }

    /// Create a limiter from a steady rate in items per second.
    pub fn per_second(scope: &Scope, rate: u32, burst: usize) -> Self {
        let interval = if rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / rate
        };
        Self::new(scope, interval, burst)
    }

    /// Wait for a token.
    ///
    /// Fails with [`Error::Cancelled`] if the scope is cancelled before a
    /// token becomes available.
    pub async fn acquire(&self) -> Result<()> {
        let Some(bucket) = &self.bucket else {
            return self.admit();
        };
        if self.scope.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(Error::Cancelled),
            permit = bucket.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    self.admit()
                }
                Err(_) => Err(Error::Cancelled),
            },
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        if self.scope.is_cancelled() {
            return false;
        }
        let admitted = match &self.bucket {
            None => true,
            Some(bucket) => match bucket.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
        };
        if admitted {
            crate::metrics::record_admission();
        }
        admitted
    }

    fn admit(&self) -> Result<()> {
        crate::metrics::record_admission();
        Ok(())
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> usize {
        self.bucket
            .as_ref()
            .map_or(self.burst, |bucket| bucket.available_permits())
    }

    /// The refill interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The bucket capacity.
    pub fn burst(&self) -> usize {
        self.burst
    }
}

fn spawn_refill(scope: &Scope, bucket: Weak<Semaphore>, period: Duration, burst: usize) {
    let scope = scope.clone();
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(bucket) = bucket.upgrade() else {
                break;
            };
            // Only this task adds permits, so the check cannot race upward.
            if bucket.available_permits() < burst {
                bucket.add_permits(1);
            }
        }
        trace!("rate limiter refill stopped");
    });
}
