//! Completion signals and the `or` combinator.
//!
//! A [`Signal`] is a one-way, broadcast "done" notification: it fires at most
//! once, and every clone observes the firing. [`or`] folds many signals into
//! one that fires as soon as any input does.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use futures::future::select_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A broadcast completion signal.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
}

impl Signal {
    /// Create a signal that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal nobody else can fire.
    pub fn never() -> Self {
        Self::default()
    }

    /// A signal that fires once `delay` has elapsed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn after(delay: Duration) -> Self {
        let signal = Self::new();
        let timer = signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => timer.fire(),
                _ = timer.fired() => {}
            }
        });
        signal
    }

    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Fire the signal. Firing more than once has no further effect.
    pub fn fire(&self) {
        self.token.cancel();
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has fired.
    pub fn fired(&self) -> impl Future<Output = ()> + Send + '_ {
        self.token.cancelled()
    }
}

/// Signals waited on directly by one level of the `or` tree; the remainder is
/// folded into the next level's signal.
const OR_FAN_IN: usize = 3;

/// Combine `signals` into one signal that fires as soon as any of them does.
///
/// With no inputs the result never fires; a single input is returned
/// unchanged. Otherwise each level of the combinator waits on at most
/// `OR_FAN_IN` inputs plus one signal standing for the rest. Once the
/// result fires, every waiter in the tree is released.
///
/// Must be called from within a Tokio runtime when given two or more signals.
pub fn or<I>(signals: I) -> Signal
where
    I: IntoIterator<Item = Signal>,
{
    or_tree(signals.into_iter().collect(), &mut Vec::new())
}

fn or_tree(signals: Vec<Signal>, waiters: &mut Vec<JoinHandle<()>>) -> Signal {
    let mut pending: VecDeque<Signal> = signals.into();
    match pending.len() {
        0 => return Signal::never(),
        1 => return pending.pop_front().unwrap_or_default(),
        _ => {}
    }

    let combined = Signal::new();
    let mut level = combined.clone();
    loop {
        let head: Vec<Signal> = pending.drain(..pending.len().min(OR_FAN_IN)).collect();

        // Each level's signal rides along in the remainder so that deeper
        // levels are released as soon as it resolves.
        let tail = (!pending.is_empty()).then(|| {
            pending.push_back(level.clone());
            Signal::new()
        });

        let fire = level.clone();
        let next = tail.clone();
        waiters.push(tokio::spawn(async move {
            let waits = head
                .iter()
                .chain(next.iter())
                .map(|s| Box::pin(s.fired()));
            select_all(waits).await;
            fire.fire();
        }));

        match tail {
            Some(tail) => level = tail,
            None => return combined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn signals(n: usize) -> Vec<Signal> {
        (0..n).map(|_| Signal::new()).collect()
    }

    #[tokio::test]
    async fn test_or_of_nothing_never_fires() {
        let combined = or(Vec::new());
        let waited = tokio::time::timeout(Duration::from_millis(20), combined.fired()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_or_of_one_is_identity() {
        let input = Signal::new();
        let combined = or([input.clone()]);
        input.fire();
        assert!(combined.is_fired());
    }

    #[tokio::test]
    async fn test_or_fires_on_any_input() {
        for n in [2, 3, 4, 7, 20, 100] {
            for which in [0, n / 2, n - 1] {
                let inputs = signals(n);
                let combined = or(inputs.clone());
                assert!(!combined.is_fired());

                inputs[which].fire();
                tokio::time::timeout(Duration::from_secs(1), combined.fired())
                    .await
                    .unwrap_or_else(|_| panic!("or({n}) did not fire for input {which}"));
            }
        }
    }

    #[tokio::test]
    async fn test_or_releases_every_waiter() {
        for n in [2, 5, 16, 64] {
            let inputs = signals(n);
            let mut waiters = Vec::new();
            let combined = or_tree(inputs.clone(), &mut waiters);

            inputs[0].fire();
            combined.fired().await;

            for waiter in waiters {
                tokio::time::timeout(Duration::from_secs(1), waiter)
                    .await
                    .expect("waiter left blocked after or resolved")
                    .unwrap();
            }
            // Inputs that never fired are untouched.
            assert!(inputs[1..].iter().all(|s| !s.is_fired()));
        }
    }

    #[tokio::test]
    async fn test_or_of_many_signals() {
        let inputs = signals(100_000);
        let combined = or(inputs.clone());

        inputs[inputs.len() - 1].fire();
        tokio::time::timeout(Duration::from_secs(5), combined.fired())
            .await
            .expect("or over many inputs did not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn test_or_resolves_with_earliest_timer() {
        let start = Instant::now();
        let combined = or([
            Signal::after(Duration::from_secs(60 * 60 * 2)),
            Signal::after(Duration::from_secs(60 * 5)),
            Signal::after(Duration::from_secs(1)),
            Signal::after(Duration::from_secs(60 * 60)),
            Signal::after(Duration::from_secs(60)),
        ]);
        combined.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
