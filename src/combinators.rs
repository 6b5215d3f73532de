//! Stream combinators.

use tracing::trace;

use crate::scope::Scope;
use crate::stage::LastOut;
use crate::stream::{channel, Receiver};

/// Forward at most `n` values from `source`, then close the returned stream.
///
/// Fewer values are forwarded if `source` ends or `scope` is cancelled
/// first. `source` itself is never closed; it is simply dropped, which lets
/// an upstream producer with no other consumers wind down.
pub fn take<T: Send + 'static>(scope: &Scope, source: Receiver<T>, n: usize) -> Receiver<T> {
    let (tx, rx) = channel(scope, source.capacity());
    scope.spawn(async move {
        for _ in 0..n {
            let value = match source.recv().await {
                Ok(Some(value)) => value,
                Ok(None) | Err(_) => break,
            };
            if tx.send(value).await.is_err() {
                break;
            }
        }
        tx.close();
        Ok(())
    });
    rx
}

/// Fan several streams into one.
///
/// Values from one source keep their relative order; values from different
/// sources interleave arbitrarily. The merged stream closes once every
/// source has ended.
pub fn merge<T: Send + 'static>(scope: &Scope, sources: Vec<Receiver<T>>) -> Receiver<T> {
    let capacity = sources.iter().map(Receiver::capacity).max().unwrap_or(0);
    let (tx, rx) = channel(scope, capacity);
    if sources.is_empty() {
        tx.close();
        return rx;
    }

    let outs = LastOut::split(tx, sources.len());
    for (index, (source, out)) in sources.into_iter().zip(outs).enumerate() {
        scope.spawn(async move {
            while let Ok(Some(value)) = source.recv().await {
                if out.output().send(value).await.is_err() {
                    break;
                }
            }
            trace!(source = index, "merge input finished");
            Ok(())
        });
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::generator::{repeat, Generator};

    async fn drain<T>(rx: &Receiver<T>) -> Vec<T> {
        let mut values = Vec::new();
        while let Some(v) = rx.recv().await.unwrap() {
            values.push(v);
        }
        values
    }

    #[tokio::test]
    async fn test_take_of_repeat() {
        let scope = Scope::new();
        let taken = take(&scope, repeat(&scope, vec!["a", "b"]), 5);

        assert_eq!(drain(&taken).await, vec!["a", "b", "a", "b", "a"]);
        // The repeat producer winds down once take lets go of it.
        scope.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_short_source() {
        let scope = Scope::new();
        let source = Generator::from_values(vec![1, 2]).spawn(&scope);
        let taken = take(&scope, source, 10);

        assert_eq!(drain(&taken).await, vec![1, 2]);
        scope.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_zero() {
        let scope = Scope::new();
        let taken = take(&scope, repeat(&scope, vec![1]), 0);
        assert_eq!(taken.recv().await.unwrap(), None);
        scope.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_stops_on_cancel() {
        let scope = Scope::new();
        let (_tx, source) = channel::<u8>(&scope, 0);
        let taken = take(&scope, source, 3);

        scope.cancel_with(Error::custom("halt"));
        assert!(matches!(taken.recv().await, Ok(None) | Err(Error::Cancelled)));
        let err = scope.wait().await.unwrap_err();
        assert!(matches!(err, Error::Custom(ref m) if m == "halt"));
    }

    #[tokio::test]
    async fn test_merge_all_sources() {
        let scope = Scope::new();
        let sources = vec![
            Generator::from_values(vec![1, 2, 3]).spawn(&scope),
            Generator::from_values(vec![10, 20]).spawn(&scope),
            Generator::from_values(vec![100]).spawn(&scope),
        ];
        let merged = merge(&scope, sources);

        let mut values = drain(&merged).await;
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3, 10, 20, 100]);
        scope.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_nothing_is_closed() {
        let scope = Scope::new();
        let merged = merge::<u8>(&scope, Vec::new());
        assert_eq!(merged.recv().await.unwrap(), None);
    }
}
