//! Bounded, scope-aware streams.
//!
//! A stream is a FIFO conduit between one logical producer and any number of
//! consumers. It is created bound to a [`Scope`]: every blocking send or
//! receive races against that scope's cancellation, so a pipeline being torn
//! down can never leave a task parked on a stream.
//!
//! Closing is the producer's job and happens exactly once, either through an
//! explicit [`Sender::close`] or implicitly when the last [`Sender`] handle is
//! dropped (the producer's unwind path). Values sent before the close remain
//! receivable afterwards; once drained, receivers observe end-of-stream as
//! `Ok(None)`.
//!
//! A capacity of zero gives rendezvous semantics: `send` completes only once
//! a receiver has taken the value.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_core::Stream;
use tokio::sync::Notify;

use crate::error::{Error, Result, SendError, TryRecvError, TrySendError};
use crate::scope::Scope;

/// Create a stream with the given buffer `capacity`, bound to `scope`.
pub fn channel<T>(scope: &Scope, capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity),
            closed: false,
            senders: 1,
            receivers: 1,
            waiting_receivers: 0,
            pushed: 0,
            taken: 0,
        }),
        items: Notify::new(),
        space: Notify::new(),
        capacity,
    });

    let sender = Sender {
        shared: shared.clone(),
        scope: scope.clone(),
    };
    let receiver = Receiver {
        shared,
        scope: scope.clone(),
    };
    (sender, receiver)
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Notified when a value is pushed or the stream closes.
    items: Notify,
    /// Notified when a value is taken, a receiver starts waiting, or the
    /// last receiver goes away.
    space: Notify,
    capacity: usize,
}

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
    senders: usize,
    receivers: usize,
    waiting_receivers: usize,
    /// Sequence numbers; the value at the buffer's front is number `taken`.
    pushed: u64,
    taken: u64,
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Effective buffer bound; rendezvous streams park one value in flight.
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }
}

/// The producing half of a stream.
///
/// Clones share ownership of the producing side; the stream closes when one
/// of them calls [`close`](Sender::close) or when the last one is dropped.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
    scope: Scope,
}

impl<T> Sender<T> {
    /// Send a value, waiting for buffer space (or, for a rendezvous stream,
    /// for a receiver to take it).
    ///
    /// Fails with [`SendError::Cancelled`] if the scope is cancelled first and
    /// with [`SendError::Disconnected`] once every receiver is gone.
    ///
    /// # Panics
    ///
    /// Panics if the stream has already been closed.
    pub async fn send(&self, value: T) -> std::result::Result<(), SendError<T>> {
        let seq = loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if self.scope.is_cancelled() {
                return Err(SendError::Cancelled(value));
            }
            {
                let mut state = self.shared.state();
                if state.closed {
                    drop(state);
                    panic!("send on a closed stream");
                }
                if state.receivers == 0 {
                    return Err(SendError::Disconnected(value));
                }
                if state.buffer.len() < self.shared.slots() {
                    state.buffer.push_back(value);
                    let seq = state.pushed;
                    state.pushed += 1;
                    break seq;
                }
            }

            tokio::select! {
                biased;
                _ = self.scope.cancelled() => return Err(SendError::Cancelled(value)),
                _ = &mut space => {}
            }
        };
        self.shared.items.notify_waiters();

        if self.shared.capacity == 0 {
            self.await_taken(seq).await
        } else {
            Ok(())
        }
    }

    /// Wait for the rendezvous value numbered `seq` to be taken. If the wait
    /// is abandoned the value is pulled back out of the stream.
    async fn await_taken(&self, seq: u64) -> std::result::Result<(), SendError<T>> {
        loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.shared.state();
                if state.taken > seq {
                    return Ok(());
                }
                if state.receivers == 0 || self.scope.is_cancelled() {
                    let disconnected = state.receivers == 0;
                    return match Self::reclaim(&mut state, seq) {
                        Some(v) if disconnected => Err(SendError::Disconnected(v)),
                        Some(v) => Err(SendError::Cancelled(v)),
                        None => Ok(()),
                    };
                }
            }

            tokio::select! {
                biased;
                _ = self.scope.cancelled() => {}
                _ = &mut space => {}
            }
        }
    }

    fn reclaim(state: &mut State<T>, seq: u64) -> Option<T> {
        if state.taken == seq {
            let value = state.buffer.pop_front();
            state.pushed -= 1;
            value
        } else {
            None
        }
    }

    /// Attempt to send without waiting.
    ///
    /// A rendezvous stream accepts the value only if a receiver is already
    /// waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if the stream has already been closed.
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        if self.scope.is_cancelled() {
            return Err(TrySendError::Cancelled(value));
        }
        {
            let mut state = self.shared.state();
            if state.closed {
                drop(state);
                panic!("send on a closed stream");
            }
            if state.receivers == 0 {
                return Err(TrySendError::Disconnected(value));
            }
            let has_room = if self.shared.capacity == 0 {
                state.waiting_receivers > state.buffer.len()
            } else {
                state.buffer.len() < self.shared.capacity
            };
            if !has_room {
                return Err(TrySendError::Full(value));
            }
            state.buffer.push_back(value);
            state.pushed += 1;
        }
        self.shared.items.notify_waiters();
        Ok(())
    }

    /// Close the stream. Buffered values stay receivable.
    ///
    /// # Panics
    ///
    /// Panics if the stream has already been closed: only the producer may
    /// close, and only once.
    pub fn close(&self) {
        {
            let mut state = self.shared.state();
            if state.closed {
                drop(state);
                panic!("close of a closed stream");
            }
            state.closed = true;
        }
        self.shared.items.notify_waiters();
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// The scope this stream is bound to.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The configured buffer capacity (zero for rendezvous).
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.state().senders += 1;
        Self {
            shared: self.shared.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let closed_now = {
            let mut state = self.shared.state();
            state.senders -= 1;
            if state.senders == 0 && !state.closed {
                state.closed = true;
                true
            } else {
                false
            }
        };
        if closed_now {
            self.shared.items.notify_waiters();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The consuming half of a stream. Clones compete for values.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
    scope: Scope,
}

impl<T> Receiver<T> {
    /// Receive the next value.
    ///
    /// Returns `Ok(Some(value))`, `Ok(None)` at end-of-stream (closed and
    /// drained), or [`Error::Cancelled`] if the scope is cancelled while
    /// nothing is buffered. Values already in the buffer are still handed out
    /// after cancellation.
    pub async fn recv(&self) -> Result<Option<T>> {
        loop {
            let items = self.shared.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();

            {
                let mut state = self.shared.state();
                if let Some(value) = Self::take(&mut state) {
                    drop(state);
                    self.shared.space.notify_waiters();
                    return Ok(Some(value));
                }
                if state.closed {
                    return Ok(None);
                }
                if self.scope.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                state.waiting_receivers += 1;
            }
            // A rendezvous sender may be waiting for a receiver to show up.
            self.shared.space.notify_waiters();

            let _waiting = WaitingGuard {
                shared: &self.shared,
            };
            // Either way, loop around: buffered values win over cancellation.
            tokio::select! {
                biased;
                _ = self.scope.cancelled() => {}
                _ = &mut items => {}
            }
        }
    }

    /// Receive without waiting.
    ///
    /// `Ok(None)` signals end-of-stream; [`TryRecvError::Empty`] means the
    /// stream is open but nothing is buffered.
    pub fn try_recv(&self) -> std::result::Result<Option<T>, TryRecvError> {
        let mut state = self.shared.state();
        match Self::take(&mut state) {
            Some(value) => {
                drop(state);
                self.shared.space.notify_waiters();
                Ok(Some(value))
            }
            None if state.closed => Ok(None),
            None if self.scope.is_cancelled() => Err(TryRecvError::Cancelled),
            None => Err(TryRecvError::Empty),
        }
    }

    fn take(state: &mut State<T>) -> Option<T> {
        let value = state.buffer.pop_front()?;
        state.taken += 1;
        Some(value)
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.shared.state().buffer.len()
    }

    /// Whether no values are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer has closed the stream. Buffered values may remain.
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// The scope this stream is bound to.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The configured buffer capacity (zero for rendezvous).
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Adapt this receiver into a [`Stream`] of values.
    ///
    /// The stream ends at end-of-stream or on cancellation.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send
    where
        T: Send,
    {
        futures::stream::unfold(self, |rx| async move {
            match rx.recv().await {
                Ok(Some(value)) => Some((value, rx)),
                Ok(None) | Err(_) => None,
            }
        })
    }
}

struct WaitingGuard<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for WaitingGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.state().waiting_receivers -= 1;
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.state().receivers += 1;
        Self {
            shared: self.shared.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.state();
            state.receivers -= 1;
            state.receivers == 0
        };
        if last {
            self.shared.space.notify_waiters();
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.shared.capacity)
            .field("buffered", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_drain_after_close() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 4);

        for i in 1..=3 {
            tx.send(i).await.unwrap();
        }
        tx.close();

        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert_eq!(rx.recv().await.unwrap(), Some(2));
        assert_eq!(rx.recv().await.unwrap(), Some(3));
        // Reads after end-of-stream keep reporting it.
        assert_eq!(rx.recv().await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap(), None);
        assert_eq!(rx.try_recv(), Ok(None));
    }

    #[tokio::test]
    async fn test_recv_pending_until_send() {
        let scope = Scope::new();
        let (tx, rx) = channel::<u32>(&scope, 1);

        let mut recv = task::spawn(rx.recv());
        assert_pending!(recv.poll());

        tx.try_send(9).unwrap();
        assert!(recv.is_woken());
        assert_eq!(assert_ready!(recv.poll()).unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_send_blocks_when_full() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 1);
        tx.send(1).await.unwrap();

        let mut send = task::spawn(tx.send(2));
        assert_pending!(send.poll());
        assert!(matches!(tx.try_send(3), Err(TrySendError::Full(3))));

        assert_eq!(rx.try_recv(), Ok(Some(1)));
        assert!(send.is_woken());
        assert!(assert_ready!(send.poll()).is_ok());
        assert_eq!(rx.try_recv(), Ok(Some(2)));
    }

    #[tokio::test]
    async fn test_rendezvous_send_waits_for_receiver() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 0);

        let mut send = task::spawn(tx.send("hello"));
        assert_pending!(send.poll());
        assert_eq!(rx.try_recv(), Ok(Some("hello")));
        assert!(send.is_woken());
        assert!(assert_ready!(send.poll()).is_ok());
    }

    #[tokio::test]
    async fn test_rendezvous_try_send_needs_waiting_receiver() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 0);
        assert!(matches!(tx.try_send(1), Err(TrySendError::Full(1))));

        let consumer = tokio::spawn(async move { rx.recv().await });
        while tx.try_send(2).is_err() {
            tokio::task::yield_now().await;
        }
        assert_eq!(consumer.await.unwrap().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_send_and_returns_value() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 0);

        let mut send = task::spawn(tx.send(5));
        assert_pending!(send.poll());

        scope.cancel();
        assert!(send.is_woken());
        match assert_ready!(send.poll()) {
            Err(SendError::Cancelled(v)) => assert_eq!(v, 5),
            other => panic!("unexpected {other:?}"),
        }
        // The reclaimed value is no longer in flight.
        assert_eq!(rx.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_recv() {
        let scope = Scope::new();
        let (_tx, rx) = channel::<u32>(&scope, 1);

        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        scope.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropping_senders_closes() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 2);
        let tx2 = tx.clone();

        tx.send(1).await.unwrap();
        drop(tx);
        assert!(!rx.is_closed());
        drop(tx2);
        assert!(rx.is_closed());

        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_without_receivers_is_disconnected() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 0);

        let sender = tokio::spawn(async move { tx.send(1).await });
        tokio::task::yield_now().await;
        drop(rx);

        let result = sender.await.unwrap();
        assert!(matches!(result, Err(SendError::Disconnected(1))));
    }

    #[tokio::test]
    async fn test_competing_receivers_share_values() {
        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 8);

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let rx = rx.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(v) = rx.recv().await.unwrap() {
                    seen.push(v);
                }
                seen
            }));
        }
        drop(rx);

        for i in 0..100 {
            tx.send(i).await.unwrap();
        }
        tx.close();

        let mut all = Vec::new();
        for consumer in consumers {
            let seen = consumer.await.unwrap();
            // Each consumer observes values in send order.
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_into_stream() {
        use tokio_stream::StreamExt;

        let scope = Scope::new();
        let (tx, rx) = channel(&scope, 3);
        tx.send('a').await.unwrap();
        tx.send('b').await.unwrap();
        tx.close();

        let values: Vec<char> = rx.into_stream().collect().await;
        assert_eq!(values, vec!['a', 'b']);
    }

    #[tokio::test]
    #[should_panic(expected = "close of a closed stream")]
    async fn test_double_close_panics() {
        let scope = Scope::new();
        let (tx, _rx) = channel::<u8>(&scope, 1);
        tx.close();
        tx.close();
    }

    #[tokio::test]
    #[should_panic(expected = "send on a closed stream")]
    async fn test_send_after_close_panics() {
        let scope = Scope::new();
        let (tx, _rx) = channel(&scope, 1);
        tx.close();
        let _ = tx.send(1).await;
    }
}
