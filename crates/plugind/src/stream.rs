//! Bounded producer/consumer stream with in-band error delivery.
//!
//! `Stream<T>` is the buffer behind every typed plugin reply: the dispatcher
//! writes decoded items into it and callers drain it with [`Stream::next`] and
//! [`Stream::read`]. Data written before [`Stream::close`] stays readable after
//! it; at most one out-of-band error is delivered once the buffer is drained.

use std::collections::VecDeque;
use std::pin::pin;
// std::sync::Mutex is correct here: the state lock is never held across .await.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use plugind_protocol::ErrorResponse;
use thiserror::Error;
use tokio::sync::Notify;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("queue is full")]
    Full,

    #[error("no data available")]
    Empty,

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Plugin(#[from] ErrorResponse),
}

// ============================================================================
// Stream
// ============================================================================

type Filter<T> = Arc<dyn Fn(&T) -> Result<(), StreamError> + Send + Sync>;
type Hook = Box<dyn FnOnce() + Send>;

/// Bounded FIFO with blocking and non-blocking writes.
///
/// Cloning yields another handle to the same queue.
pub struct Stream<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    closed: AtomicBool,
    /// Woken on write, error and close.
    readable: Notify,
    /// Woken on read and close.
    writable: Notify,
    max: usize,
}

struct State<T> {
    queue: VecDeque<T>,
    err: Option<StreamError>,
    filters: Vec<Filter<T>>,
    before_close: Vec<Hook>,
    on_close: Vec<Hook>,
}

impl<T> Stream<T> {
    /// Create a stream holding at most `max` buffered items.
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::with_capacity(max.min(1024)),
                    err: None,
                    filters: Vec::new(),
                    before_close: Vec::new(),
                    on_close: Vec::new(),
                }),
                closed: AtomicBool::new(false),
                readable: Notify::new(),
                writable: Notify::new(),
                max,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------------

    /// Append `value` without waiting.
    ///
    /// Writing to a closed stream silently drops the value.
    pub fn write(&self, value: T) -> Result<(), StreamError> {
        let mut state = self.state();
        if self.is_closed() {
            return Ok(());
        }
        if state.queue.len() >= self.inner.max {
            return Err(StreamError::Full);
        }
        state.queue.push_back(value);
        drop(state);

        self.inner.readable.notify_waiters();
        Ok(())
    }

    /// Append `value`, waiting for room while the stream is full.
    ///
    /// Returns without writing if the stream is closed before room frees up.
    pub async fn write_blocking(&self, value: T) {
        loop {
            let mut room = pin!(self.inner.writable.notified());
            room.as_mut().enable();

            {
                let mut state = self.state();
                if self.is_closed() {
                    return;
                }
                if state.queue.len() < self.inner.max {
                    state.queue.push_back(value);
                    drop(state);
                    self.inner.readable.notify_waiters();
                    return;
                }
            }

            room.await;
        }
    }

    /// Store an error for the consumer. It is delivered by [`Stream::read`]
    /// once all buffered items are drained.
    ///
    /// At most one error is pending; a later call replaces one not yet read.
    /// Like [`write`](Self::write), this is a no-op on a closed stream.
    pub fn write_error(&self, err: impl Into<StreamError>) {
        let mut state = self.state();
        if self.is_closed() {
            return;
        }
        state.err = Some(err.into());
        drop(state);

        self.inner.readable.notify_waiters();
    }

    // ------------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------------

    /// Wait until an item or error is available.
    ///
    /// Returns `false` only once the stream is closed and fully drained.
    pub async fn next(&self) -> bool {
        loop {
            let mut ready = pin!(self.inner.readable.notified());
            ready.as_mut().enable();

            {
                let state = self.state();
                if !state.queue.is_empty() || state.err.is_some() {
                    return true;
                }
                if self.is_closed() {
                    return false;
                }
            }

            ready.await;
        }
    }

    /// Pop the front item, or the pending error once the queue is empty.
    ///
    /// A filter rejecting the item closes the stream and its error is
    /// returned in place of the item.
    pub fn read(&self) -> Result<T, StreamError> {
        let mut state = self.state();
        match state.queue.pop_front() {
            Some(value) => {
                let filters = state.filters.clone();
                drop(state);
                self.inner.writable.notify_waiters();

                for filter in &filters {
                    if let Err(e) = filter(&value) {
                        self.close();
                        return Err(e);
                    }
                }
                Ok(value)
            }
            None => match state.err.take() {
                Some(err) => Err(err),
                None => Err(StreamError::Empty),
            },
        }
    }

    /// Drive `next`/`read` until the stream is exhausted, calling `f` for
    /// each item. Returns the first read error.
    pub async fn for_each<F>(&self, mut f: F) -> Result<(), StreamError>
    where
        F: FnMut(T),
    {
        while self.next().await {
            f(self.read()?);
        }
        Ok(())
    }

    /// Adapt into a `futures::Stream` of read results.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<T, StreamError>> + Send
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |stream| async move {
            if stream.next().await {
                let item = stream.read();
                Some((item, stream))
            } else {
                None
            }
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Close the stream. Only the first call has any effect.
    ///
    /// Runs `before_close` hooks, wakes every parked reader and writer, then
    /// runs `on_close` hooks.
    pub fn close(&self) {
        let (before, after) = {
            let mut state = self.state();
            if self
                .inner
                .closed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            (
                std::mem::take(&mut state.before_close),
                std::mem::take(&mut state.on_close),
            )
        };

        for hook in before {
            hook();
        }
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
        for hook in after {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of buffered items.
    pub fn size(&self) -> usize {
        self.state().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.max
    }

    /// Register a check applied to every item as it is read.
    pub fn filter<F>(&self, f: F)
    where
        F: Fn(&T) -> Result<(), StreamError> + Send + Sync + 'static,
    {
        self.state().filters.push(Arc::new(f));
    }

    /// Register a hook run after the stream closes.
    pub fn on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state().on_close.push(Box::new(f));
    }

    /// Register a hook run when the stream starts closing, before waiters wake.
    pub fn before_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state().before_close.push(Box::new(f));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::StreamExt;

    #[test]
    fn fifo_order() {
        let stream = Stream::new(10);
        for i in 0..5 {
            stream.write(i).unwrap();
        }
        let got: Vec<_> = (0..5).map(|_| stream.read().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn write_beyond_capacity_fails() {
        let stream = Stream::new(3);
        for i in 0..3 {
            stream.write(i).unwrap();
        }
        assert!(matches!(stream.write(3), Err(StreamError::Full)));
        assert_eq!(stream.size(), 3);
    }

    #[test]
    fn write_after_close_is_dropped() {
        let stream = Stream::new(3);
        stream.close();
        assert!(stream.write(1).is_ok());
        assert_eq!(stream.size(), 0);
    }

    #[tokio::test]
    async fn drain_after_close() {
        let stream = Stream::new(10);
        stream.write(1).unwrap();
        stream.write(2).unwrap();
        stream.write(3).unwrap();
        stream.close();

        let mut got = Vec::new();
        while stream.next().await {
            got.push(stream.read().unwrap());
        }
        assert_eq!(got, vec![1, 2, 3]);
        assert!(!stream.next().await);
        assert!(matches!(stream.read(), Err(StreamError::Empty)));
    }

    #[test]
    fn close_hooks_run_once_in_order() {
        let stream: Stream<u8> = Stream::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        stream.on_close(move || l.lock().unwrap().push("close-1"));
        let l = log.clone();
        stream.before_close(move || l.lock().unwrap().push("before"));
        let l = log.clone();
        stream.on_close(move || l.lock().unwrap().push("close-2"));

        stream.close();
        stream.close();

        assert_eq!(*log.lock().unwrap(), vec!["before", "close-1", "close-2"]);
    }

    #[test]
    fn pending_error_follows_buffered_items() {
        let stream = Stream::new(4);
        stream.write("a").unwrap();
        stream.write_error(StreamError::Failed("boom".to_string()));

        assert_eq!(stream.read().unwrap(), "a");
        match stream.read() {
            Err(StreamError::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected pending error, got {other:?}"),
        }
        assert!(matches!(stream.read(), Err(StreamError::Empty)));
    }

    #[test]
    fn filter_rejection_closes_stream() {
        let stream = Stream::new(4);
        stream.filter(|v: &i32| {
            if *v < 0 {
                Err(StreamError::Failed("negative".to_string()))
            } else {
                Ok(())
            }
        });
        stream.write(1).unwrap();
        stream.write(-1).unwrap();

        assert_eq!(stream.read().unwrap(), 1);
        assert!(matches!(stream.read(), Err(StreamError::Failed(_))));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn next_wakes_on_write_from_other_task() {
        let stream = Stream::new(4);
        let producer = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.write(42).unwrap();
        });

        assert!(stream.next().await);
        assert_eq!(stream.read().unwrap(), 42);
    }

    #[tokio::test]
    async fn every_parked_reader_wakes_on_close() {
        let stream: Stream<u32> = Stream::new(4);
        let woken = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = stream.clone();
            let w = woken.clone();
            handles.push(tokio::spawn(async move {
                assert!(!s.next().await);
                w.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn write_blocking_waits_for_read() {
        let stream = Stream::new(1);
        stream.write(1).unwrap();

        let producer = stream.clone();
        let handle = tokio::spawn(async move { producer.write_blocking(2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        assert_eq!(stream.read().unwrap(), 1);

        handle.await.unwrap();
        assert_eq!(stream.read().unwrap(), 2);
    }

    #[tokio::test]
    async fn write_blocking_released_by_close() {
        let stream = Stream::new(1);
        stream.write(1).unwrap();

        let producer = stream.clone();
        let handle = tokio::spawn(async move { producer.write_blocking(2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close();
        handle.await.unwrap();

        assert_eq!(stream.size(), 1);
    }

    #[tokio::test]
    async fn for_each_visits_items_then_reports_error() {
        let stream = Stream::new(8);
        stream.write(1).unwrap();
        stream.write(2).unwrap();
        stream.write_error(StreamError::Failed("late".to_string()));
        stream.close();

        let mut seen = Vec::new();
        let result = stream.for_each(|v| seen.push(v)).await;
        assert_eq!(seen, vec![1, 2]);
        assert!(matches!(result, Err(StreamError::Failed(_))));
    }

    #[tokio::test]
    async fn error_after_close_is_dropped() {
        let stream = Stream::new(8);
        stream.write(1).unwrap();
        stream.close();
        stream.write_error(StreamError::Failed("too late".to_string()));

        let mut seen = Vec::new();
        stream.for_each(|v| seen.push(v)).await.unwrap();
        assert_eq!(seen, vec![1]);
        assert!(matches!(stream.read(), Err(StreamError::Empty)));
    }

    #[tokio::test]
    async fn for_each_clean_exhaustion() {
        let stream = Stream::new(8);
        stream.write("x").unwrap();
        stream.close();

        let mut count = 0;
        stream.for_each(|_| count += 1).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn adapts_into_futures_stream() {
        let stream = Stream::new(8);
        stream.write(10).unwrap();
        stream.write(20).unwrap();
        stream.close();

        let items: Vec<_> = stream
            .into_stream()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![10, 20]);
    }
}
