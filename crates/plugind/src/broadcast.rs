//! Synchronous fan-out of session messages to registered listeners.

// std::sync::Mutex is correct here: callbacks run after the lock is released.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// Listener registration returned by `PluginRuntime::listen`.
///
/// `send` calls every listener inline. Closing clears the listeners and runs
/// the close hooks once, which is how a session detaches from its transport.
pub struct Broadcast<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    listeners: Mutex<Vec<Listener<T>>>,
    on_close: Mutex<Vec<CloseHook>>,
    closed: AtomicBool,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcast<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                on_close: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn listen<F>(&self, f: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return;
        }
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    pub fn send(&self, value: &T) {
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let hooks = std::mem::take(
            &mut *self
                .inner
                .on_close
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
