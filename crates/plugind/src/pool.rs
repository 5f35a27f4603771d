//! Bounded worker pool for background work.
//!
//! Supervisor loops, transport readers and dispatch drains are all submitted
//! here so the total amount of concurrent background work stays bounded.
//! Tasks are registered so shutdown can await them.

// std::sync::Mutex is correct here: the handle list is never held across .await.
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

/// Default pool size when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub free: usize,
    pub busy: usize,
    pub total: usize,
}

// ============================================================================
// WorkerPool
// ============================================================================

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    busy: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WorkerPool {
    /// Create a pool running at most `size` tasks at once.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            busy: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `future` once a worker slot is free.
    ///
    /// The task runs inside a span labelled with `module` and `function`.
    /// A panic inside it is logged and does not propagate.
    pub fn submit<F>(
        &self,
        module: &'static str,
        function: &'static str,
        future: F,
    ) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permits = Arc::clone(&self.permits);
        let busy = Arc::clone(&self.busy);
        let span = info_span!("pool_task", module, function);

        let handle = tokio::spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                busy.fetch_add(1, Ordering::AcqRel);
                let outcome = AssertUnwindSafe(future).catch_unwind().await;
                busy.fetch_sub(1, Ordering::AcqRel);

                if let Err(panic) = outcome {
                    error!(module, function, panic = %panic_message(&*panic), "Pool task panicked");
                }
            }
            .instrument(span),
        );

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        let busy = self.busy.load(Ordering::Acquire);
        PoolStatus {
            free: self.size.saturating_sub(busy),
            busy,
            total: self.size,
        }
    }

    /// Number of submitted tasks that have not finished.
    pub fn pending_count(&self) -> usize {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Refuse new work and wait for every submitted task to finish.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let handles: Vec<_> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));

        let count = handles.len();
        if count == 0 {
            return;
        }

        info!(count, "Waiting for pool tasks to complete");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pool task did not complete");
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
