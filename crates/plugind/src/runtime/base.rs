//! Bookkeeping shared by every runtime kind.

use std::path::PathBuf;
// std::sync::Mutex is correct here: lock is never held across .await points.
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RuntimeState, RuntimeStatus};

/// Most recent lifecycle notes kept in [`RuntimeState::logs`].
pub const MAX_STATE_LOGS: usize = 32;

type StopHook = Box<dyn FnOnce() + Send>;

/// Identity, state record, stop flag and on-stop hooks of one runtime.
///
/// Status changes are published on a `watch` channel so callers can wait for
/// a runtime to become active or stop. Mutators are crate-private: status
/// transitions belong to the supervisor and the runtime it drives.
pub struct RuntimeCore {
    identity: String,
    state: Mutex<RuntimeState>,
    status_tx: watch::Sender<RuntimeStatus>,
    stop: CancellationToken,
    torn_down: CancellationToken,
    on_stop: Mutex<Vec<StopHook>>,
}

impl RuntimeCore {
    pub fn new(identity: impl Into<String>, working_path: impl Into<PathBuf>) -> Self {
        let (status_tx, _) = watch::channel(RuntimeStatus::Pending);
        Self {
            identity: identity.into(),
            state: Mutex::new(RuntimeState::new(working_path)),
            status_tx,
            stop: CancellationToken::new(),
            torn_down: CancellationToken::new(),
            on_stop: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn lock_state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RuntimeState {
        self.lock_state().clone()
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.status_tx.borrow()
    }

    pub fn working_path(&self) -> PathBuf {
        self.lock_state().working_path.clone()
    }

    /// Move to `status`. Ignored once the runtime is stopped.
    pub(crate) fn set_status(&self, status: RuntimeStatus) {
        let mut state = self.lock_state();
        if state.status == RuntimeStatus::Stopped {
            return;
        }
        state.status = status;
        match status {
            RuntimeStatus::Active => state.active_at = Some(Utc::now()),
            RuntimeStatus::Stopped => state.stopped_at = Some(Utc::now()),
            _ => {}
        }
        self.status_tx.send_replace(status);
        drop(state);

        debug!(plugin = %self.identity, %status, "Runtime status changed");
    }

    pub(crate) fn set_active_at_now(&self) {
        self.lock_state().active_at = Some(Utc::now());
    }

    pub(crate) fn set_schedule_at_now(&self) {
        self.lock_state().schedule_at = Some(Utc::now());
    }

    pub(crate) fn set_verified(&self, verified: bool) {
        self.lock_state().verified = verified;
    }

    pub(crate) fn add_restarts(&self) {
        self.lock_state().restarts += 1;
    }

    pub fn restarts(&self) -> u32 {
        self.lock_state().restarts
    }

    /// Record a lifecycle note, keeping only the most recent ones.
    pub(crate) fn append_log(&self, line: impl Into<String>) {
        let mut state = self.lock_state();
        state.logs.push(line.into());
        let excess = state.logs.len().saturating_sub(MAX_STATE_LOGS);
        if excess > 0 {
            state.logs.drain(..excess);
        }
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.status_tx.subscribe()
    }

    // ------------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------------

    /// Mark the runtime stopped. Idempotent.
    pub(crate) fn stop(&self) {
        self.set_status(RuntimeStatus::Stopped);
        self.stop.cancel();
    }

    pub fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled when the runtime stops.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn on_stop<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }

    /// Run and clear the registered on-stop hooks.
    pub(crate) fn trigger_stop(&self) {
        let hooks = std::mem::take(&mut *self.on_stop.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook();
        }
    }

    /// Record that the supervisor finished tearing the runtime down.
    pub(crate) fn mark_torn_down(&self) {
        self.torn_down.cancel();
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.is_cancelled()
    }

    /// Resolves once the runtime's resources have been released.
    pub async fn torn_down(&self) {
        self.torn_down.cancelled().await;
    }
}
