//! One-shot launch outcome shared between the supervisor and its callers.

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("init plugin {identity} failed after {attempts} attempts: {last_error}")]
    InitFailed {
        identity: String,
        attempts: u32,
        last_error: String,
    },

    #[error("plugin {0} was stopped before it launched")]
    Stopped(String),

    #[error("plugin launch was abandoned")]
    Aborted,

    #[error("plugin {0} is already connected")]
    AlreadyRunning(String),

    #[error("failed to prepare plugin: {0}")]
    Prepare(String),

    #[error("worker pool is shut down")]
    PoolClosed,
}

type Slot = Option<Result<(), LaunchError>>;

/// Create a connected signal/result pair.
pub fn launch_channel() -> (LaunchSignal, LaunchResult) {
    let (tx, rx) = watch::channel(None);
    (LaunchSignal { tx: Some(tx) }, LaunchResult { rx })
}

/// Write side, owned by the supervisor. Resolves at most once; dropping it
/// unresolved resolves the result with [`LaunchError::Aborted`].
#[derive(Debug)]
pub struct LaunchSignal {
    tx: Option<watch::Sender<Slot>>,
}

impl LaunchSignal {
    pub fn succeed(mut self) {
        self.resolve(Ok(()));
    }

    pub fn fail(mut self, err: LaunchError) {
        self.resolve(Err(err));
    }

    fn resolve(&mut self, outcome: Result<(), LaunchError>) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for LaunchSignal {
    fn drop(&mut self) {
        self.resolve(Err(LaunchError::Aborted));
    }
}

/// Read side. Cheap to clone; every clone observes the same outcome.
#[derive(Debug, Clone)]
pub struct LaunchResult {
    rx: watch::Receiver<Slot>,
}

impl LaunchResult {
    /// An already-resolved result.
    pub fn ready(outcome: Result<(), LaunchError>) -> Self {
        let (tx, rx) = watch::channel(Some(outcome));
        drop(tx);
        Self { rx }
    }

    /// Wait for the launch outcome.
    pub async fn wait(&self) -> Result<(), LaunchError> {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(LaunchError::Aborted)),
            Err(_) => Err(LaunchError::Aborted),
        }
    }

    /// The outcome if already known.
    pub fn try_get(&self) -> Option<Result<(), LaunchError>> {
        self.rx.borrow().clone()
    }
}
