//! Plugin runtimes and their supervision.
//!
//! A runtime is one running instance of a plugin, reachable through a
//! transport. [`PluginRuntime`] is what sessions see (listen/write);
//! [`FullDuplexLifetime`] is what the supervisor drives
//! (init/start/wait/stop/cleanup). Concrete runtimes compose a
//! [`RuntimeCore`] for the shared bookkeeping.

pub mod base;
pub mod launch;
pub mod local;
pub mod manager;
pub mod remote;
pub mod source;
pub mod supervisor;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plugind_protocol::{AccessAction, SessionMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcast;
use crate::pool::PoolError;
use crate::transport::TransportError;

pub use base::RuntimeCore;
pub use launch::{LaunchError, LaunchResult, LaunchSignal, launch_channel};
pub use local::{DirectoryBootstrap, EnvironmentBootstrap, LocalPluginRuntime, LocalRuntimeConfig};
pub use manager::{ManagedRuntime, ManagerConfig, PluginManager, PluginSummary};
pub use remote::RemotePluginRuntime;
pub use source::PluginSource;
pub use supervisor::{SupervisorOptions, full_duplex};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("plugin not started")]
    NotStarted,

    #[error("plugin runtime is stopped")]
    Stopped,

    #[error("failed to spawn plugin: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("plugin environment init failed: {0}")]
    Init(String),

    #[error("invalid plugin source: {0}")]
    Source(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// State
// ============================================================================

/// How a runtime is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    /// A child process launched by this daemon.
    Local,
    /// A plugin that dialled in over TCP (debugging).
    Remote,
    /// A function endpoint. No runtime of this kind is implemented here.
    Serverless,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Serverless => "serverless",
        })
    }
}

/// Lifecycle phase. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Pending,
    Launching,
    Active,
    Restarting,
    Stopped,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Launching => "launching",
            Self::Active => "active",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        })
    }
}

/// Snapshot of a runtime's bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub restarts: u32,
    pub status: RuntimeStatus,
    pub working_path: PathBuf,
    pub active_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(rename = "scheduled_at")]
    pub schedule_at: Option<DateTime<Utc>>,
    pub verified: bool,
    pub logs: Vec<String>,
}

impl RuntimeState {
    pub fn new(working_path: impl Into<PathBuf>) -> Self {
        Self {
            restarts: 0,
            status: RuntimeStatus::Pending,
            working_path: working_path.into(),
            active_at: None,
            stopped_at: None,
            schedule_at: None,
            verified: false,
            logs: Vec::new(),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Session-facing side of a runtime.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    fn core(&self) -> &RuntimeCore;

    fn runtime_type(&self) -> RuntimeType;

    fn identity(&self) -> &str {
        self.core().identity()
    }

    fn state(&self) -> RuntimeState {
        self.core().state()
    }

    /// Register interest in replies for `session_id`.
    ///
    /// Closing the returned broadcast removes the registration.
    fn listen(&self, session_id: &str) -> Result<Broadcast<SessionMessage>, RuntimeError>;

    /// Send one serialized session envelope to the plugin.
    async fn write(
        &self,
        session_id: &str,
        action: &AccessAction,
        data: &[u8],
    ) -> Result<(), RuntimeError>;
}

/// Supervisor-facing side of a runtime.
#[async_trait]
pub trait FullDuplexLifetime: PluginRuntime {
    /// Prepare the environment. Retried by the supervisor on failure.
    async fn init(&self) -> Result<(), RuntimeError>;

    /// Start the plugin. May run for the lifetime of the process.
    async fn start_plugin(&self) -> Result<(), RuntimeError>;

    /// Token cancelled once the current plugin instance has exited.
    fn wait(&self) -> Result<CancellationToken, RuntimeError>;

    /// Mark the runtime stopped and tear down its transport.
    async fn stop(&self);

    /// Release resources held by the runtime.
    async fn cleanup(&self);

    fn stopped(&self) -> bool {
        self.core().stopped()
    }
}
