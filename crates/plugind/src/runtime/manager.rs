//! Registry of running plugins and the entry point for launching them.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::launch::{LaunchError, LaunchResult, LaunchSignal, launch_channel};
use super::local::{LocalPluginRuntime, LocalRuntimeConfig};
use super::remote::RemotePluginRuntime;
use super::source::{self, PluginSource};
use super::supervisor::{SupervisorOptions, full_duplex};
use super::{FullDuplexLifetime, PluginRuntime, RuntimeCore, RuntimeState, RuntimeType};
use crate::config::PluginDeclaration;
use crate::pool::WorkerPool;
use crate::sync::GranularityLock;
use crate::transport::tcp::RemoteConnection;

#[derive(Clone)]
pub struct ManagerConfig {
    /// Root of the per-plugin working directories.
    pub working_path: PathBuf,
    /// Plugins allowed in the launching phase at once.
    pub max_concurrent_launches: usize,
    pub supervisor: SupervisorOptions,
    pub local: LocalRuntimeConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            working_path: PathBuf::from(crate::config::DEFAULT_WORKING_PATH),
            max_concurrent_launches: 2,
            supervisor: SupervisorOptions::default(),
            local: LocalRuntimeConfig::default(),
        }
    }
}

// ============================================================================
// ManagedRuntime
// ============================================================================

/// A runtime owned by the manager.
#[derive(Clone)]
pub enum ManagedRuntime {
    Local(Arc<LocalPluginRuntime>),
    Remote(Arc<RemotePluginRuntime>),
}

impl ManagedRuntime {
    /// Session-facing handle.
    pub fn runtime(&self) -> Arc<dyn PluginRuntime> {
        match self {
            Self::Local(rt) => rt.clone(),
            Self::Remote(rt) => rt.clone(),
        }
    }

    fn lifetime(&self) -> Arc<dyn FullDuplexLifetime> {
        match self {
            Self::Local(rt) => rt.clone(),
            Self::Remote(rt) => rt.clone(),
        }
    }

    pub fn identity(&self) -> &str {
        match self {
            Self::Local(rt) => rt.identity(),
            Self::Remote(rt) => rt.identity(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        match self {
            Self::Local(_) => RuntimeType::Local,
            Self::Remote(_) => RuntimeType::Remote,
        }
    }

    pub fn state(&self) -> RuntimeState {
        match self {
            Self::Local(rt) => rt.state(),
            Self::Remote(rt) => rt.state(),
        }
    }

    pub fn core(&self) -> &RuntimeCore {
        match self {
            Self::Local(rt) => rt.core(),
            Self::Remote(rt) => rt.core(),
        }
    }

    fn stopped(&self) -> bool {
        self.core().stopped()
    }

    fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Local(a), Self::Local(b)) => Arc::ptr_eq(a, b),
            (Self::Remote(a), Self::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// One row of [`PluginManager::list`].
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub identity: String,
    pub runtime_type: RuntimeType,
    pub state: RuntimeState,
}

// ============================================================================
// PluginManager
// ============================================================================

/// Launches, tracks and stops plugin runtimes.
///
/// Launches of the same identity are serialized by a [`GranularityLock`], so
/// at most one supervisor runs per identity while different plugins launch
/// in parallel (bounded by `max_concurrent_launches`). A stopped instance
/// still being torn down is waited for before its replacement starts.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    pool: WorkerPool,
    runtimes: DashMap<String, ManagedRuntime>,
    locks: GranularityLock,
    launching: Arc<Semaphore>,
}

impl PluginManager {
    pub fn new(config: ManagerConfig, pool: WorkerPool) -> Self {
        let launching = Arc::new(Semaphore::new(config.max_concurrent_launches.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                runtimes: DashMap::new(),
                locks: GranularityLock::new(),
                launching,
            }),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Launch `source` as a local process, or return the running instance.
    ///
    /// The returned [`LaunchResult`] resolves once the plugin environment is
    /// initialized (or definitively failed); for an instance that is already
    /// running it is resolved immediately.
    pub async fn launch_local(
        &self,
        source: &dyn PluginSource,
    ) -> Result<(Arc<LocalPluginRuntime>, LaunchResult), LaunchError> {
        let identity = source.identity();
        let _guard = self.inner.locks.lock(&identity).await;

        if let Some(existing) = self.get(&identity) {
            match existing {
                ManagedRuntime::Local(rt) if !rt.core().stopped() => {
                    debug!(plugin = %identity, "Plugin already running");
                    return Ok((rt, LaunchResult::ready(Ok(()))));
                }
                ManagedRuntime::Remote(rt) if !rt.core().stopped() => {
                    return Err(LaunchError::AlreadyRunning(identity));
                }
                stale => self.await_teardown(&stale).await,
            }
        }

        let working_path = source::working_path(&self.inner.config.working_path, source)
            .map_err(|e| LaunchError::Prepare(e.to_string()))?;
        let runtime = Arc::new(LocalPluginRuntime::new(
            source.declaration().clone(),
            working_path,
            self.inner.config.local.clone(),
            self.inner.pool.clone(),
        ));
        runtime.core().set_schedule_at_now();
        runtime.core().set_verified(source.verified());

        let permit = Arc::clone(&self.inner.launching)
            .acquire_owned()
            .await
            .map_err(|_| LaunchError::PoolClosed)?;

        let managed = ManagedRuntime::Local(runtime.clone());
        let (signal, result) = launch_channel();
        self.inner.runtimes.insert(identity.clone(), managed.clone());
        self.supervise(managed, signal)?;

        // The launch slot is held until init has an outcome.
        let launched = result.clone();
        let released = self.inner.pool.submit("manager", "launch_slot", async move {
            let _ = launched.wait().await;
            drop(permit);
        });
        if released.is_err() {
            warn!(plugin = %identity, "Launch slot watcher not started");
        }

        info!(plugin = %identity, "Plugin launch scheduled");
        Ok((runtime, result))
    }

    /// Adopt an authenticated remote connection as a runtime.
    pub async fn register_remote(
        &self,
        conn: RemoteConnection,
    ) -> Result<(Arc<RemotePluginRuntime>, LaunchResult), LaunchError> {
        let peer = conn.peer;
        let runtime = Arc::new(RemotePluginRuntime::new(
            conn.handshake,
            conn.reader,
            conn.writer,
            self.inner.config.local.holder.clone(),
            self.inner.pool.clone(),
        ));
        let identity = runtime.identity().to_string();
        let _guard = self.inner.locks.lock(&identity).await;

        if let Some(existing) = self.get(&identity) {
            if !existing.stopped() {
                warn!(plugin = %identity, peer = %peer, "Rejecting duplicate remote plugin");
                return Err(LaunchError::AlreadyRunning(identity));
            }
            self.await_teardown(&existing).await;
        }

        let managed = ManagedRuntime::Remote(runtime.clone());
        let (signal, result) = launch_channel();
        self.inner.runtimes.insert(identity.clone(), managed.clone());
        self.supervise(managed, signal)?;

        info!(plugin = %identity, peer = %peer, "Remote plugin registered");
        Ok((runtime, result))
    }

    /// Wait until a stopped runtime released its working directory and
    /// transport. Called with the identity's launch lock held.
    async fn await_teardown(&self, stale: &ManagedRuntime) {
        if stale.core().is_torn_down() {
            return;
        }
        debug!(plugin = %stale.identity(), "Waiting for previous instance teardown");
        stale.core().torn_down().await;
    }

    /// Run the supervisor on the pool; the entry is removed when it exits.
    fn supervise(&self, managed: ManagedRuntime, signal: LaunchSignal) -> Result<(), LaunchError> {
        let identity = managed.identity().to_string();
        let lifetime = managed.lifetime();
        let options = self.inner.config.supervisor;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let entry = managed.clone();

        let submitted = self.inner.pool.submit("runtime", "full_duplex", async move {
            full_duplex(lifetime, signal, options).await;
            if let Some(inner) = inner.upgrade() {
                inner
                    .runtimes
                    .remove_if(entry.identity(), |_, current| current.is_same(&entry));
            }
        });

        if submitted.is_err() {
            self.inner
                .runtimes
                .remove_if(&identity, |_, current| current.is_same(&managed));
            return Err(LaunchError::PoolClosed);
        }
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<ManagedRuntime> {
        self.inner.runtimes.get(identity).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<PluginSummary> {
        let mut plugins: Vec<_> = self
            .inner
            .runtimes
            .iter()
            .map(|e| PluginSummary {
                identity: e.key().clone(),
                runtime_type: e.value().runtime_type(),
                state: e.value().state(),
            })
            .collect();
        plugins.sort_by(|a, b| a.identity.cmp(&b.identity));
        plugins
    }

    pub fn len(&self) -> usize {
        self.inner.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.runtimes.is_empty()
    }

    /// Stop a plugin. Its supervisor tears it down and drops the entry.
    pub async fn stop(&self, identity: &str) -> bool {
        let Some(managed) = self.get(identity) else {
            return false;
        };
        info!(plugin = %identity, "Stopping plugin");
        managed.lifetime().stop().await;
        true
    }

    /// Launch every declaration and wait for each launch outcome.
    pub async fn launch_all(
        &self,
        declarations: &[PluginDeclaration],
    ) -> Vec<(String, Result<(), LaunchError>)> {
        let concurrency = self.inner.config.max_concurrent_launches.max(1);
        futures::stream::iter(declarations)
            .map(|decl| async move {
                let identity = decl.identity();
                let outcome = match self.launch_local(decl).await {
                    Ok((_, launched)) => launched.wait().await,
                    Err(e) => Err(e),
                };
                (identity, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    /// Stop every plugin and wait for all background work to finish.
    pub async fn shutdown(&self) {
        let running: Vec<ManagedRuntime> =
            self.inner.runtimes.iter().map(|e| e.value().clone()).collect();
        info!(count = running.len(), "Stopping plugins");
        for managed in running {
            managed.lifetime().stop().await;
        }
        self.inner.launching.close();
        self.inner.pool.shutdown().await;
    }
}
