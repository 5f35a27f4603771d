//! Plugins running as child processes of the daemon.

use std::path::Path;
use std::process::Stdio;
// std::sync locks are correct here: none is held across .await.
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use plugind_protocol::{AccessAction, SessionMessage};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FullDuplexLifetime, PluginRuntime, RuntimeCore, RuntimeError, RuntimeStatus, RuntimeType};
use crate::broadcast::Broadcast;
use crate::config::{PluginDeclaration, ProxyConfig};
use crate::pool::WorkerPool;
use crate::transport::{HolderConfig, StdioHolder};

const KILL_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Environment bootstrap
// ============================================================================

/// Prepares a plugin's working directory before its first start
/// (dependency installation and the like).
#[async_trait]
pub trait EnvironmentBootstrap: Send + Sync {
    async fn prepare(
        &self,
        declaration: &PluginDeclaration,
        working_path: &Path,
    ) -> Result<(), RuntimeError>;
}

/// Only makes sure the working directory exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryBootstrap;

#[async_trait]
impl EnvironmentBootstrap for DirectoryBootstrap {
    async fn prepare(&self, _: &PluginDeclaration, working_path: &Path) -> Result<(), RuntimeError> {
        tokio::fs::create_dir_all(working_path)
            .await
            .map_err(|e| RuntimeError::Init(format!("{}: {e}", working_path.display())))
    }
}

#[derive(Clone)]
pub struct LocalRuntimeConfig {
    pub holder: HolderConfig,
    pub proxy: ProxyConfig,
    pub bootstrap: Arc<dyn EnvironmentBootstrap>,
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self {
            holder: HolderConfig::default(),
            proxy: ProxyConfig::default(),
            bootstrap: Arc::new(DirectoryBootstrap),
        }
    }
}

// ============================================================================
// LocalPluginRuntime
// ============================================================================

pub struct LocalPluginRuntime {
    core: Arc<RuntimeCore>,
    declaration: PluginDeclaration,
    config: LocalRuntimeConfig,
    pool: WorkerPool,
    holder: RwLock<Option<Arc<StdioHolder>>>,
    exited: Mutex<Option<CancellationToken>>,
}

impl LocalPluginRuntime {
    pub fn new(
        declaration: PluginDeclaration,
        working_path: impl Into<std::path::PathBuf>,
        config: LocalRuntimeConfig,
        pool: WorkerPool,
    ) -> Self {
        Self {
            core: Arc::new(RuntimeCore::new(declaration.identity(), working_path)),
            declaration,
            config,
            pool,
            holder: RwLock::new(None),
            exited: Mutex::new(None),
        }
    }

    pub fn declaration(&self) -> &PluginDeclaration {
        &self.declaration
    }

    /// Transport of the current plugin instance.
    pub fn holder(&self) -> Option<Arc<StdioHolder>> {
        self.holder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let decl = &self.declaration;
        let dir = decl
            .working_dir
            .clone()
            .unwrap_or_else(|| self.core.working_path());

        let mut cmd = Command::new(&decl.command);
        cmd.args(&decl.args)
            .current_dir(dir)
            .env("INSTALL_METHOD", "local")
            .envs(self.config.proxy.env_vars())
            .envs(&decl.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // On Linux, set PR_SET_PDEATHSIG so the plugin dies with the daemon
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
    }

    /// Run one plugin instance until it exits or goes quiet.
    async fn run_instance(&self, mut child: Child) -> Result<(), RuntimeError> {
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            return Err(RuntimeError::Spawn(std::io::Error::other("plugin stdio is not piped")));
        };

        let holder = Arc::new(StdioHolder::new(
            self.core.identity(),
            Box::new(stdin),
            Box::new(stdout),
            Box::new(stderr),
            self.config.holder.clone(),
        ));
        *self.holder.write().unwrap_or_else(PoisonError::into_inner) = Some(holder.clone());

        // A stop that raced the spawn has not seen this holder.
        let stop = self.core.stop_token();
        if stop.is_cancelled() {
            holder.stop();
            graceful_kill(&mut child).await;
            return Err(RuntimeError::Stopped);
        }
        self.core.set_status(RuntimeStatus::Active);
        info!(plugin = %self.core.identity(), pid = ?child.id(), "Plugin process started");

        let reader = holder.clone();
        let core = self.core.clone();
        let submitted = self
            .pool
            .submit("local_runtime", "stdout", async move {
                if let Err(e) = reader.start_stdout(move || core.set_active_at_now()).await {
                    warn!(error = %e, "Plugin stdout reader did not start");
                }
            })
            .and_then(|()| {
                let reader = holder.clone();
                self.pool
                    .submit("local_runtime", "stderr", async move { reader.start_stderr().await })
            });
        if let Err(e) = submitted {
            holder.stop();
            graceful_kill(&mut child).await;
            return Err(e.into());
        }

        let waited = tokio::select! {
            waited = holder.wait() => waited,
            _ = stop.cancelled() => Ok(()),
        };
        holder.stop();
        if let Err(e) = &waited {
            warn!(plugin = %self.core.identity(), error = %e, "Plugin instance ended");
        }

        graceful_kill(&mut child).await;
        let status = child.try_wait().ok().flatten();
        info!(
            plugin = %self.core.identity(),
            status = ?status,
            stderr = holder.error().as_deref().unwrap_or(""),
            "Plugin process exited"
        );
        Ok(())
    }
}

#[async_trait]
impl PluginRuntime for LocalPluginRuntime {
    fn core(&self) -> &RuntimeCore {
        &self.core
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Local
    }

    fn listen(&self, session_id: &str) -> Result<Broadcast<SessionMessage>, RuntimeError> {
        let holder = self.holder().ok_or(RuntimeError::NotStarted)?;
        Ok(holder.listen_session(session_id))
    }

    async fn write(
        &self,
        _session_id: &str,
        _action: &AccessAction,
        data: &[u8],
    ) -> Result<(), RuntimeError> {
        let holder = self.holder().ok_or(RuntimeError::NotStarted)?;
        holder.write_line(data).await?;
        Ok(())
    }
}

#[async_trait]
impl FullDuplexLifetime for LocalPluginRuntime {
    async fn init(&self) -> Result<(), RuntimeError> {
        let working_path = self.core.working_path();
        self.config
            .bootstrap
            .prepare(&self.declaration, &working_path)
            .await?;
        debug!(plugin = %self.core.identity(), path = %working_path.display(), "Plugin environment ready");
        Ok(())
    }

    async fn start_plugin(&self) -> Result<(), RuntimeError> {
        let exited = CancellationToken::new();
        *self.exited.lock().unwrap_or_else(PoisonError::into_inner) = Some(exited.clone());
        let _exit = exited.drop_guard();

        if self.core.stopped() {
            return Err(RuntimeError::Stopped);
        }
        let child = self.spawn().map_err(RuntimeError::Spawn)?;
        self.run_instance(child).await
    }

    fn wait(&self) -> Result<CancellationToken, RuntimeError> {
        self.exited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RuntimeError::NotStarted)
    }

    async fn stop(&self) {
        self.core.stop();
        if let Some(holder) = self.holder() {
            holder.stop();
        }
    }

    async fn cleanup(&self) {
        let path = self.core.working_path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(plugin = %self.core.identity(), path = %path.display(), "Working directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                plugin = %self.core.identity(),
                path = %path.display(),
                error = %e,
                "Failed to remove working directory"
            ),
        }
    }
}

/// SIGTERM, wait 5s, SIGKILL.
async fn graceful_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: the pid comes from a live Child handle.
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        debug!(pid, "Plugin didn't exit after SIGTERM, sending SIGKILL");
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn declaration(script: &str) -> PluginDeclaration {
        PluginDeclaration {
            name: "shell".into(),
            version: "0.0.1".into(),
            author: "acme".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    struct CountingBootstrap(AtomicU32);

    #[async_trait]
    impl EnvironmentBootstrap for CountingBootstrap {
        async fn prepare(&self, _: &PluginDeclaration, path: &Path) -> Result<(), RuntimeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::fs::create_dir_all(path).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn init_prepares_and_cleanup_removes_working_dir() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("acme").join("shell-0.0.1@abc");
        let bootstrap = Arc::new(CountingBootstrap(AtomicU32::new(0)));
        let config = LocalRuntimeConfig {
            bootstrap: bootstrap.clone(),
            ..LocalRuntimeConfig::default()
        };
        let runtime = LocalPluginRuntime::new(declaration("true"), &path, config, WorkerPool::new(4));

        runtime.init().await.unwrap();
        assert!(path.is_dir());
        assert_eq!(bootstrap.0.load(Ordering::SeqCst), 1);

        runtime.cleanup().await;
        assert!(!path.exists());
        runtime.cleanup().await;
    }

    #[tokio::test]
    async fn listen_before_start_fails() {
        let runtime = LocalPluginRuntime::new(
            declaration("true"),
            "/tmp/never",
            LocalRuntimeConfig::default(),
            WorkerPool::new(4),
        );
        assert!(matches!(runtime.listen("s"), Err(RuntimeError::NotStarted)));
        assert!(matches!(runtime.wait(), Err(RuntimeError::NotStarted)));
    }

    #[tokio::test]
    async fn exited_process_resolves_wait_token() {
        let root = tempfile::tempdir().unwrap();
        let runtime = LocalPluginRuntime::new(
            declaration("echo oops >&2; exit 3"),
            root.path(),
            LocalRuntimeConfig::default(),
            WorkerPool::new(4),
        );
        runtime.init().await.unwrap();
        runtime.start_plugin().await.unwrap();

        assert!(runtime.wait().unwrap().is_cancelled());
        assert_eq!(runtime.core().status(), RuntimeStatus::Active);
        assert!(runtime.holder().unwrap().is_stopped());
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let root = tempfile::tempdir().unwrap();
        let mut decl = declaration("");
        decl.command = "/definitely/not/a/plugin".into();
        decl.args.clear();
        let runtime =
            LocalPluginRuntime::new(decl, root.path(), LocalRuntimeConfig::default(), WorkerPool::new(4));

        assert!(matches!(runtime.start_plugin().await, Err(RuntimeError::Spawn(_))));
        assert!(runtime.wait().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn start_after_stop_spawns_nothing() {
        let root = tempfile::tempdir().unwrap();
        let runtime = LocalPluginRuntime::new(
            declaration("sleep 30"),
            root.path(),
            LocalRuntimeConfig::default(),
            WorkerPool::new(4),
        );
        runtime.stop().await;

        assert!(matches!(runtime.start_plugin().await, Err(RuntimeError::Stopped)));
        assert!(runtime.holder().is_none());
        assert!(runtime.wait().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn stop_ends_running_instance() {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(LocalPluginRuntime::new(
            declaration("exec sleep 30"),
            root.path(),
            LocalRuntimeConfig::default(),
            WorkerPool::new(4),
        ));
        let mut status = runtime.core().subscribe();
        let running = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.start_plugin().await })
        };
        status
            .wait_for(|s| *s == RuntimeStatus::Active)
            .await
            .unwrap();

        runtime.stop().await;
        let ended = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .expect("instance outlived stop")
            .unwrap();
        assert!(ended.is_ok());
        assert!(runtime.wait().unwrap().is_cancelled());
        assert!(runtime.holder().unwrap().is_stopped());
    }
}
