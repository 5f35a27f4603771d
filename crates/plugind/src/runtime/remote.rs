//! Plugins that dial in over TCP, typically while being debugged.
//!
//! The connection is the plugin: there is nothing to restart, so once the
//! peer disconnects or goes quiet the runtime stops for good.

use std::sync::Arc;

use async_trait::async_trait;
use plugind_protocol::{AccessAction, RemoteHandshake, SessionMessage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{FullDuplexLifetime, PluginRuntime, RuntimeCore, RuntimeError, RuntimeStatus, RuntimeType};
use crate::broadcast::Broadcast;
use crate::pool::WorkerPool;
use crate::transport::holder::{BoxedReader, BoxedWriter};
use crate::transport::{HolderConfig, StdioHolder};

pub struct RemotePluginRuntime {
    core: Arc<RuntimeCore>,
    name: String,
    version: String,
    author: String,
    holder: Arc<StdioHolder>,
    pool: WorkerPool,
    exited: CancellationToken,
}

impl RemotePluginRuntime {
    /// Wrap an accepted, already authenticated connection.
    pub fn new(
        handshake: RemoteHandshake,
        reader: BoxedReader,
        writer: BoxedWriter,
        config: HolderConfig,
        pool: WorkerPool,
    ) -> Self {
        let identity = if handshake.author.is_empty() {
            format!("{}:{}", handshake.name, handshake.version)
        } else {
            format!("{}/{}:{}", handshake.author, handshake.name, handshake.version)
        };
        let holder = StdioHolder::new(
            identity.clone(),
            writer,
            reader,
            Box::new(tokio::io::empty()),
            config,
        );
        Self {
            core: Arc::new(RuntimeCore::new(identity, "")),
            name: handshake.name,
            version: handshake.version,
            author: handshake.author,
            holder: Arc::new(holder),
            pool,
            exited: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn author(&self) -> &str {
        &self.author
    }
}

#[async_trait]
impl PluginRuntime for RemotePluginRuntime {
    fn core(&self) -> &RuntimeCore {
        &self.core
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Remote
    }

    fn listen(&self, session_id: &str) -> Result<Broadcast<SessionMessage>, RuntimeError> {
        if self.holder.is_stopped() {
            return Err(RuntimeError::Stopped);
        }
        Ok(self.holder.listen_session(session_id))
    }

    async fn write(
        &self,
        _session_id: &str,
        _action: &AccessAction,
        data: &[u8],
    ) -> Result<(), RuntimeError> {
        self.holder.write_line(data).await?;
        Ok(())
    }
}

#[async_trait]
impl FullDuplexLifetime for RemotePluginRuntime {
    async fn init(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn start_plugin(&self) -> Result<(), RuntimeError> {
        let _exit = self.exited.clone().drop_guard();
        if self.holder.is_stopped() {
            self.core.stop();
            return Err(RuntimeError::Stopped);
        }

        self.core.set_status(RuntimeStatus::Active);
        info!(plugin = %self.core.identity(), "Remote plugin connected");

        let reader = self.holder.clone();
        let core = self.core.clone();
        if let Err(e) = self.pool.submit("remote_runtime", "stdout", async move {
            if let Err(e) = reader.start_stdout(move || core.set_active_at_now()).await {
                warn!(error = %e, "Remote plugin reader did not start");
            }
        }) {
            self.holder.stop();
            self.core.stop();
            return Err(e.into());
        }

        if let Err(e) = self.holder.wait().await {
            warn!(plugin = %self.core.identity(), error = %e, "Remote plugin connection ended");
        }
        self.holder.stop();
        self.core.stop();
        info!(plugin = %self.core.identity(), "Remote plugin disconnected");
        Ok(())
    }

    fn wait(&self) -> Result<CancellationToken, RuntimeError> {
        Ok(self.exited.clone())
    }

    async fn stop(&self) {
        self.core.stop();
        self.holder.stop();
    }

    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::launch::launch_channel;
    use crate::runtime::supervisor::{SupervisorOptions, full_duplex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    fn handshake() -> RemoteHandshake {
        RemoteHandshake {
            key: "k".into(),
            name: "dbg".into(),
            version: "0.0.1".into(),
            author: "acme".into(),
        }
    }

    #[tokio::test]
    async fn runtime_stops_when_peer_disconnects() {
        let (host_read, mut plugin_write) = duplex(1024);
        let (plugin_read, host_write) = duplex(1024);
        let runtime = Arc::new(RemotePluginRuntime::new(
            handshake(),
            Box::new(host_read),
            Box::new(host_write),
            HolderConfig::default(),
            WorkerPool::new(4),
        ));
        assert_eq!(runtime.identity(), "acme/dbg:0.0.1");
        assert_eq!(runtime.runtime_type(), RuntimeType::Remote);

        let (signal, result) = launch_channel();
        let supervisor = tokio::spawn(full_duplex(
            runtime.clone(),
            signal,
            SupervisorOptions::default(),
        ));
        result.wait().await.unwrap();

        let mut status = runtime.core().subscribe();
        status
            .wait_for(|s| *s == RuntimeStatus::Active)
            .await
            .unwrap();

        runtime
            .write("s-1", &AccessAction::new("invoke_tool"), b"{\"x\":1}")
            .await
            .unwrap();
        let mut lines = BufReader::new(plugin_read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"x\":1}");

        plugin_write
            .write_all(b"{\"event\":\"heartbeat\",\"data\":{}}\n")
            .await
            .unwrap();
        drop(plugin_write);

        supervisor.await.unwrap();
        assert!(runtime.core().stopped());
        assert_eq!(runtime.core().restarts(), 1);
        assert!(matches!(runtime.listen("s-2"), Err(RuntimeError::Stopped)));
    }
}
