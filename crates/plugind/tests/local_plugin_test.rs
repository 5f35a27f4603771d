//! End-to-end tests driving a real `sh` plugin through the manager,
//! session registry and dispatcher.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use plugind::config::PluginDeclaration;
use plugind::dispatch::Dispatcher;
use plugind::pool::WorkerPool;
use plugind::runtime::{
    LocalPluginRuntime, ManagerConfig, PluginManager, PluginRuntime, RuntimeStatus,
};
use plugind::session::{SessionPayload, SessionRegistry};
use plugind::stream::Stream;
use plugind_protocol::{AccessAction, AccessType};
use serde::{Deserialize, Serialize};
use serde_json::Map;

/// Echoes one `pong-<session id>` chunk and an `end` for every request line.
const ECHO_PLUGIN: &str = r#"
echo '{"event":"heartbeat","data":{}}'
echo '{"event":"log","data":{"level":"info","message":"echo plugin ready","timestamp":0}}'
while IFS= read -r line; do
  sid=$(printf '%s\n' "$line" | sed 's/^{"session_id":"\([^"]*\)".*/\1/')
  echo "{\"session_id\":\"$sid\",\"event\":\"session\",\"data\":{\"type\":\"stream\",\"data\":{\"text\":\"pong-$sid\"}}}"
  echo "{\"session_id\":\"$sid\",\"event\":\"session\",\"data\":{\"type\":\"end\",\"data\":null}}"
done
"#;

#[derive(Serialize)]
struct EchoRequest {
    text: &'static str,
}

#[derive(Debug, Deserialize)]
struct EchoChunk {
    text: String,
}

fn declaration() -> PluginDeclaration {
    PluginDeclaration {
        name: "echo".into(),
        version: "0.1.0".into(),
        author: "acme".into(),
        command: "sh".into(),
        args: vec!["-c".into(), ECHO_PLUGIN.into()],
        env: BTreeMap::new(),
        working_dir: None,
    }
}

fn payload() -> SessionPayload {
    SessionPayload {
        tenant_id: "tenant".into(),
        user_id: "user".into(),
        plugin_identity: "acme/echo:0.1.0".into(),
        access_type: AccessType::Tool,
        access_action: AccessAction::new(AccessAction::INVOKE_TOOL),
        conversation_id: None,
        message_id: None,
        app_id: None,
        endpoint_id: None,
        context: Map::new(),
    }
}

async fn launch(manager: &PluginManager) -> Arc<LocalPluginRuntime> {
    let (runtime, launched) = manager.launch_local(&declaration()).await.unwrap();
    launched.wait().await.unwrap();

    let mut status = runtime.core().subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| *s == RuntimeStatus::Active),
    )
    .await
    .unwrap()
    .unwrap();
    runtime
}

async fn drain(stream: &Stream<EchoChunk>) -> Vec<String> {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut items = Vec::new();
        while stream.next().await {
            items.push(stream.read().unwrap().text);
        }
        items
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let pool = WorkerPool::new(64);
    let manager = PluginManager::new(
        ManagerConfig {
            working_path: root.path().to_path_buf(),
            ..ManagerConfig::default()
        },
        pool.clone(),
    );
    let runtime = launch(&manager).await;

    let registry = SessionRegistry::new();
    let session = registry.create(payload(), true).await.unwrap();
    session.bind_runtime(runtime.clone());

    let dispatcher = Dispatcher::new(pool);
    let stream: Stream<EchoChunk> = dispatcher
        .invoke(&session, EchoRequest { text: "ping" })
        .await
        .unwrap();

    assert_eq!(drain(&stream).await, vec![format!("pong-{}", session.id())]);

    session.close(true).await;
    assert!(registry.is_empty());
    manager.shutdown().await;
    assert!(runtime.core().stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sessions_receive_only_their_replies() {
    let root = tempfile::tempdir().unwrap();
    let pool = WorkerPool::new(64);
    let manager = PluginManager::new(
        ManagerConfig {
            working_path: root.path().to_path_buf(),
            ..ManagerConfig::default()
        },
        pool.clone(),
    );
    let runtime = launch(&manager).await;

    let registry = SessionRegistry::new();
    let dispatcher = Dispatcher::new(pool);

    let mut pending = Vec::new();
    for _ in 0..5 {
        let session = registry.create(payload(), true).await.unwrap();
        session.bind_runtime(runtime.clone());
        let stream: Stream<EchoChunk> = dispatcher
            .invoke(&session, EchoRequest { text: "ping" })
            .await
            .unwrap();
        pending.push((session, stream));
    }

    for (session, stream) in &pending {
        assert_eq!(drain(stream).await, vec![format!("pong-{}", session.id())]);
    }
    assert_eq!(runtime.identity(), "acme/echo:0.1.0");

    manager.shutdown().await;
}
