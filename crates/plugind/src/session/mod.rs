//! Sessions: one logical request/response conversation with a plugin.
//!
//! Every outbound envelope carries the session ID, so the plugin's reply,
//! which arrives as a `session` event on the shared transport, can be routed
//! back to the listener registered under that same ID.
//!
//! - **Session**: routing context plus the runtime it is bound to.
//! - **SessionRegistry**: ID → session map, optionally backed by a
//!   [`SessionCache`] so other daemons can resolve the session.

mod registry;

pub use registry::SessionRegistry;

use std::sync::atomic::{AtomicBool, Ordering};
// std::sync::RwLock is correct here: bindings are cloned out before any .await.
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use plugind_protocol::{AccessAction, AccessType, EventStream, SessionEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::backwards::BackwardsInvocation;
use crate::runtime::{PluginRuntime, RuntimeError};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(String),

    #[error("session {0} has no runtime bound")]
    NoRuntime(String),

    #[error("failed to encode session message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("session cache error: {0}")]
    Cache(String),
}

// ============================================================================
// Session data
// ============================================================================

/// Routing and identity fields supplied by whoever opens the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    pub tenant_id: String,
    pub user_id: String,
    pub plugin_identity: String,
    pub access_type: AccessType,
    pub access_action: AccessAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// What the cache stores for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(flatten)]
    pub payload: SessionPayload,
}

/// External persistence for session routing data.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn store(&self, info: &SessionInfo) -> Result<(), SessionError>;

    async fn load(&self, id: &str) -> Result<Option<SessionInfo>, SessionError>;

    async fn delete(&self, id: &str) -> Result<(), SessionError>;
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    info: SessionInfo,
    runtime: RwLock<Option<Arc<dyn PluginRuntime>>>,
    backwards: RwLock<Option<Arc<dyn BackwardsInvocation>>>,
    closed: AtomicBool,
    registry: Weak<registry::Inner>,
}

impl Session {
    fn new(info: SessionInfo, registry: Weak<registry::Inner>) -> Self {
        Self {
            info,
            runtime: RwLock::new(None),
            backwards: RwLock::new(None),
            closed: AtomicBool::new(false),
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn payload(&self) -> &SessionPayload {
        &self.info.payload
    }

    pub fn bind_runtime(&self, runtime: Arc<dyn PluginRuntime>) {
        *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
    }

    pub fn runtime(&self) -> Option<Arc<dyn PluginRuntime>> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn bind_backwards_invocation(&self, invocation: Arc<dyn BackwardsInvocation>) {
        *self.backwards.write().unwrap_or_else(PoisonError::into_inner) = Some(invocation);
    }

    pub fn backwards_invocation(&self) -> Option<Arc<dyn BackwardsInvocation>> {
        self.backwards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serialize `data` into a session envelope and send it to the bound
    /// runtime.
    pub async fn write<D: Serialize>(
        &self,
        event: EventStream,
        action: &AccessAction,
        data: D,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.info.id.clone()));
        }
        let runtime = self
            .runtime()
            .ok_or_else(|| SessionError::NoRuntime(self.info.id.clone()))?;

        let payload = &self.info.payload;
        let envelope = SessionEnvelope {
            session_id: self.info.id.clone(),
            conversation_id: payload.conversation_id.clone(),
            message_id: payload.message_id.clone(),
            app_id: payload.app_id.clone(),
            endpoint_id: payload.endpoint_id.clone(),
            context: payload.context.clone(),
            event,
            data,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        runtime.write(&self.info.id, action, &bytes).await?;
        Ok(())
    }

    /// Remove the session from its registry. Repeated calls are no-ops.
    pub async fn close(&self, ignore_cache: bool) {
        self.mark_closed();
        if let Some(inner) = self.registry.upgrade() {
            SessionRegistry::from_inner(inner)
                .close(&self.info.id, ignore_cache)
                .await;
        }
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(session_id = %self.info.id, "Session closed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broadcast::Broadcast;
    use crate::runtime::{RuntimeCore, RuntimeType};
    use plugind_protocol::SessionMessage;
    use std::sync::Mutex;

    /// Runtime that records everything written to it.
    pub(crate) struct RecordingRuntime {
        core: RuntimeCore,
        pub(crate) writes: Mutex<Vec<(String, String, Value)>>,
        pub(crate) broadcast: Broadcast<SessionMessage>,
    }

    impl RecordingRuntime {
        pub(crate) fn new() -> Self {
            Self {
                core: RuntimeCore::new("acme/rec:0.0.1", "/tmp/rec"),
                writes: Mutex::new(Vec::new()),
                broadcast: Broadcast::new(),
            }
        }

        pub(crate) fn written(&self) -> Vec<(String, String, Value)> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PluginRuntime for RecordingRuntime {
        fn core(&self) -> &RuntimeCore {
            &self.core
        }

        fn runtime_type(&self) -> RuntimeType {
            RuntimeType::Local
        }

        fn listen(&self, _session_id: &str) -> Result<Broadcast<SessionMessage>, RuntimeError> {
            Ok(self.broadcast.clone())
        }

        async fn write(
            &self,
            session_id: &str,
            action: &AccessAction,
            data: &[u8],
        ) -> Result<(), RuntimeError> {
            let value: Value = serde_json::from_slice(data).unwrap();
            self.writes
                .lock()
                .unwrap()
                .push((session_id.to_string(), action.to_string(), value));
            Ok(())
        }
    }

    pub(crate) fn payload() -> SessionPayload {
        SessionPayload {
            tenant_id: "tenant-1".into(),
            user_id: "user-1".into(),
            plugin_identity: "acme/rec:0.0.1".into(),
            access_type: AccessType::Tool,
            access_action: AccessAction::new(AccessAction::INVOKE_TOOL),
            conversation_id: Some("conv-1".into()),
            message_id: None,
            app_id: Some("app-1".into()),
            endpoint_id: None,
            context: Map::new(),
        }
    }

    #[tokio::test]
    async fn write_without_runtime_fails() {
        let registry = SessionRegistry::new();
        let session = registry.create(payload(), true).await.unwrap();
        let err = session
            .write(EventStream::Request, &session.payload().access_action, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn envelope_carries_session_routing() {
        let registry = SessionRegistry::new();
        let session = registry.create(payload(), true).await.unwrap();
        let runtime = Arc::new(RecordingRuntime::new());
        session.bind_runtime(runtime.clone());

        session
            .write(
                EventStream::Request,
                &AccessAction::new(AccessAction::INVOKE_TOOL),
                serde_json::json!({"tool": "search"}),
            )
            .await
            .unwrap();

        let written = runtime.written();
        assert_eq!(written.len(), 1);
        let (sid, action, value) = &written[0];
        assert_eq!(sid, session.id());
        assert_eq!(action, "invoke_tool");
        assert_eq!(value["session_id"], session.id());
        assert_eq!(value["conversation_id"], "conv-1");
        assert_eq!(value["app_id"], "app-1");
        assert_eq!(value["event"], "request");
        assert_eq!(value["data"]["tool"], "search");
        assert!(value.get("message_id").is_none());
    }

    #[tokio::test]
    async fn closed_session_rejects_writes() {
        let registry = SessionRegistry::new();
        let session = registry.create(payload(), true).await.unwrap();
        session.bind_runtime(Arc::new(RecordingRuntime::new()));

        session.close(true).await;
        session.close(true).await;

        assert!(session.is_closed());
        assert!(registry.is_empty());
        assert!(matches!(
            session
                .write(EventStream::Request, &session.payload().access_action, 1)
                .await,
            Err(SessionError::Closed(_))
        ));
    }

    #[test]
    fn info_serializes_flat() {
        let info = SessionInfo {
            id: "s-1".into(),
            payload: payload(),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["id"], "s-1");
        assert_eq!(value["access_type"], "tool");
        assert_eq!(value["access_action"], "invoke_tool");

        let back: SessionInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back.payload.tenant_id, "tenant-1");
    }
}
