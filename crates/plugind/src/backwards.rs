//! Backwards invocation: a plugin calling back into the host mid-session.
//!
//! The plugin sends an `invoke` session message carrying a
//! [`BackwardsRequest`]. The host runs it against whatever
//! [`BackwardsInvocation`] the session is bound to and streams the result back
//! as `response` envelopes, always finishing with an `end` frame.

use std::sync::Arc;

use async_trait::async_trait;
use plugind_protocol::{AccessType, BackwardsRequest, BackwardsResponse, EventStream, InvokeType};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pool::{PoolError, WorkerPool};
use crate::session::Session;
use crate::stream::Stream;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BackwardsError {
    #[error("malformed backwards request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ============================================================================
// Host capabilities
// ============================================================================

/// Host-side services a plugin may call back into.
///
/// `invoke_stream` serves the kinds that produce a sequence of chunks (tools,
/// LLMs, TTS, apps); `invoke_unary` serves the single-result kinds.
#[async_trait]
pub trait BackwardsInvocation: Send + Sync {
    async fn invoke_stream(
        &self,
        kind: InvokeType,
        request: Map<String, Value>,
    ) -> Result<Stream<Value>, BackwardsError>;

    async fn invoke_unary(
        &self,
        kind: InvokeType,
        request: Map<String, Value>,
    ) -> Result<Value, BackwardsError>;
}

/// How the result of an invocation kind is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyShape {
    Stream,
    Unary,
    Unsupported,
}

fn reply_shape(kind: InvokeType) -> ReplyShape {
    match kind {
        InvokeType::Tool
        | InvokeType::Llm
        | InvokeType::LlmStructuredOutput
        | InvokeType::Tts
        | InvokeType::App => ReplyShape::Stream,
        InvokeType::TextEmbedding
        | InvokeType::Rerank
        | InvokeType::Speech2Text
        | InvokeType::Moderation
        | InvokeType::Storage
        | InvokeType::UploadFile
        | InvokeType::FetchApp => ReplyShape::Unary,
        InvokeType::Encrypt => ReplyShape::Unsupported,
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Handle the `data` of an `invoke` session message.
///
/// Parse failures are returned to the caller. Everything after that is
/// reported to the plugin in-band: the work runs on `pool` and the reply
/// always ends with an `end` frame.
pub async fn invoke(
    pool: &WorkerPool,
    session: &Arc<Session>,
    data: &RawValue,
) -> Result<(), BackwardsError> {
    let request: BackwardsRequest = serde_json::from_str(data.get())?;
    let task = Task {
        session: Arc::clone(session),
        id: request.backwards_request_id,
        kind: request.kind,
        request: request.request,
    };

    if session.payload().access_type == AccessType::Model {
        task.write_error(format!("you can not invoke from {}", AccessType::Model))
            .await;
        task.end().await;
        return Ok(());
    }

    pool.submit("backwards", "invoke", async move {
        task.run().await;
        task.end().await;
    })?;
    Ok(())
}

// ============================================================================
// Task
// ============================================================================

struct Task {
    session: Arc<Session>,
    id: String,
    kind: InvokeType,
    request: Map<String, Value>,
}

impl Task {
    async fn run(&self) {
        let Some(invocation) = self.session.backwards_invocation() else {
            self.write_error("backwards invocation is not available".to_string())
                .await;
            return;
        };

        let mut request = self.request.clone();
        let payload = self.session.payload();
        request.insert("tenant_id".into(), Value::String(payload.tenant_id.clone()));
        request.insert("user_id".into(), Value::String(payload.user_id.clone()));
        request.insert("type".into(), Value::String(self.kind.as_str().into()));

        debug!(
            session_id = %self.session.id(),
            backwards_request_id = %self.id,
            kind = %self.kind,
            "Backwards invocation"
        );

        match reply_shape(self.kind) {
            ReplyShape::Stream => {
                let stream = match invocation.invoke_stream(self.kind, request).await {
                    Ok(s) => s,
                    Err(e) => {
                        self.write_error(format!("invoke {} failed: {e}", self.kind))
                            .await;
                        return;
                    }
                };
                while stream.next().await {
                    match stream.read() {
                        Ok(item) => self.write_response("stream", item).await,
                        Err(e) => {
                            self.write_error(format!("read {} failed: {e}", self.kind))
                                .await;
                            break;
                        }
                    }
                }
                stream.close();
            }
            ReplyShape::Unary => match invocation.invoke_unary(self.kind, request).await {
                Ok(value) => self.write_response("struct", value).await,
                Err(e) => {
                    self.write_error(format!("invoke {} failed: {e}", self.kind))
                        .await;
                }
            },
            ReplyShape::Unsupported => {
                self.write_error(format!("unsupported invoke type: {}", self.kind))
                    .await;
            }
        }
    }

    async fn write_response(&self, message: &str, data: Value) {
        self.send(BackwardsResponse::response(&self.id, message, data))
            .await;
    }

    async fn write_error(&self, message: String) {
        self.send(BackwardsResponse::error(&self.id, message)).await;
    }

    async fn end(&self) {
        self.send(BackwardsResponse::end(&self.id)).await;
    }

    async fn send(&self, frame: BackwardsResponse) {
        let action = &self.session.payload().access_action;
        if let Err(e) = self.session.write(EventStream::Response, action, frame).await {
            warn!(
                session_id = %self.session.id(),
                backwards_request_id = %self.id,
                error = %e,
                "Failed to write backwards response"
            );
        }
    }
}
