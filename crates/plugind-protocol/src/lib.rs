//! Wire types for the plugind plugin event protocol.
//!
//! Plugins talk to the daemon over one duplex byte stream (stdio pipes or a
//! TCP socket) using JSON Lines:
//!
//! - **Events** (plugin → daemon): [`PluginUniversalEvent`] envelopes whose
//!   `event` field selects how `data` is interpreted.
//! - **Session messages** (daemon → plugin): [`SessionEnvelope`] objects that
//!   always carry the session ID so replies can be routed back.
//!
//! Within a `session` event, `data` is itself a [`SessionMessage`] whose
//! payload is forwarded to the caller that owns the session.
//!
//! # Example
//!
//! ```ignore
//! use plugind_protocol::{PluginEventType, PluginUniversalEvent};
//!
//! let event: PluginUniversalEvent = serde_json::from_str(line)?;
//! if event.event == PluginEventType::Heartbeat {
//!     // reset the liveness timer
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

// ============================================================================
// Universal Envelope (Plugin → Daemon)
// ============================================================================

/// Kind of a line emitted by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginEventType {
    /// Structured log line, `data` is a [`PluginLogEvent`].
    Log,
    /// Reply traffic for one session, `data` is forwarded verbatim.
    Session,
    /// Process-level failure reported by the plugin.
    Error,
    /// Liveness signal. The payload is ignored.
    Heartbeat,
}

/// One line of plugin output.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginUniversalEvent {
    #[serde(default)]
    pub session_id: String,
    pub event: PluginEventType,
    /// Event-specific payload, kept as raw JSON so it can be forwarded
    /// without re-encoding.
    #[serde(default = "null_raw")]
    pub data: Box<RawValue>,
}

fn null_raw() -> Box<RawValue> {
    RawValue::NULL.to_owned()
}

/// Payload of a `log` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginLogEvent {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: f64,
}

// ============================================================================
// Session Messages
// ============================================================================

/// Discriminator of a [`SessionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessageType {
    /// One item of the typed result stream.
    Stream,
    /// The plugin finished the request.
    End,
    /// The plugin failed the request, `data` is an [`ErrorResponse`].
    Error,
    /// The plugin calls back into the host (backwards invocation).
    Invoke,
}

/// Payload of a `session` event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionMessage {
    #[serde(rename = "type")]
    pub kind: SessionMessageType,
    #[serde(default = "null_raw")]
    pub data: Box<RawValue>,
}

/// Structured error reported by a plugin or produced by the dispatcher.
///
/// `Display` renders the JSON form so it can travel through string-typed
/// error channels and be parsed back on the other side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            args: BTreeMap::new(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl std::error::Error for ErrorResponse {}

// ============================================================================
// Outbound Envelope (Daemon → Plugin)
// ============================================================================

/// Direction of an outbound session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStream {
    /// A new request for the plugin.
    Request,
    /// A reply to a backwards invocation the plugin made.
    Response,
}

/// Outbound message written to a plugin for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnvelope<D> {
    pub session_id: String,
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
    pub event: EventStream,
    pub data: D,
}

// ============================================================================
// Access Routing
// ============================================================================

/// Category of plugin capability a session targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Tool,
    Model,
    Endpoint,
    AgentStrategy,
    #[serde(rename = "oauth")]
    OAuth,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Model => "model",
            Self::Endpoint => "endpoint",
            Self::AgentStrategy => "agent_strategy",
            Self::OAuth => "oauth",
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation within an [`AccessType`], e.g. `invoke_tool`.
///
/// Kept open-ended: plugins can expose actions the daemon does not know.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessAction(pub String);

impl AccessAction {
    pub const INVOKE_TOOL: &'static str = "invoke_tool";
    pub const VALIDATE_TOOL_CREDENTIALS: &'static str = "validate_tool_credentials";
    pub const INVOKE_LLM: &'static str = "invoke_llm";
    pub const INVOKE_TEXT_EMBEDDING: &'static str = "invoke_text_embedding";
    pub const INVOKE_RERANK: &'static str = "invoke_rerank";
    pub const INVOKE_TTS: &'static str = "invoke_tts";
    pub const INVOKE_SPEECH2TEXT: &'static str = "invoke_speech2text";
    pub const INVOKE_MODERATION: &'static str = "invoke_moderation";
    pub const INVOKE_ENDPOINT: &'static str = "invoke_endpoint";

    pub fn new(action: impl Into<String>) -> Self {
        Self(action.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Backwards Invocation (Plugin → Host calls)
// ============================================================================

/// Host capability a plugin may call back into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeType {
    Tool,
    Llm,
    // Historical spelling kept for wire compatibility.
    #[serde(rename = "llm_structored_output", alias = "llm_structured_output")]
    LlmStructuredOutput,
    TextEmbedding,
    Rerank,
    Tts,
    #[serde(rename = "speech2text")]
    Speech2Text,
    Moderation,
    App,
    Storage,
    Encrypt,
    UploadFile,
    FetchApp,
}

impl InvokeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Llm => "llm",
            Self::LlmStructuredOutput => "llm_structored_output",
            Self::TextEmbedding => "text_embedding",
            Self::Rerank => "rerank",
            Self::Tts => "tts",
            Self::Speech2Text => "speech2text",
            Self::Moderation => "moderation",
            Self::App => "app",
            Self::Storage => "storage",
            Self::Encrypt => "encrypt",
            Self::UploadFile => "upload_file",
            Self::FetchApp => "fetch_app",
        }
    }
}

impl fmt::Display for InvokeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an `invoke` session message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackwardsRequest {
    #[serde(rename = "type")]
    pub kind: InvokeType,
    pub backwards_request_id: String,
    pub request: Map<String, Value>,
}

/// Event kinds of a backwards invocation reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackwardsEvent {
    Response,
    Error,
    End,
}

/// Reply frame written back to the plugin for a backwards invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackwardsResponse {
    pub backwards_request_id: String,
    pub event: BackwardsEvent,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl BackwardsResponse {
    pub fn response(id: impl Into<String>, message: impl Into<String>, data: Value) -> Self {
        Self {
            backwards_request_id: id.into(),
            event: BackwardsEvent::Response,
            message: message.into(),
            data,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backwards_request_id: id.into(),
            event: BackwardsEvent::Error,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self {
            backwards_request_id: id.into(),
            event: BackwardsEvent::End,
            message: String::new(),
            data: Value::Null,
        }
    }
}

// ============================================================================
// Remote Handshake
// ============================================================================

/// First line a remote plugin sends after connecting over TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHandshake {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
}

// ============================================================================
// Tests
// ============================================================================
