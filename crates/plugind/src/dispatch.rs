//! Generic invocation: one outbound request, one typed result stream.
//!
//! Every typed plugin RPC goes through [`Dispatcher::invoke`]. It listens on
//! the session's transport, writes the request, and turns the plugin's
//! `stream` / `end` / `error` / `invoke` session messages into a
//! [`Stream`] of decoded items.
//!
//! The transport callback runs inline on the holder's reader, so it only
//! enqueues. A pool task drains the queue into the result stream, which keeps
//! a slow consumer from stalling other sessions on the same plugin.

use std::sync::Arc;

use plugind_protocol::{ErrorResponse, EventStream, SessionMessage, SessionMessageType};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backwards;
use crate::pool::{PoolError, WorkerPool};
use crate::runtime::RuntimeError;
use crate::session::{Session, SessionError};
use crate::stream::Stream;

/// Result stream capacity used by [`Dispatcher::new`].
pub const DEFAULT_RESPONSE_BUFFER: usize = 1024;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("plugin runtime not found for session {0}")]
    NoRuntime(String),

    #[error("request must serialize to a JSON object")]
    InvalidRequest,

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Clone)]
pub struct Dispatcher {
    pool: WorkerPool,
    response_buffer: usize,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            response_buffer: DEFAULT_RESPONSE_BUFFER,
        }
    }

    pub fn with_response_buffer(mut self, size: usize) -> Self {
        self.response_buffer = size.max(1);
        self
    }

    /// Send `request` on `session` and return the stream of decoded replies.
    ///
    /// The request is written as the session's access routing fields
    /// (`user_id`, `type`, `action`) merged with the fields of `request`.
    /// Closing the returned stream detaches it from the transport.
    pub async fn invoke<Req, Resp>(
        &self,
        session: &Arc<Session>,
        request: Req,
    ) -> Result<Stream<Resp>, DispatchError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let runtime = session
            .runtime()
            .ok_or_else(|| DispatchError::NoRuntime(session.id().to_string()))?;
        let body = request_body(session, request)?;

        let listener = runtime.listen(session.id())?;
        let response = Stream::<Resp>::new(self.response_buffer);

        let (tx, rx) = mpsc::unbounded_channel::<SessionMessage>();
        listener.listen(move |message| {
            // A closed receiver means the drain task is already done.
            let _ = tx.send(message.clone());
        });
        {
            let listener = listener.clone();
            response.on_close(move || listener.close());
        }

        let drain = drain(
            self.pool.clone(),
            Arc::clone(session),
            rx,
            response.clone(),
        );
        if let Err(e) = self.pool.submit("dispatch", "drain", drain) {
            listener.close();
            return Err(e.into());
        }

        let action = &session.payload().access_action;
        if let Err(e) = session.write(EventStream::Request, action, body).await {
            response.close();
            return Err(e.into());
        }

        debug!(
            session_id = %session.id(),
            plugin = %runtime.identity(),
            action = %action,
            "Request dispatched"
        );
        Ok(response)
    }
}

fn request_body<Req: Serialize>(
    session: &Session,
    request: Req,
) -> Result<Map<String, Value>, DispatchError> {
    let Value::Object(fields) = serde_json::to_value(request)? else {
        return Err(DispatchError::InvalidRequest);
    };

    let payload = session.payload();
    let mut body = Map::new();
    body.insert("user_id".into(), Value::String(payload.user_id.clone()));
    body.insert("type".into(), Value::String(payload.access_type.as_str().into()));
    body.insert(
        "action".into(),
        Value::String(payload.access_action.as_str().into()),
    );
    body.extend(fields);
    Ok(body)
}

/// Move session messages into `response` until the plugin ends the request,
/// fails it, or the transport goes away.
async fn drain<Resp>(
    pool: WorkerPool,
    session: Arc<Session>,
    mut rx: mpsc::UnboundedReceiver<SessionMessage>,
    response: Stream<Resp>,
) where
    Resp: DeserializeOwned + Send + 'static,
{
    while let Some(message) = rx.recv().await {
        if response.is_closed() {
            break;
        }
        match message.kind {
            SessionMessageType::Stream => match serde_json::from_str::<Resp>(message.data.get()) {
                Ok(item) => response.write_blocking(item).await,
                Err(e) => {
                    response.write_error(ErrorResponse::new(
                        "unmarshal error",
                        format!("unmarshal json failed: {e}"),
                    ));
                    break;
                }
            },
            SessionMessageType::Invoke => {
                if let Err(e) = backwards::invoke(&pool, &session, &message.data).await {
                    warn!(session_id = %session.id(), error = %e, "Backwards invocation rejected");
                    response.write_error(ErrorResponse::new(
                        "invoke_error",
                        format!("invoke failed: {e}"),
                    ));
                    break;
                }
            }
            SessionMessageType::End => break,
            SessionMessageType::Error => {
                let err = serde_json::from_str::<ErrorResponse>(message.data.get())
                    .unwrap_or_else(|_| ErrorResponse::new("plugin_error", message.data.get()));
                response.write_error(err);
                break;
            }
        }
    }
    response.close();
}
