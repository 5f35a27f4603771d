//! Owner of one plugin connection's byte streams.
//!
//! A holder wraps a writer (child stdin or socket write half), a reader
//! (child stdout or socket read half) and an error reader (child stderr). It
//! frames the reader into JSON lines, routes `session` events to per-session
//! listeners, keeps a bounded tail of stderr output and runs the heartbeat
//! watchdog that detects a plugin which stopped talking.

use std::collections::HashMap;
// std::sync::Mutex is correct here: none of these locks is held across .await,
// and listener callbacks run after the map lock is released.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{PluginEvent, parse_universal_event};
use super::{MAX_ERR_MSG_LEN, TransportError};
use crate::broadcast::Broadcast;
use plugind_protocol::SessionMessage;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback receiving the raw `data` of a session event.
pub type SessionListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Stderr text older than this is not reported by [`StdioHolder::error`].
const ERROR_FRESHNESS: Duration = Duration::from_secs(60);

const STDERR_CHUNK: usize = 1024;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct HolderConfig {
    /// Initial capacity of the stdout line buffer.
    pub buffer_size: usize,
    /// Longest stdout line accepted.
    pub max_buffer_size: usize,
    /// Watchdog tick.
    pub check_interval: Duration,
    /// Silence longer than this marks the plugin inactive.
    pub max_heartbeat_interval: Duration,
}

impl Default for HolderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            max_buffer_size: 5 * 1024 * 1024,
            check_interval: Duration::from_secs(5),
            max_heartbeat_interval: Duration::from_secs(120),
        }
    }
}

// ============================================================================
// StdioHolder
// ============================================================================

struct ErrorBuffer {
    bytes: Vec<u8>,
    updated_at: Option<Instant>,
}

pub struct StdioHolder {
    identity: String,
    config: HolderConfig,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BoxedReader>>,
    err_reader: Mutex<Option<BoxedReader>>,
    listeners: Mutex<HashMap<String, SessionListener>>,
    errors: Mutex<ErrorBuffer>,
    last_active_at: Mutex<Instant>,
    stopped: CancellationToken,
}

impl StdioHolder {
    pub fn new(
        identity: impl Into<String>,
        writer: BoxedWriter,
        reader: BoxedReader,
        err_reader: BoxedReader,
        config: HolderConfig,
    ) -> Self {
        Self {
            identity: identity.into(),
            config,
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            err_reader: Mutex::new(Some(err_reader)),
            listeners: Mutex::new(HashMap::new()),
            errors: Mutex::new(ErrorBuffer {
                bytes: Vec::new(),
                updated_at: None,
            }),
            last_active_at: Mutex::new(Instant::now()),
            stopped: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn set_event_listener(&self, session_id: &str, listener: SessionListener) {
        lock(&self.listeners).insert(session_id.to_string(), listener);
    }

    pub fn remove_event_listener(&self, session_id: &str) {
        lock(&self.listeners).remove(session_id);
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Route decoded session messages for `session_id` into a broadcast.
    ///
    /// Undecodable payloads are logged and dropped. Closing the broadcast
    /// unregisters the listener.
    pub fn listen_session(self: &Arc<Self>, session_id: &str) -> Broadcast<SessionMessage> {
        let broadcast = Broadcast::new();

        let tx = broadcast.clone();
        let identity = self.identity.clone();
        let sid = session_id.to_string();
        self.set_event_listener(
            session_id,
            Arc::new(move |data: &[u8]| match serde_json::from_slice::<SessionMessage>(data) {
                Ok(message) => tx.send(&message),
                Err(e) => warn!(
                    plugin = %identity,
                    session_id = %sid,
                    error = %e,
                    "Failed to decode session message"
                ),
            }),
        );

        let holder = Arc::downgrade(self);
        let sid = session_id.to_string();
        broadcast.on_close(move || {
            if let Some(holder) = holder.upgrade() {
                holder.remove_event_listener(&sid);
            }
        });
        broadcast
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    /// Write raw bytes to the plugin. Callers add the line terminator.
    ///
    /// A write blocked on a plugin that stopped reading is abandoned by
    /// [`stop`](Self::stop) and fails with [`TransportError::Stopped`].
    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if self.is_stopped() {
            writer.take();
            return Err(TransportError::Stopped);
        }
        let Some(w) = writer.as_mut() else {
            return Err(TransportError::Stopped);
        };

        let written = tokio::select! {
            _ = self.stopped.cancelled() => None,
            result = async {
                w.write_all(data).await?;
                w.flush().await
            } => Some(result),
        };
        match written {
            Some(result) => Ok(result?),
            None => {
                writer.take();
                Err(TransportError::Stopped)
            }
        }
    }

    /// Write one JSON line.
    pub async fn write_line(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut line = Vec::with_capacity(data.len() + 1);
        line.extend_from_slice(data);
        line.push(b'\n');
        self.write(&line).await
    }

    // ------------------------------------------------------------------------
    // Input loops
    // ------------------------------------------------------------------------

    /// Read stdout line by line until EOF, a read error or [`stop`](Self::stop).
    ///
    /// Every non-empty line refreshes the liveness timestamp. The holder is
    /// stopped when this returns. Only the first call reads; later calls fail
    /// with [`TransportError::AlreadyStarted`].
    pub async fn start_stdout<F>(&self, on_heartbeat: F) -> Result<(), TransportError>
    where
        F: Fn() + Send + Sync,
    {
        let reader = lock(&self.reader)
            .take()
            .ok_or(TransportError::AlreadyStarted)?;
        self.touch();

        let codec = AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            Vec::new(),
            self.config.max_buffer_size,
        );
        let mut lines = FramedRead::with_capacity(reader, codec, self.config.buffer_size);

        loop {
            let next = tokio::select! {
                _ = self.stopped.cancelled() => break,
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
                    if line.is_empty() {
                        continue;
                    }
                    self.touch();
                    self.dispatch_line(line, &on_heartbeat);
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    error!(
                        plugin = %self.identity,
                        max = self.config.max_buffer_size,
                        "Plugin stdout line exceeds maximum length"
                    );
                    break;
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => {
                    error!(plugin = %self.identity, error = %e, "Plugin stdout read failed");
                    break;
                }
                None => {
                    debug!(plugin = %self.identity, "Plugin stdout closed");
                    break;
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn dispatch_line(&self, line: &[u8], on_heartbeat: &(dyn Fn() + Send + Sync)) {
        let event = match parse_universal_event(line, self.status_text()) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(diagnostic) => {
                error!(plugin = %self.identity, "{diagnostic}");
                return;
            }
        };

        match event {
            PluginEvent::Session { session_id, data } => {
                let listener = lock(&self.listeners).get(&session_id).cloned();
                match listener {
                    Some(listener) => listener(data.get().as_bytes()),
                    None => debug!(plugin = %self.identity, session_id, "No listener for session event"),
                }
            }
            PluginEvent::Heartbeat => on_heartbeat(),
            PluginEvent::Error(message) => {
                error!(plugin = %self.identity, "{message}");
            }
            PluginEvent::Log(log) => match log.level.as_str() {
                "debug" => debug!(plugin = %self.identity, "{}", log.message),
                "warn" | "warning" => warn!(plugin = %self.identity, "{}", log.message),
                "error" => error!(plugin = %self.identity, "{}", log.message),
                _ => info!(plugin = %self.identity, "{}", log.message),
            },
        }
    }

    /// Copy stderr into the rolling error buffer until EOF or stop.
    pub async fn start_stderr(&self) {
        let Some(mut reader) = lock(&self.err_reader).take() else {
            return;
        };

        let mut buf = [0u8; STDERR_CHUNK];
        loop {
            let read = tokio::select! {
                _ = self.stopped.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => self.write_error(&buf[..n]),
                Err(e) => {
                    debug!(plugin = %self.identity, error = %e, "Plugin stderr read failed");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Error buffer
    // ------------------------------------------------------------------------

    /// Append to the error buffer, discarding the oldest bytes beyond
    /// [`MAX_ERR_MSG_LEN`].
    pub fn write_error(&self, msg: &[u8]) {
        let msg = &msg[..msg.len().min(MAX_ERR_MSG_LEN)];
        let mut errors = lock(&self.errors);

        let total = errors.bytes.len() + msg.len();
        if total > MAX_ERR_MSG_LEN {
            let excess = (total - MAX_ERR_MSG_LEN).min(errors.bytes.len());
            errors.bytes.drain(..excess);
        }
        errors.bytes.extend_from_slice(msg);
        errors.updated_at = Some(Instant::now());
    }

    /// Buffered stderr text, if it was written within the last minute.
    pub fn error(&self) -> Option<String> {
        let errors = lock(&self.errors);
        let fresh = errors
            .updated_at
            .is_some_and(|at| at.elapsed() < ERROR_FRESHNESS);
        if fresh && !errors.bytes.is_empty() {
            Some(String::from_utf8_lossy(&errors.bytes).into_owned())
        } else {
            None
        }
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    fn touch(&self) {
        *lock(&self.last_active_at) = Instant::now();
    }

    pub fn last_active_at(&self) -> Instant {
        *lock(&self.last_active_at)
    }

    fn status_text(&self) -> &'static str {
        if self.is_stopped() { "stopped" } else { "running" }
    }

    /// Block until the holder stops or the plugin goes quiet.
    ///
    /// On stop, returns the recent stderr output as an error if there is any.
    /// Every `check_interval`, fails with [`TransportError::PluginNotActive`]
    /// once nothing was read for longer than `max_heartbeat_interval`.
    pub async fn wait(&self) -> Result<(), TransportError> {
        let period = self.config.check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => {
                    return match self.error() {
                        Some(msg) => Err(TransportError::Exited(msg)),
                        None => Ok(()),
                    };
                }
                _ = ticker.tick() => {
                    let idle = self.last_active_at().elapsed();
                    if idle > self.config.max_heartbeat_interval {
                        error!(
                            plugin = %self.identity,
                            idle_secs = idle.as_secs(),
                            "Plugin is not active"
                        );
                        return Err(TransportError::PluginNotActive {
                            identity: self.identity.clone(),
                            idle_secs: idle.as_secs(),
                        });
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stop the holder. Idempotent.
    ///
    /// Input loops exit and drop their halves; the writer is dropped now if
    /// no write is in flight, otherwise by the write being abandoned.
    pub fn stop(&self) {
        if self.stopped.is_cancelled() {
            return;
        }
        self.stopped.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        lock(&self.reader).take();
        lock(&self.err_reader).take();
        debug!(plugin = %self.identity, "Transport stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================
