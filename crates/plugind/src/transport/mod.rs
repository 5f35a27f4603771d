//! Plugin transport: framing, event parsing and per-session routing over a
//! child's stdio pipes or a TCP connection.

pub mod event;
pub mod holder;
pub mod tcp;

use thiserror::Error;

pub use event::{PluginEvent, parse_universal_event};
pub use holder::{HolderConfig, StdioHolder};

/// Maximum number of bytes kept in a holder's rolling error buffer.
pub const MAX_ERR_MSG_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("plugin {identity} is not active (no traffic for {idle_secs}s)")]
    PluginNotActive { identity: String, idle_secs: u64 },

    #[error("plugin exited: {0}")]
    Exited(String),

    #[error("transport is stopped")]
    Stopped,

    #[error("stdout reader already started")]
    AlreadyStarted,

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
