//! plugind: a supervisor for plugin processes that multiplexes request
//! sessions over a single stdio or TCP stream.

pub mod backwards;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod pool;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod sync;
pub mod transport;

pub mod build_info {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
