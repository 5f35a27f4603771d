//! Full-duplex lifecycle supervision.
//!
//! [`full_duplex`] drives a [`FullDuplexLifetime`] through
//! init → start → wait → cooldown → restart until the runtime is stopped,
//! then tears it down. The launch outcome is reported once through a
//! [`LaunchSignal`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::launch::{LaunchError, LaunchSignal};
use super::{FullDuplexLifetime, RuntimeStatus, RuntimeType};
use crate::pool::panic_message;

pub const DEFAULT_RESTART_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_INIT_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Pause between a plugin exit and the next start. Not applied to
    /// remote runtimes.
    pub restart_cooldown: Duration,
    /// Init is declared failed once the failure count exceeds this.
    pub max_init_failures: u32,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            restart_cooldown: DEFAULT_RESTART_COOLDOWN,
            max_init_failures: DEFAULT_MAX_INIT_FAILURES,
        }
    }
}

/// Supervise `runtime` until it stops.
///
/// Teardown (`stop`, `cleanup`, on-stop hooks) always runs, including when
/// the lifecycle body panics; the panic is logged and not propagated. The
/// runtime reports [`torn_down`](super::RuntimeCore::torn_down) once teardown is complete.
///
/// The supervisor moves the runtime to `Launching` before the first start
/// and to `Restarting` before every later one. The runtime itself reports
/// `Active` once its transport is up.
pub async fn full_duplex(
    runtime: Arc<dyn FullDuplexLifetime>,
    signal: LaunchSignal,
    options: SupervisorOptions,
) {
    let body = AssertUnwindSafe(lifecycle(runtime.as_ref(), signal, options));
    if let Err(panic) = body.catch_unwind().await {
        error!(
            plugin = %runtime.identity(),
            panic = %panic_message(panic.as_ref()),
            "Plugin supervisor panicked"
        );
    }

    runtime.stop().await;
    runtime.cleanup().await;
    runtime.core().trigger_stop();
    runtime.core().mark_torn_down();
    info!(plugin = %runtime.identity(), "Plugin runtime torn down");
}

async fn lifecycle(runtime: &dyn FullDuplexLifetime, signal: LaunchSignal, options: SupervisorOptions) {
    let identity = runtime.identity().to_string();

    // ------------------------------------------------------------------------
    // Init
    // ------------------------------------------------------------------------

    let mut failures = 0u32;
    loop {
        if runtime.stopped() {
            signal.fail(LaunchError::Stopped(identity));
            return;
        }

        match runtime.init().await {
            Ok(()) => break,
            Err(e) => {
                failures += 1;
                warn!(plugin = %identity, attempt = failures, error = %e, "Plugin init failed");
                runtime.core().append_log(format!("init failed: {e}"));

                if failures > options.max_init_failures {
                    error!(plugin = %identity, attempts = failures, "Giving up on plugin init");
                    signal.fail(LaunchError::InitFailed {
                        identity,
                        attempts: failures,
                        last_error: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    signal.succeed();
    info!(plugin = %identity, "Plugin initialized");

    // ------------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------------

    let stop = runtime.core().stop_token();
    let mut status = RuntimeStatus::Launching;
    while !runtime.stopped() {
        runtime.core().set_status(status);
        status = RuntimeStatus::Restarting;

        if let Err(e) = runtime.start_plugin().await {
            if runtime.stopped() {
                break;
            }
            error!(plugin = %identity, error = %e, "Plugin start failed");
            runtime.core().append_log(format!("start failed: {e}"));
        }

        match runtime.wait() {
            Ok(exited) => {
                tokio::select! {
                    _ = exited.cancelled() => {}
                    _ = stop.cancelled() => {}
                }
            }
            Err(e) => debug!(plugin = %identity, error = %e, "Nothing to wait on"),
        }

        if runtime.runtime_type() != RuntimeType::Remote {
            tokio::select! {
                _ = tokio::time::sleep(options.restart_cooldown) => {}
                _ = stop.cancelled() => {}
            }
        }

        runtime.core().add_restarts();
        if !runtime.stopped() {
            info!(
                plugin = %identity,
                restarts = runtime.core().restarts(),
                "Restarting plugin"
            );
        }
    }
}
