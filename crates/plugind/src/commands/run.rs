//! `plugind run`: launch and supervise plugins until interrupted.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use plugind::config::Config;
use plugind::pool::WorkerPool;
use plugind::runtime::PluginManager;
use plugind::transport::tcp::{DEFAULT_HANDSHAKE_TIMEOUT, RemoteConnection, accept_loop};

/// Handshaken connections waiting to be adopted by the manager.
const REMOTE_BACKLOG: usize = 16;

pub async fn run(config_path: &str) -> Result<()> {
    let config = super::load_config(config_path).await?;

    let pool = WorkerPool::new(config.pool.size);
    let manager = PluginManager::new(config.manager_config(Path::new(config_path)), pool);
    let shutdown = CancellationToken::new();

    if config.remote.enabled {
        start_remote(&config, &manager, shutdown.clone()).await?;
    }

    let mut failed = 0;
    for (identity, outcome) in manager.launch_all(&config.plugins).await {
        match outcome {
            Ok(()) => info!(plugin = %identity, "Plugin launched"),
            Err(e) => {
                failed += 1;
                error!(plugin = %identity, error = %e, "Plugin failed to launch");
            }
        }
    }
    info!(
        running = manager.len(),
        failed,
        "plugind is running, press Ctrl+C to stop"
    );

    shutdown_signal().await;

    shutdown.cancel();
    manager.shutdown().await;
    info!("plugind stopped");
    Ok(())
}

/// Bind the remote listener and hand authenticated connections to `manager`.
async fn start_remote(
    config: &Config,
    manager: &PluginManager,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.remote.host, config.remote.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind remote listener on {addr}"))?;

    let pool = manager.pool().clone();
    let (tx, mut rx) = mpsc::channel::<RemoteConnection>(REMOTE_BACKLOG);
    pool.submit(
        "remote",
        "accept_loop",
        accept_loop(
            pool.clone(),
            listener,
            config.remote.key.clone(),
            DEFAULT_HANDSHAKE_TIMEOUT,
            tx,
            shutdown,
        ),
    )?;

    let manager = manager.clone();
    pool.submit("remote", "register", async move {
        while let Some(conn) = rx.recv().await {
            let peer = conn.peer;
            if let Err(e) = manager.register_remote(conn).await {
                warn!(peer = %peer, error = %e, "Remote plugin rejected");
            }
        }
    })?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
