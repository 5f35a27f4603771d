//! TCP entry point for plugins that dial in.
//!
//! A peer connects and sends one JSON line, a [`RemoteHandshake`]. With a
//! valid key the connection halves are handed over as a
//! [`RemoteConnection`]; otherwise a one-line reason is written back and the
//! connection is dropped.

use std::net::SocketAddr;
use std::time::Duration;

use plugind_protocol::RemoteHandshake;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransportError;
use super::holder::{BoxedReader, BoxedWriter};
use crate::pool::WorkerPool;

/// Longest handshake line accepted.
const MAX_HANDSHAKE_LEN: u64 = 64 * 1024;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An authenticated plugin connection.
pub struct RemoteConnection {
    pub peer: SocketAddr,
    pub handshake: RemoteHandshake,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("peer", &self.peer)
            .field("name", &self.handshake.name)
            .field("version", &self.handshake.version)
            .finish_non_exhaustive()
    }
}

/// Accept connections until `shutdown` is cancelled or `tx` is closed.
///
/// Each handshake runs as its own `pool` task so a slow peer does not hold
/// up the accept loop.
pub async fn accept_loop(
    pool: WorkerPool,
    listener: TcpListener,
    key: String,
    handshake_timeout: Duration,
    tx: mpsc::Sender<RemoteConnection>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Accepting remote plugins");
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tx.closed() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Failed to accept remote plugin");
                continue;
            }
        };

        let key = key.clone();
        let tx = tx.clone();
        let submitted = pool.submit("remote", "handshake", async move {
            match handshake(stream, peer, &key, handshake_timeout).await {
                Ok(conn) => {
                    info!(peer = %peer, plugin = %conn.handshake.name, "Remote plugin authenticated");
                    if tx.send(conn).await.is_err() {
                        debug!(peer = %peer, "Remote plugin receiver is gone");
                    }
                }
                Err(e) => warn!(peer = %peer, error = %e, "Remote plugin handshake failed"),
            }
        });
        if let Err(e) = submitted {
            warn!(peer = %peer, error = %e, "Dropping remote plugin connection");
            break;
        }
    }

    debug!("Remote accept loop stopped");
}

/// Read and check the handshake line of a fresh connection.
pub async fn handshake(
    stream: TcpStream,
    peer: SocketAddr,
    key: &str,
    timeout: Duration,
) -> Result<RemoteConnection, TransportError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let read = tokio::time::timeout(
        timeout,
        (&mut reader).take(MAX_HANDSHAKE_LEN).read_line(&mut line),
    )
    .await;

    let reason = match read {
        Err(_) => "handshake timed out".to_string(),
        Ok(Err(e)) => return Err(TransportError::Io(e)),
        Ok(Ok(0)) => return Err(TransportError::Handshake("connection closed".into())),
        Ok(Ok(_)) => match serde_json::from_str::<RemoteHandshake>(line.trim_end()) {
            Err(e) => format!("malformed handshake: {e}"),
            Ok(hs) if !key_matches(&hs.key, key) => "invalid key".to_string(),
            Ok(hs) if hs.name.is_empty() || hs.version.is_empty() => {
                "name and version are required".to_string()
            }
            Ok(hs) => {
                return Ok(RemoteConnection {
                    peer,
                    handshake: hs,
                    reader: Box::new(reader),
                    writer: Box::new(write_half),
                });
            }
        },
    };

    let _ = write_half
        .write_all(format!("handshake failed: {reason}\n").as_bytes())
        .await;
    let _ = write_half.shutdown().await;
    Err(TransportError::Handshake(reason))
}

/// Constant-time key check. Digests are compared so the key length does not
/// leak either.
fn key_matches(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given.as_slice().ct_eq(expected.as_slice()).into()
}
