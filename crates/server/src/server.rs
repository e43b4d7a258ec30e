//! Unix socket front end: one JSON request line per connection, one JSON
//! response line back.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use grab_core::protocol::{decode_line, encode_line, Request, Response, MAX_LINE_BYTES};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::handlers;
use crate::state::DaemonState;

/// Clients that connect but never send a full line are dropped after this.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind the daemon socket, replacing a stale one left by a crashed
/// instance. Fails when another daemon is still answering on it.
pub async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating socket directory {}", dir.display()))?;
    }
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            bail!("another daemon is already listening on {}", path.display());
        }
        info!(path = %path.display(), "removing stale socket");
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }

    let listener =
        UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("restricting permissions on {}", path.display()))?;
    info!(path = %path.display(), "listening");
    Ok(listener)
}

/// Accept connections until `shutdown` resolves. Each connection is
/// served on its own task.
pub async fn serve(
    listener: UnixListener,
    state: Arc<DaemonState>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            debug!(error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE_BYTES as u64);
    let mut line = String::new();

    let read = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("timed out waiting for request")?;

    let response = match read {
        Ok(0) => return Ok(()),
        Ok(_) if !line.ends_with('\n') && reader.limit() == 0 => {
            Response::error(format!("request exceeds {MAX_LINE_BYTES} bytes"))
        }
        Ok(_) => match decode_line::<Request>(&line) {
            Ok(request) => handlers::handle(state, request).await,
            Err(e) => Response::error(format!("invalid request: {e}")),
        },
        Err(e) => Response::error(format!("unreadable request: {e}")),
    };

    write_half.write_all(&encode_line(&response)?).await?;
    write_half.shutdown().await?;
    Ok(())
}
