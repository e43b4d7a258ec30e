//! Unix socket client for `gpu-grabd`. Opens one connection per request.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use grab_core::protocol::{decode_line, encode_line, Request, Response};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Send one request and decode the reply payload. A daemon-side failure
    /// comes back as an error carrying the daemon's message.
    pub async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let response = self.send(request).await?;
        Ok(response.into_data()?)
    }

    async fn send(&self, request: &Request) -> Result<Response> {
        let stream = self.connect().await?;
        debug!(action = request.action(), socket = %self.socket_path.display(), "sending request");

        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(&encode_line(request)?)
            .await
            .context("failed to send request")?;

        let mut line = String::new();
        let read = tokio::time::timeout(
            RESPONSE_TIMEOUT,
            BufReader::new(read_half).read_line(&mut line),
        )
        .await
        .context("timed out waiting for the daemon to answer")?
        .context("failed to read response")?;
        if read == 0 {
            bail!("daemon closed the connection without answering");
        }
        decode_line(&line).context("daemon sent an unreadable response")
    }

    async fn connect(&self) -> Result<UnixStream> {
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.kind() == ErrorKind::NotFound => bail!(
                "no daemon socket at {}. Is gpu-grabd running?",
                self.socket_path.display()
            ),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => bail!(
                "connection refused on {}. The daemon may have stopped; start gpu-grabd",
                self.socket_path.display()
            ),
            Err(e) => Err(e).with_context(|| {
                format!("failed to connect to {}", self.socket_path.display())
            }),
        }
    }
}
