//! The per-VM control channel.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    time::{sleep, timeout, Instant},
};
use tracing::{debug, trace};

use crate::{CorralError, CorralResult};

use super::{ControlRequest, ControlResponse};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The initial connect-retry delay during the startup window.
const INITIAL_BACKOFF: Duration = Duration::from_millis(25);

/// The connect-retry delay never grows beyond this.
const MAX_BACKOFF: Duration = Duration::from_millis(500);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A connected control channel to one hypervisor process.
///
/// There is at most one live channel per VM: the socket path is keyed by
/// `vm_id` and owned by the process serving it. Requests and responses are
/// newline-delimited JSON documents.
#[derive(Debug)]
pub struct ControlChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    socket_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ControlChannel {
    /// Connects to the socket, retrying with bounded exponential backoff.
    ///
    /// Immediately after process spawn the socket does not exist yet; retries
    /// cover exactly that startup window. Exhausting the window yields a
    /// timeout error; the caller decides how to surface it. Errors after a
    /// connection is established are never retried here.
    pub async fn connect(socket_path: impl AsRef<Path>, window: Duration) -> CorralResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let deadline = Instant::now() + window;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => {
                    debug!(socket = %socket_path.display(), "control channel connected");
                    let (read_half, write_half) = stream.into_split();
                    return Ok(Self {
                        reader: BufReader::new(read_half),
                        writer: write_half,
                        socket_path,
                    });
                }
                Err(e) => {
                    trace!(
                        socket = %socket_path.display(),
                        error = %e,
                        "control socket not ready"
                    );
                }
            }

            if Instant::now() + backoff > deadline {
                return Err(CorralError::Timeout {
                    operation: "control channel connect",
                    timeout: window,
                });
            }

            sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Issues one request and awaits its response, bounded by a deadline.
    ///
    /// Any error response is surfaced as fatal: after the channel is up,
    /// a failure means a malformed request or an unrecoverable hypervisor
    /// fault, and retrying cannot help.
    pub async fn call(
        &mut self,
        request: &ControlRequest,
        deadline: Duration,
    ) -> CorralResult<()> {
        let operation = request.operation();
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let response = timeout(deadline, self.roundtrip(line))
            .await
            .map_err(|_| CorralError::Timeout {
                operation,
                timeout: deadline,
            })??;

        match response {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error { fatal, message } => Err(CorralError::FatalInfra(format!(
                "{} rejected ({}): {}",
                operation,
                if fatal { "fatal" } else { "transient" },
                message
            ))),
        }
    }

    /// The socket path this channel is bound to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn roundtrip(&mut self, line: String) -> CorralResult<ControlResponse> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut response_line = String::new();
        let n = self.reader.read_line(&mut response_line).await?;
        if n == 0 {
            return Err(CorralError::FatalInfra(
                "control channel closed by hypervisor".to_string(),
            ));
        }

        Ok(serde_json::from_str(&response_line)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::UnixListener,
    };

    /// Serves canned responses, one per accepted request line.
    fn serve_responses(listener: UnixListener, responses: Vec<String>) {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            for response in responses {
                let _ = lines.next_line().await.unwrap();
                write_half
                    .write_all(format!("{}\n", response).as_bytes())
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_call_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("vm.sock");
        let listener = UnixListener::bind(&socket)?;
        serve_responses(
            listener,
            vec![
                r#"{"status":"ok"}"#.to_string(),
                r#"{"status":"error","fatal":true,"message":"bad config"}"#.to_string(),
            ],
        );

        let mut channel = ControlChannel::connect(&socket, Duration::from_secs(1)).await?;

        channel
            .call(&ControlRequest::Boot, Duration::from_secs(1))
            .await?;

        let err = channel
            .call(&ControlRequest::Pause, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CorralError::FatalInfra(_)));

        Ok(())
    }

    #[tokio::test]
    async fn test_connect_waits_for_late_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("late.sock");

        let socket_for_server = socket.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            let listener = UnixListener::bind(&socket_for_server).unwrap();
            serve_responses(listener, vec![]);
        });

        // The socket appears mid-window; the backoff loop must pick it up.
        ControlChannel::connect(&socket, Duration::from_secs(2)).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_connect_window_exhaustion_times_out() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("never.sock");

        let err = ControlChannel::connect(&socket, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CorralError::Timeout { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_call_deadline_enforced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&socket)?;

        // Accept but never respond.
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(60)).await;
        });

        let mut channel = ControlChannel::connect(&socket, Duration::from_secs(1)).await?;
        let err = channel
            .call(&ControlRequest::Boot, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CorralError::Timeout {
                operation: "boot",
                ..
            }
        ));

        Ok(())
    }
}
