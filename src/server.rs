//! Privileged side of the bridge
//!
//! One accept loop hands every connection to its own task. A task reads one
//! request, runs the launcher on a blocking worker, writes one reply and
//! closes the connection. Nothing a single connection does can stop the loop.

use crate::channel::{self, ChannelListener};
use crate::config::BridgeConfig;
use crate::error::{ChannelError, ChannelOp, LaunchError};
use crate::launcher::Launcher;
use crate::protocol::{LaunchOutcome, LaunchRequest, REQUEST_LEN};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task;
use tracing::{debug, error, info, warn};

/// Pipe server answering launch requests
pub struct PipeServer {
    pipe_name: String,
    io_timeout: Duration,
    admission: Option<Arc<Semaphore>>,
    launcher: Arc<dyn Launcher>,
}

impl PipeServer {
    pub fn new(config: &BridgeConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            pipe_name: config.pipe_name.clone(),
            io_timeout: config.io_timeout(),
            admission: config
                .connection_limit()
                .map(|limit| Arc::new(Semaphore::new(limit))),
            launcher,
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Create and secure the channel
    ///
    /// Must be called from within a Tokio runtime. A failure here is fatal
    /// for the service.
    pub fn bind(&self) -> Result<ChannelListener, ChannelError> {
        ChannelListener::bind(&self.pipe_name)
    }

    /// Bind the channel and serve it forever
    pub async fn run(self) -> Result<(), ChannelError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections forever
    pub async fn serve(self, mut listener: ChannelListener) {
        info!(pipe = %self.pipe_name, "Waiting for execute requests");

        loop {
            // Wait for a free slot before taking the next client
            let permit = match &self.admission {
                Some(admission) => match Arc::clone(admission).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            let stream = match listener.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Accepting pipe client failed: {}", e);
                    continue;
                }
            };

            let launcher = Arc::clone(&self.launcher);
            let io_timeout = self.io_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                let _ = handle_connection(stream, launcher, io_timeout).await;
            });
        }
    }
}

/// Serve a single connection
///
/// Returns the outcome written to the client, or the channel error that cut
/// the exchange short. The launcher is only invoked once a complete request
/// has been read, and at most one reply is written.
pub async fn handle_connection<S>(
    mut stream: S,
    launcher: Arc<dyn Launcher>,
    io_timeout: Duration,
) -> Result<LaunchOutcome, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("IPC client connected");

    let mut buf = [0u8; REQUEST_LEN];
    if let Err(e) =
        channel::with_deadline(ChannelOp::Read, io_timeout, stream.read_exact(&mut buf)).await
    {
        error!("IPC read execute request: {}", e);
        return Err(e);
    }

    let request = LaunchRequest::decode(buf);
    let session_id = request.session_id;
    info!(session = %session_id, "Launching target");

    let result = task::spawn_blocking(move || launcher.launch(session_id))
        .await
        .unwrap_or_else(|e| Err(LaunchError::Worker(e.to_string())));

    let outcome = LaunchOutcome::from_result(&result);
    match result {
        Ok(()) => info!(session = %session_id, "Target executed successfully"),
        Err(e) => error!(session = %session_id, "Running target binary: {}", e),
    }

    let reply = outcome.to_bytes();
    let written = channel::with_deadline(ChannelOp::Write, io_timeout, async {
        stream.write_all(&reply).await?;
        stream.flush().await
    })
    .await;

    if let Err(e) = written {
        error!(session = %session_id, "IPC write execute reply: {}", e);
        return Err(e);
    }

    // Best effort, the stream is dropped right after anyway
    let _ = stream.shutdown().await;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SessionId, FAILURE_SENTINEL, SUCCESS_SENTINEL};
    use parking_lot::Mutex;
    use std::thread;

    /// Launcher recording every call, failing for one session
    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<SessionId>>,
        fail_for: Option<SessionId>,
        delay: Duration,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, session_id: SessionId) -> Result<(), LaunchError> {
            self.calls.lock().push(session_id);
            thread::sleep(self.delay);
            if self.fail_for == Some(session_id) {
                Err(LaunchError::Unsupported)
            } else {
                Ok(())
            }
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_success_reply() {
        let launcher = Arc::new(RecordingLauncher::default());
        let (mut client, server) = tokio::io::duplex(64);

        let handler = tokio::spawn(handle_connection(server, launcher.clone(), TIMEOUT));

        client.write_all(&[0, 0, 0, 7]).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert_eq!(reply, SUCCESS_SENTINEL);
        assert_eq!(handler.await.unwrap().unwrap(), LaunchOutcome::Success);
        assert_eq!(*launcher.calls.lock(), vec![SessionId(7)]);
    }

    #[tokio::test]
    async fn test_session_without_user_gets_failure_sentinel() {
        let launcher = Arc::new(RecordingLauncher {
            fail_for: Some(SessionId(1)),
            ..Default::default()
        });
        let (mut client, server) = tokio::io::duplex(64);

        let handler = tokio::spawn(handle_connection(server, launcher.clone(), TIMEOUT));

        client.write_all(&[0x00, 0x00, 0x00, 0x01]).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        // Exactly one 4-byte reply, never OKOK
        assert_eq!(reply, [0x21, 0x21, 0x21, 0x21]);
        assert_eq!(reply, FAILURE_SENTINEL);
        assert_eq!(handler.await.unwrap().unwrap(), LaunchOutcome::Failure);
    }

    #[tokio::test]
    async fn test_short_request_never_launches() {
        let launcher = Arc::new(RecordingLauncher::default());
        let (mut client, server) = tokio::io::duplex(64);

        let handler = tokio::spawn(handle_connection(server, launcher.clone(), TIMEOUT));

        // Two bytes then silence until the read deadline
        client.write_all(&[0, 0]).await.unwrap();
        let err = handler.await.unwrap().unwrap_err();

        assert!(matches!(
            err,
            ChannelError::Timeout {
                op: ChannelOp::Read,
                ..
            }
        ));
        assert!(launcher.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_client_gone_before_request_completes() {
        let launcher = Arc::new(RecordingLauncher::default());
        let (mut client, server) = tokio::io::duplex(64);

        client.write_all(&[0, 0, 1]).await.unwrap();
        drop(client);

        let err = handle_connection(server, launcher.clone(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ClosedUnexpectedly));
        assert!(launcher.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_late_write_after_client_left() {
        let launcher = Arc::new(RecordingLauncher {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let (mut client, server) = tokio::io::duplex(64);

        let handler = tokio::spawn(handle_connection(server, launcher.clone(), TIMEOUT));

        client.write_all(&[0, 0, 0, 3]).await.unwrap();
        // Client gives up before the launcher returns
        drop(client);

        let err = handler.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Io {
                op: ChannelOp::Write,
                ..
            }
        ));
        assert_eq!(*launcher.calls.lock(), vec![SessionId(3)]);
    }

    #[tokio::test]
    async fn test_concurrent_connections_are_independent() {
        let launcher = Arc::new(RecordingLauncher {
            fail_for: Some(SessionId(9)),
            delay: Duration::from_millis(50),
            ..Default::default()
        });

        let (mut first, first_server) = tokio::io::duplex(64);
        let (mut second, second_server) = tokio::io::duplex(64);
        let first_handler = tokio::spawn(handle_connection(
            first_server,
            launcher.clone(),
            TIMEOUT,
        ));
        let second_handler = tokio::spawn(handle_connection(
            second_server,
            launcher.clone(),
            TIMEOUT,
        ));

        first.write_all(&[0, 0, 0, 2]).await.unwrap();
        second.write_all(&[0, 0, 0, 9]).await.unwrap();

        let mut first_reply = [0u8; 4];
        let mut second_reply = [0u8; 4];
        first.read_exact(&mut first_reply).await.unwrap();
        second.read_exact(&mut second_reply).await.unwrap();

        assert_eq!(first_reply, SUCCESS_SENTINEL);
        assert_eq!(second_reply, FAILURE_SENTINEL);
        assert!(first_handler.await.unwrap().is_ok());
        assert!(second_handler.await.unwrap().is_ok());

        let mut calls = launcher.calls.lock().clone();
        calls.sort_by_key(|s| s.0);
        assert_eq!(calls, vec![SessionId(2), SessionId(9)]);
    }
}
