//! Unprivileged side of the bridge
//!
//! Asks the service to launch the target into the caller's own session. One
//! attempt per call, no retries.

use crate::channel;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ChannelOp, ProtocolError, Result};
use crate::protocol::{LaunchOutcome, LaunchRequest, SessionId, RESPONSE_LEN};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Client for the service's launch channel
#[derive(Debug, Clone)]
pub struct PipeClient {
    pipe_name: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl PipeClient {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            pipe_name: config.pipe_name.clone(),
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Request a launch into `session_id`
    pub async fn execute(&self, session_id: SessionId) -> Result<()> {
        let stream = channel::connect(&self.pipe_name, self.connect_timeout).await?;
        debug!(pipe = %self.pipe_name, "Connected to service");

        exchange(stream, LaunchRequest::new(session_id), self.io_timeout).await?;
        info!(session = %session_id, "Service launched the target");
        Ok(())
    }

    /// Request a launch into the caller's own session
    pub async fn execute_current(&self) -> Result<()> {
        let session_id = current_session_id()?;
        self.execute(session_id).await
    }

    /// Blocking form of [`execute_current`](Self::execute_current) for callers
    /// without a runtime
    pub fn execute_blocking(&self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.execute_current())
    }
}

/// Run one request/reply exchange on an established stream
pub async fn exchange<S>(
    mut stream: S,
    request: LaunchRequest,
    io_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let encoded = request.encode();
    channel::with_deadline(ChannelOp::Write, io_timeout, async {
        stream.write_all(&encoded).await?;
        stream.flush().await
    })
    .await?;

    let mut reply = [0u8; RESPONSE_LEN];
    channel::with_deadline(ChannelOp::Read, io_timeout, stream.read_exact(&mut reply)).await?;

    match LaunchOutcome::from_bytes(reply)? {
        LaunchOutcome::Success => Ok(()),
        LaunchOutcome::Failure => Err(ProtocolError::LaunchFailed.into()),
    }
}

/// Session the calling process belongs to
#[cfg(windows)]
pub fn current_session_id() -> Result<SessionId> {
    use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
    use windows::Win32::System::Threading::GetCurrentProcessId;

    let mut session = 0u32;
    // SAFETY: `session` is a valid out pointer for the duration of the call.
    unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session) }
        .map_err(|e| BridgeError::Session(e.into()))?;

    Ok(SessionId(session))
}

/// Session the calling process belongs to
#[cfg(not(windows))]
pub fn current_session_id() -> Result<SessionId> {
    Err(BridgeError::Session(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "logon sessions are not available on this platform",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::protocol::{FAILURE_SENTINEL, SUCCESS_SENTINEL};

    const TIMEOUT: Duration = Duration::from_millis(200);

    /// Read one request on the far end and answer with `reply`
    async fn answer(mut far: tokio::io::DuplexStream, reply: &[u8]) -> [u8; 4] {
        let mut request = [0u8; 4];
        far.read_exact(&mut request).await.unwrap();
        far.write_all(reply).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_success_sentinel() {
        let (near, far) = tokio::io::duplex(64);
        let server = tokio::spawn(async move { answer(far, &SUCCESS_SENTINEL).await });

        exchange(near, LaunchRequest::new(SessionId(1)), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), [0x00, 0x00, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn test_failure_sentinel() {
        let (near, far) = tokio::io::duplex(64);
        tokio::spawn(async move { answer(far, &FAILURE_SENTINEL).await });

        let err = exchange(near, LaunchRequest::new(SessionId(2)), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::LaunchFailed)
        ));
    }

    #[tokio::test]
    async fn test_garbage_reply() {
        let (near, far) = tokio::io::duplex(64);
        tokio::spawn(async move { answer(far, b"NOPE").await });

        let err = exchange(near, LaunchRequest::new(SessionId(2)), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::UnexpectedReply(bytes)) if &bytes == b"NOPE"
        ));
    }

    #[tokio::test]
    async fn test_silent_service_times_out() {
        let (near, _far) = tokio::io::duplex(64);

        let err = exchange(near, LaunchRequest::new(SessionId(3)), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(
            err,
            BridgeError::Channel(ChannelError::Timeout {
                op: ChannelOp::Read,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_service_closes_without_reply() {
        let (near, mut far) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut request = [0u8; 4];
            far.read_exact(&mut request).await.unwrap();
            // Partial reply, then gone
            far.write_all(b"OK").await.unwrap();
        });

        let err = exchange(near, LaunchRequest::new(SessionId(4)), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Channel(ChannelError::ClosedUnexpectedly)
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_session_lookup_unavailable() {
        assert!(matches!(current_session_id(), Err(BridgeError::Session(_))));
    }
}
