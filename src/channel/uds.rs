//! Unix domain socket channel

use crate::error::{ChannelError, ChannelOp};
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::time;
use tracing::{debug, warn};

pub type ServerStream = UnixStream;
pub type ClientStream = UnixStream;

const SOCKET_FILE_NAME: &str = "snixconnect.sock";

/// Default socket path: the user runtime directory, or the temp directory
pub fn default_pipe_name() -> String {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

/// Listening end of the channel
pub struct ChannelListener {
    path: PathBuf,
    listener: UnixListener,
}

impl ChannelListener {
    /// Bind the socket and restrict it to its owner
    ///
    /// A stale socket left behind by a previous run is removed first.
    pub fn bind(name: &str) -> Result<Self, ChannelError> {
        let path = PathBuf::from(name);
        let bind_error = |source| ChannelError::Bind {
            name: name.to_string(),
            source,
        };

        if let Ok(metadata) = fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!("Removing stale socket {}", path.display());
                fs::remove_file(&path).map_err(bind_error)?;
            }
        }

        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(bind_error)?;

        Ok(Self { path, listener })
    }

    /// Wait for the next client
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Dial the channel within `timeout`
pub async fn connect(name: &str, timeout: Duration) -> Result<ClientStream, ChannelError> {
    match time::timeout(timeout, UnixStream::connect(name)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e))
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) =>
        {
            Err(ChannelError::ServiceUnavailable {
                name: name.to_string(),
                source: e,
            })
        }
        Ok(Err(e)) => Err(ChannelError::Connect {
            name: name.to_string(),
            source: e,
        }),
        Err(_) => Err(ChannelError::Timeout {
            op: ChannelOp::Connect,
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let name = path.to_string_lossy().into_owned();

        let listener = ChannelListener::bind(&name).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rebind_over_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.sock");
        let name = path.to_string_lossy().into_owned();

        // Leave a socket file behind without removing it
        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let _listener = ChannelListener::bind(&name).unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("missing.sock").to_string_lossy().into_owned();

        let err = connect(&name, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, ChannelError::ServiceUnavailable { .. }));
    }
}
