//! Local transport between the unprivileged client and the service
//!
//! On Windows the channel is a named pipe whose security descriptor is built
//! once and kept for the whole life of the listener. On Unix hosts a Unix
//! domain socket readable only by its owner stands in for it, which is what
//! the end-to-end tests run against.

use crate::error::{ChannelError, ChannelOp};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::time;

#[cfg(windows)]
mod pipe;
#[cfg(unix)]
mod uds;

#[cfg(windows)]
pub use pipe::{connect, default_pipe_name, ChannelListener, ClientStream, ServerStream};
#[cfg(unix)]
pub use uds::{connect, default_pipe_name, ChannelListener, ClientStream, ServerStream};

/// Run one channel operation under a deadline and classify its failure
pub(crate) async fn with_deadline<T, F>(
    op: ChannelOp,
    timeout: Duration,
    operation: F,
) -> Result<T, ChannelError>
where
    F: Future<Output = io::Result<T>>,
{
    match time::timeout(timeout, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ChannelError::ClosedUnexpectedly)
        }
        Ok(Err(e)) => Err(ChannelError::Io { op, source: e }),
        Err(_) => Err(ChannelError::Timeout { op, timeout }),
    }
}
