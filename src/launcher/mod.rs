//! Launching the target executable inside a user's logon session

use crate::error::LaunchError;
use crate::protocol::SessionId;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(windows)]
mod session;

#[cfg(windows)]
pub use session::SessionLauncher;

/// Something that can start the target in a given session
///
/// Implementations are called from blocking worker threads, one call per
/// accepted connection, possibly several at once.
pub trait Launcher: Send + Sync {
    fn launch(&self, session_id: SessionId) -> Result<(), LaunchError>;
}

/// Executable started by the service and its working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub executable: PathBuf,
    pub working_dir: PathBuf,
}

impl LaunchTarget {
    /// Target running from its own directory
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let executable = executable.into();
        let working_dir = executable
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            executable,
            working_dir,
        }
    }

    /// Target taken from the service launch arguments (program name excluded)
    pub fn from_args<I>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = OsString>,
    {
        args.into_iter()
            .next()
            .filter(|arg| !arg.is_empty())
            .map(Self::new)
    }
}

/// Launcher used where no session launch exists
#[derive(Debug, Default)]
pub struct UnsupportedLauncher;

impl Launcher for UnsupportedLauncher {
    fn launch(&self, _session_id: SessionId) -> Result<(), LaunchError> {
        Err(LaunchError::Unsupported)
    }
}

/// Session launcher for this platform
#[cfg(windows)]
pub fn platform_launcher(target: LaunchTarget) -> Arc<dyn Launcher> {
    Arc::new(SessionLauncher::new(target))
}

/// Session launcher for this platform
#[cfg(not(windows))]
pub fn platform_launcher(target: LaunchTarget) -> Arc<dyn Launcher> {
    tracing::warn!(
        "No session launcher on this platform, requests for {} will fail",
        target.executable.display()
    );
    Arc::new(UnsupportedLauncher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dir_is_parent() {
        let target = LaunchTarget::new("/opt/snixconnect/bin/snixconnect");
        assert_eq!(target.working_dir, PathBuf::from("/opt/snixconnect/bin"));

        let target = LaunchTarget::new("snixconnect");
        assert_eq!(target.working_dir, PathBuf::from("."));
    }

    #[test]
    fn test_target_from_args() {
        let target = LaunchTarget::from_args(vec![OsString::from("/opt/snix/vpn")]).unwrap();
        assert_eq!(target.executable, PathBuf::from("/opt/snix/vpn"));

        assert!(LaunchTarget::from_args(Vec::<OsString>::new()).is_none());
        assert!(LaunchTarget::from_args(vec![OsString::new()]).is_none());
    }

    #[test]
    fn test_unsupported_launcher() {
        let err = UnsupportedLauncher.launch(SessionId(1)).unwrap_err();
        assert!(matches!(err, LaunchError::Unsupported));
    }
}
