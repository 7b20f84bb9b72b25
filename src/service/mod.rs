//! Windows Service support for snixbridge
//!
//! The bridge runs as a LocalSystem service registered with the Windows
//! Service Control Manager. [`controller`] drives its lifecycle from the
//! command line, `runner` is the entry point the SCM starts.

pub mod controller;

#[cfg(windows)]
pub mod eventlog;
#[cfg(windows)]
mod runner;
#[cfg(windows)]
mod scm;

pub use controller::{ServiceController, ServiceManagerApi};

#[cfg(windows)]
pub use runner::run_service;
#[cfg(windows)]
pub use scm::WindowsServiceManager;

use crate::config::BridgeConfig;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

/// Service name used for registration
pub const SERVICE_NAME: &str = "SnixConnect";

/// Service display name shown in services.msc
pub const SERVICE_DISPLAY_NAME: &str = "SnixConnect VPN Client Service";

/// Service description
pub const SERVICE_DESCRIPTION: &str = "SnixConnect Secure And Fast VPN Client For Windows";

/// Lifecycle state of the service as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotInstalled,
    Stopped,
    StartPending,
    Running,
    StopPending,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::NotInstalled => "not installed",
            ServiceState::Stopped => "stopped",
            ServiceState::StartPending => "start pending",
            ServiceState::Running => "running",
            ServiceState::StopPending => "stop pending",
        };
        f.write_str(name)
    }
}

/// Everything needed to register the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub executable: PathBuf,
    pub arguments: Vec<OsString>,
}

impl ServiceSpec {
    /// Registration for `service_exe`, launching `target_exe` on request
    pub fn new(
        config: &BridgeConfig,
        service_exe: impl Into<PathBuf>,
        target_exe: impl Into<PathBuf>,
    ) -> Self {
        let target: PathBuf = target_exe.into();
        Self {
            name: config.service_name.clone(),
            display_name: SERVICE_DISPLAY_NAME.to_string(),
            description: SERVICE_DESCRIPTION.to_string(),
            executable: service_exe.into(),
            arguments: vec![target.into_os_string()],
        }
    }
}
