//! Unified error types for snixbridge

use crate::config::ConfigError;
use crate::service::ServiceState;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures against the OS service-control layer
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A service manager call failed
    #[error("service manager: {op}: {source}")]
    Manager {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A registration with the same name is still present
    #[error("service {0} already exists")]
    AlreadyExists(String),

    /// The service is not registered
    #[error("service {0} is not installed")]
    NotInstalled(String),

    /// Another actor holds the service database lock
    #[error("service manager locked, holder: {owner}")]
    ManagerLocked { owner: String },

    /// Bounded state polling ran out of time
    #[error("timeout waiting for service {name} to go to state={expected} (last state={last})")]
    Timeout {
        name: String,
        expected: ServiceState,
        last: ServiceState,
    },

    /// Event log source registration failed
    #[error("event log source: {op}: {source}")]
    EventSource {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Step of the session launch sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStep {
    OpenToken,
    DuplicateToken,
    StampSession,
    QueryUserToken,
    ResolveLocalAppData,
    BuildEnvironment,
    CreateProcess,
}

impl LaunchStep {
    /// Name of the OS call backing this step
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchStep::OpenToken => "OpenProcessToken",
            LaunchStep::DuplicateToken => "DuplicateTokenEx",
            LaunchStep::StampSession => "SetTokenInformation",
            LaunchStep::QueryUserToken => "WTSQueryUserToken",
            LaunchStep::ResolveLocalAppData => "SHGetKnownFolderPath",
            LaunchStep::BuildEnvironment => "CreateEnvironmentBlock",
            LaunchStep::CreateProcess => "CreateProcessAsUser",
        }
    }
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while launching the target inside a user session
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Token acquisition, stamping or environment preparation failed
    #[error("{step}: {source}")]
    Token {
        step: LaunchStep,
        #[source]
        source: io::Error,
    },

    /// The process could not be created under the stamped token
    #[error("CreateProcessAsUser: {0}")]
    ProcessCreation(#[source] io::Error),

    /// No session launcher exists for this platform
    #[error("launching into a user session is not supported on this platform")]
    Unsupported,

    /// The blocking launch worker died before reporting
    #[error("launch worker failed: {0}")]
    Worker(String),
}

impl LaunchError {
    pub fn token(step: LaunchStep, source: impl Into<io::Error>) -> Self {
        Self::Token {
            step,
            source: source.into(),
        }
    }

    /// The launch step that failed, when the failure came from the OS
    pub fn step(&self) -> Option<LaunchStep> {
        match self {
            LaunchError::Token { step, .. } => Some(*step),
            LaunchError::ProcessCreation(_) => Some(LaunchStep::CreateProcess),
            LaunchError::Unsupported | LaunchError::Worker(_) => None,
        }
    }
}

/// Direction of a channel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOp {
    Connect,
    Read,
    Write,
}

impl fmt::Display for ChannelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOp::Connect => f.write_str("connect to pipe"),
            ChannelOp::Read => f.write_str("read from pipe"),
            ChannelOp::Write => f.write_str("write to pipe"),
        }
    }
}

/// Failures on the local communication channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel could not be created or secured
    #[error("failed to bind pipe {name}: {source}")]
    Bind {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Nobody listens on the channel
    #[error("error connecting to pipe {name}: {source}\n\nIs the SnixConnect service running?")]
    ServiceUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Dialing failed for another reason
    #[error("error connecting to pipe {name}: {source}")]
    Connect {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failed
    #[error("{op}: {source}")]
    Io {
        op: ChannelOp,
        #[source]
        source: io::Error,
    },

    /// Deadline expired
    #[error("{op}: timed out after {timeout:?}")]
    Timeout { op: ChannelOp, timeout: Duration },

    /// The peer closed the channel before the exchange completed
    #[error("communication pipe has been closed unexpectedly")]
    ClosedUnexpectedly,
}

/// A reply arrived but does not report success
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The service answered with the failure sentinel
    #[error("service failed to execute the SnixConnect binary")]
    LaunchFailed,

    /// The reply matches neither sentinel
    #[error("unexpected reply from service: {0:02x?}")]
    UnexpectedReply([u8; 4]),
}

/// Main error type for snixbridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The caller's own session could not be determined
    #[error("error getting session id: {0}")]
    Session(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for snixbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if a deadline expired somewhere along the way
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BridgeError::Channel(ChannelError::Timeout { .. })
                | BridgeError::Service(ServiceError::Timeout { .. })
        )
    }
}
