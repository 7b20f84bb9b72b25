//! Bridge configuration file support

use crate::channel;
use crate::service::SERVICE_NAME;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name looked up next to the executable
pub const CONFIG_FILE_NAME: &str = "snixbridge.toml";

/// Configuration shared by the service, the pipe server and the client
///
/// Built once at startup and handed to every component that needs it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of the service registration
    pub service_name: String,

    /// Local channel the service listens on
    pub pipe_name: String,

    /// Budget for dialing the channel in milliseconds
    pub connect_timeout_ms: u64,

    /// Read and write deadline on the channel in milliseconds
    pub io_timeout_ms: u64,

    /// Interval between service status queries in milliseconds
    pub poll_interval_ms: u64,

    /// Budget for a start or stop transition in milliseconds
    pub state_timeout_ms: u64,

    /// Maximum connections handled at once (0 = unbounded)
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = event log when running as a service)
    pub log_file: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            pipe_name: channel::default_pipe_name(),
            connect_timeout_ms: 1000,
            io_timeout_ms: 1000,
            poll_interval_ms: 250,
            state_timeout_ms: 2000,
            max_connections: 16,
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: snixbridge.toml
    /// 2. %PROGRAMDATA%\SnixConnect\config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                paths.push(exe_dir.join(CONFIG_FILE_NAME));
            }
        }

        if let Ok(program_data) = std::env::var("PROGRAMDATA") {
            paths.push(
                Path::new(&program_data)
                    .join(SERVICE_NAME)
                    .join("config.toml"),
            );
        }

        paths
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }

    /// Admission limit for the pipe server, `None` when unbounded
    pub fn connection_limit(&self) -> Option<usize> {
        (self.max_connections > 0).then_some(self.max_connections)
    }

    pub fn log_file(&self) -> Option<&Path> {
        (!self.log_file.is_empty()).then(|| Path::new(&self.log_file))
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# SnixConnect bridge configuration

# Service registration name
service_name = "SnixConnect"

# Local channel the service listens on
pipe_name = '\\.\pipe\SnixconnectPipe'

# Channel deadlines in milliseconds
connect_timeout_ms = 1000
io_timeout_ms = 1000

# Service start/stop polling in milliseconds
poll_interval_ms = 250
state_timeout_ms = 2000

# Maximum concurrent connections (0 = unbounded)
max_connections = 16

# Log level: trace, debug, info, warn, error (default: info)
log_level = "info"

# Log file path (empty = Windows event log)
log_file = ""
"#
        .to_string()
    }
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing TOML
    #[error("Failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.service_name, "SnixConnect");
        assert_eq!(config.io_timeout(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.state_timeout(), Duration::from_secs(2));
        assert_eq!(config.connection_limit(), Some(16));
        assert!(config.log_file().is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            io_timeout_ms = 250
            max_connections = 0
            log_file = "bridge.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.io_timeout(), Duration::from_millis(250));
        assert_eq!(config.connection_limit(), None);
        assert_eq!(config.log_file(), Some(Path::new("bridge.log")));
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.pipe_name, channel::default_pipe_name());
    }

    #[test]
    fn test_sample_config_parses() {
        let config: BridgeConfig = toml::from_str(&BridgeConfig::sample_config()).unwrap();
        assert_eq!(config.pipe_name, r"\\.\pipe\SnixconnectPipe");
        assert_eq!(config.state_timeout_ms, 2000);
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "io_timeout_ms = \"soon\"").unwrap();

        let err = BridgeConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
