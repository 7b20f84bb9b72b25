//! Command line and configuration file handling

mod args;
mod bridge;

pub use args::{Args, Command};
pub use bridge::{BridgeConfig, ConfigError, CONFIG_FILE_NAME};
