//! snixbridge - SnixConnect privileged session-launch bridge
//!
//! A LocalSystem service listens on a secured local channel. An unprivileged
//! client sends its logon session id, the service starts the VPN client in
//! that session on the interactive desktop and answers with one status word.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod once;
pub mod protocol;
pub mod server;
pub mod service;

pub use error::{BridgeError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
