//! SnixConnect Windows Service executable
//!
//! This binary is designed to be run by the Windows Service Control Manager.
//! Do not run this directly - use the installer instead:
//!   snixbridge install --path <this exe> --target <snixconnect exe>
//!
//! The registration passes the target executable as the only argument.
//!
//! To start or stop the service:
//!   snixbridge start
//!   snixbridge stop
//!   or: sc start SnixConnect
//!
//! To uninstall the service:
//!   snixbridge uninstall

#[cfg(windows)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This binary should only be started by the Windows Service Control Manager
    snixbridge::service::run_service().map_err(|e| {
        eprintln!("Failed to run service: {}", e);
        e
    })?;
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    eprintln!("snixbridge-service only runs under the Windows Service Control Manager");
    std::process::exit(1);
}
