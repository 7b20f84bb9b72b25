//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// snixbridge - SnixConnect service controller
///
/// Installs the privileged SnixConnect service and asks it to launch the
/// VPN client inside the caller's logon session
#[derive(Parser, Debug)]
#[command(name = "snixbridge")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute (default: execute)
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Configuration file (default: search next to the executable, then ProgramData)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Register the service (removing any previous registration) and start it
    Install {
        /// Path of the service executable to register
        #[arg(long)]
        path: PathBuf,

        /// Path of the executable the service launches
        #[arg(long)]
        target: PathBuf,
    },

    /// Ask the service to launch the target in this logon session
    Execute,

    /// Stop the service and remove its registration
    Uninstall,

    /// Start the installed service
    Start,

    /// Stop the running service
    Stop,

    /// Show the service state
    Status,

    /// Print a sample configuration file
    SampleConfig,

    /// Run the pipe server in the foreground (debugging)
    Serve {
        /// Path of the executable to launch
        #[arg(long)]
        target: PathBuf,
    },
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        // The front-end invokes us without arguments
        Command::Execute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_execute() {
        let args = Args::try_parse_from(["snixbridge"]).unwrap();
        assert_eq!(args.log_level(), tracing::Level::INFO);
        assert_eq!(args.command.unwrap_or_default(), Command::Execute);
    }

    #[test]
    fn test_install_requires_both_paths() {
        let args = Args::try_parse_from([
            "snixbridge",
            "install",
            "--path",
            r"C:\Program Files\SnixConnect\snixbridge-service.exe",
            "--target",
            r"C:\Program Files\SnixConnect\snixconnect.exe",
        ])
        .unwrap();

        assert_eq!(
            args.command,
            Some(Command::Install {
                path: PathBuf::from(r"C:\Program Files\SnixConnect\snixbridge-service.exe"),
                target: PathBuf::from(r"C:\Program Files\SnixConnect\snixconnect.exe"),
            })
        );

        assert!(Args::try_parse_from(["snixbridge", "install", "--path", "svc.exe"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let args = Args::try_parse_from(["snixbridge", "uninstall", "-vv"]).unwrap();
        assert_eq!(args.command, Some(Command::Uninstall));
        assert_eq!(args.log_level(), tracing::Level::TRACE);

        let args = Args::try_parse_from(["snixbridge", "-q", "status"]).unwrap();
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
