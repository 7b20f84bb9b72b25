//! snixbridge - SnixConnect service controller CLI

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

use snixbridge::client::PipeClient;
use snixbridge::config::{Args, BridgeConfig, Command, ConfigError};
use snixbridge::launcher::{self, LaunchTarget};
use snixbridge::once::OnceAction;
use snixbridge::server::PipeServer;
use snixbridge::service::{ServiceController, ServiceManagerApi, ServiceSpec};
use snixbridge::BridgeError;

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = load_config(&args);

    // Execute command
    match args.command.unwrap_or_default() {
        Command::Install { path, target } => cmd_install(&config?, path, target),
        Command::Execute => cmd_execute(config),
        Command::Uninstall => cmd_uninstall(&config?),
        Command::Start => cmd_start(&config?),
        Command::Stop => cmd_stop(&config?),
        Command::Status => cmd_status(&config?),
        Command::SampleConfig => {
            print!("{}", BridgeConfig::sample_config());
            Ok(())
        }
        Command::Serve { target } => cmd_serve(&config?, target),
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(log_file) = &args.log {
        let file = std::fs::File::create(log_file)?;
        subscriber.with_writer(file).with_ansi(false).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

fn load_config(args: &Args) -> std::result::Result<BridgeConfig, ConfigError> {
    match &args.config {
        Some(path) => BridgeConfig::load(path),
        None => BridgeConfig::load_default(),
    }
}

#[cfg(windows)]
fn controller(config: &BridgeConfig) -> Result<ServiceController<Box<dyn ServiceManagerApi>>> {
    let manager: Box<dyn ServiceManagerApi> =
        Box::new(snixbridge::service::WindowsServiceManager::new());
    Ok(ServiceController::new(manager, config))
}

#[cfg(not(windows))]
fn controller(_config: &BridgeConfig) -> Result<ServiceController<Box<dyn ServiceManagerApi>>> {
    anyhow::bail!("the service manager is only available on Windows")
}

/// Replace any previous registration, install and start the service
fn cmd_install(config: &BridgeConfig, path: PathBuf, target: PathBuf) -> Result<()> {
    let spec = ServiceSpec::new(config, path, target);
    controller(config)?.setup(&spec)?;

    println!("Service {} installed and running.", spec.name);
    Ok(())
}

/// Ask the service to launch the target in this session
///
/// Failures are shown to the user and end the process with status 1.
fn cmd_execute(config: std::result::Result<BridgeConfig, ConfigError>) -> Result<()> {
    let result = config
        .map_err(BridgeError::from)
        .and_then(|config| PipeClient::new(&config).execute_blocking());

    if let Err(e) = result {
        error!("Execute failed: {}", e);
        show_error(&e);
        process::exit(1);
    }

    Ok(())
}

fn cmd_uninstall(config: &BridgeConfig) -> Result<()> {
    controller(config)?.uninstall(&config.service_name)?;
    println!("Service {} removed.", config.service_name);
    Ok(())
}

fn cmd_start(config: &BridgeConfig) -> Result<()> {
    controller(config)?.start(&config.service_name)?;
    println!("Service {} running.", config.service_name);
    Ok(())
}

fn cmd_stop(config: &BridgeConfig) -> Result<()> {
    controller(config)?.stop(&config.service_name)?;
    println!("Service {} stopped.", config.service_name);
    Ok(())
}

fn cmd_status(config: &BridgeConfig) -> Result<()> {
    let state = controller(config)?.status(&config.service_name)?;
    println!("Service {}: {}", config.service_name, state);
    Ok(())
}

/// Run the pipe server in the foreground until Ctrl+C
fn cmd_serve(config: &BridgeConfig, target: PathBuf) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let server = PipeServer::new(config, launcher::platform_launcher(LaunchTarget::new(target)));
    let listener = {
        let _guard = runtime.enter();
        server.bind()?
    };
    println!(
        "Listening on {}. Press Ctrl+C to stop.\n",
        server.pipe_name()
    );

    // Setup Ctrl+C handler
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let stop = OnceAction::new(move || {
        println!("\nReceived Ctrl+C, stopping...");
        let _ = stop_tx.send(());
    });
    ctrlc::set_handler(move || {
        let _ = stop.run();
    })?;

    runtime.spawn(server.serve(listener));

    // Wait for Ctrl+C
    let _ = stop_rx.recv();

    runtime.shutdown_timeout(Duration::from_secs(2));
    println!("Stopped.");

    Ok(())
}

#[cfg(windows)]
fn show_error(err: &BridgeError) {
    use windows::core::HSTRING;
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging::{MessageBoxW, MB_ICONERROR, MB_OK};

    let text = HSTRING::from(format!("error executing SnixConnect\n\n{}", err));
    let caption = HSTRING::from(snixbridge::service::SERVICE_NAME);

    // SAFETY: both strings are null-terminated and outlive the call.
    unsafe {
        MessageBoxW(HWND::default(), &text, &caption, MB_OK | MB_ICONERROR);
    }
}

#[cfg(not(windows))]
fn show_error(err: &BridgeError) {
    eprintln!("error executing SnixConnect\n\n{}", err);
}
