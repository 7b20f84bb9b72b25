//! Windows Service runner implementation

use crate::config::BridgeConfig;
use crate::launcher::{self, LaunchTarget};
use crate::logging;
use crate::once::OnceAction;
use crate::server::PipeServer;
use crate::service::{SERVICE_DISPLAY_NAME, SERVICE_NAME};
use anyhow::{anyhow, Context};
use std::env;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use windows_service::{
    define_windows_service,
    service::{
        ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
        ServiceType,
    },
    service_control_handler::{self, ServiceControlHandlerResult},
    service_dispatcher,
};

const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;

/// Time given to in-flight connections once a stop is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Run the Windows service
///
/// This is the main entry point called from the service binary.
/// It registers with the Service Control Manager and starts the service dispatcher.
pub fn run_service() -> Result<(), windows_service::Error> {
    service_dispatcher::start(SERVICE_NAME, ffi_service_main)
}

// Generate the Windows service entry point
define_windows_service!(ffi_service_main, service_main);

/// Service main function called by the Windows Service Control Manager
fn service_main(arguments: Vec<OsString>) {
    if let Err(e) = run_service_main(arguments) {
        error!("Service error: {:#}", e);
    }
}

fn run_service_main(_arguments: Vec<OsString>) -> anyhow::Result<()> {
    let config = BridgeConfig::load_default().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config: {}, using defaults", e);
        BridgeConfig::default()
    });

    logging::init_service(&config);

    info!("Starting {} service", SERVICE_DISPLAY_NAME);

    // The target is a registration argument, not a start parameter
    let target = LaunchTarget::from_args(env::args_os().skip(1));

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let stop = Arc::new(OnceAction::new(move || {
        let _ = stop_tx.send(());
    }));
    let stop_handler = Arc::clone(&stop);

    // Register service control handler
    let status_handle = service_control_handler::register(
        &config.service_name,
        move |control_event| -> ServiceControlHandlerResult {
            match control_event {
                ServiceControl::Stop | ServiceControl::Shutdown => {
                    info!("Received stop/shutdown signal");
                    let _ = stop_handler.run();
                    ServiceControlHandlerResult::NoError
                }
                ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                _ => ServiceControlHandlerResult::NotImplemented,
            }
        },
    )?;

    let set_status = |current_state, controls_accepted, exit_code, wait_hint| {
        status_handle.set_service_status(ServiceStatus {
            service_type: SERVICE_TYPE,
            current_state,
            controls_accepted,
            exit_code: ServiceExitCode::Win32(exit_code),
            checkpoint: 0,
            wait_hint,
            process_id: None,
        })
    };

    // Report service starting
    set_status(
        ServiceState::StartPending,
        ServiceControlAccept::empty(),
        0,
        Duration::from_secs(3),
    )?;

    let started = target
        .ok_or_else(|| anyhow!("missing target executable argument"))
        .and_then(|target| {
            info!("Target executable: {}", target.executable.display());

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build runtime")?;

            let server = PipeServer::new(&config, launcher::platform_launcher(target));
            let listener = {
                let _guard = runtime.enter();
                server.bind()?
            };
            runtime.spawn(server.serve(listener));
            Ok(runtime)
        });

    let runtime = match started {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start pipe server: {:#}", e);

            // Report service stopped with error
            set_status(
                ServiceState::Stopped,
                ServiceControlAccept::empty(),
                1,
                Duration::default(),
            )?;
            return Err(e);
        }
    };

    // Report service running
    set_status(
        ServiceState::Running,
        ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
        0,
        Duration::default(),
    )?;

    // Block until the control handler fires
    let _ = stop_rx.recv();

    // Report service stopping
    set_status(
        ServiceState::StopPending,
        ServiceControlAccept::empty(),
        0,
        SHUTDOWN_GRACE + Duration::from_secs(1),
    )?;

    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    // Report service stopped
    set_status(
        ServiceState::Stopped,
        ServiceControlAccept::empty(),
        0,
        Duration::default(),
    )?;

    info!("Service stopped");
    Ok(())
}
