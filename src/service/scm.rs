//! Service Control Manager backend

use super::controller::ServiceManagerApi;
use super::{eventlog, ServiceSpec, ServiceState};
use crate::error::ServiceError;
use std::ffi::OsStr;
use std::io;
use std::mem;
use windows::core::PCWSTR;
use windows::Win32::Foundation::ERROR_INSUFFICIENT_BUFFER;
use windows::Win32::System::Services::{
    CloseServiceHandle, OpenSCManagerW, QueryServiceLockStatusW, QUERY_SERVICE_LOCK_STATUSW,
    SC_HANDLE, SC_MANAGER_QUERY_LOCK_STATUS,
};
use windows_service::service::{
    Service, ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceType,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;
const ERROR_SERVICE_EXISTS: i32 = 1073;

fn os_code(e: &windows_service::Error) -> Option<i32> {
    match e {
        windows_service::Error::Winapi(source) => source.raw_os_error(),
        _ => None,
    }
}

fn manager_error(op: &'static str) -> impl FnOnce(windows_service::Error) -> ServiceError {
    move |e| ServiceError::Manager {
        op,
        source: match e {
            windows_service::Error::Winapi(source) => source,
            other => io::Error::new(io::ErrorKind::Other, other),
        },
    }
}

/// Owned SCM handle opened through the raw API
struct ScmHandle(SC_HANDLE);

impl ScmHandle {
    fn open(access: u32) -> io::Result<Self> {
        // SAFETY: null machine and database names select the local active database.
        let handle = unsafe { OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), access) }?;
        Ok(Self(handle))
    }
}

impl Drop for ScmHandle {
    fn drop(&mut self) {
        // SAFETY: opened by OpenSCManagerW and closed once.
        unsafe {
            let _ = CloseServiceHandle(self.0);
        }
    }
}

/// Service manager of the local machine
#[derive(Debug, Default)]
pub struct WindowsServiceManager;

impl WindowsServiceManager {
    pub fn new() -> Self {
        Self
    }

    fn connect(&self, access: ServiceManagerAccess) -> Result<ServiceManager, ServiceError> {
        ServiceManager::local_computer(None::<&str>, access).map_err(manager_error("connect"))
    }

    /// Open `name`, `None` when it does not exist
    fn open(&self, name: &str, access: ServiceAccess) -> Result<Option<Service>, ServiceError> {
        let manager = self.connect(ServiceManagerAccess::CONNECT)?;
        match manager.open_service(name, access) {
            Ok(service) => Ok(Some(service)),
            Err(e) if os_code(&e) == Some(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(None),
            Err(e) => Err(manager_error("open service")(e)),
        }
    }

    fn open_existing(&self, name: &str, access: ServiceAccess) -> Result<Service, ServiceError> {
        self.open(name, access)?
            .ok_or_else(|| ServiceError::NotInstalled(name.to_string()))
    }
}

fn fold_state(state: windows_service::service::ServiceState) -> ServiceState {
    use windows_service::service::ServiceState as Os;

    match state {
        Os::Stopped | Os::Paused => ServiceState::Stopped,
        Os::StartPending | Os::ContinuePending => ServiceState::StartPending,
        Os::StopPending | Os::PausePending => ServiceState::StopPending,
        Os::Running => ServiceState::Running,
    }
}

impl ServiceManagerApi for WindowsServiceManager {
    fn lock_owner(&self) -> Result<Option<String>, ServiceError> {
        let lock_error = |source| ServiceError::Manager {
            op: "query lock status",
            source,
        };
        let scm = ScmHandle::open(SC_MANAGER_QUERY_LOCK_STATUS).map_err(lock_error)?;

        // u64 storage keeps the struct aligned, the owner string follows it
        let mut buf: Vec<u64> = vec![0; 128];
        let mut needed = 0u32;
        loop {
            let size = (buf.len() * mem::size_of::<u64>()) as u32;

            // SAFETY: `buf` is writable for `size` bytes and suitably aligned.
            let result = unsafe {
                QueryServiceLockStatusW(
                    scm.0,
                    Some(buf.as_mut_ptr() as *mut QUERY_SERVICE_LOCK_STATUSW),
                    size,
                    &mut needed,
                )
            };

            match result {
                Ok(()) => break,
                Err(e) if e.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() && needed > size => {
                    buf.resize((needed as usize).div_ceil(mem::size_of::<u64>()), 0);
                }
                Err(e) => return Err(lock_error(e.into())),
            }
        }

        // SAFETY: filled in by QueryServiceLockStatusW above.
        let status = unsafe { &*(buf.as_ptr() as *const QUERY_SERVICE_LOCK_STATUSW) };
        if status.fIsLocked == 0 {
            return Ok(None);
        }

        let owner = if status.lpLockOwner.is_null() {
            String::new()
        } else {
            // SAFETY: the owner string lives inside `buf`.
            unsafe { status.lpLockOwner.to_string() }.unwrap_or_default()
        };
        Ok(Some(owner))
    }

    fn query(&self, name: &str) -> Result<ServiceState, ServiceError> {
        let Some(service) = self.open(name, ServiceAccess::QUERY_STATUS)? else {
            return Ok(ServiceState::NotInstalled);
        };

        let status = service
            .query_status()
            .map_err(manager_error("query status"))?;
        Ok(fold_state(status.current_state))
    }

    fn create(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        let manager =
            self.connect(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;

        let info = ServiceInfo {
            name: spec.name.clone().into(),
            display_name: spec.display_name.clone().into(),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: spec.executable.clone(),
            launch_arguments: spec.arguments.clone(),
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };

        let service = manager
            .create_service(&info, ServiceAccess::CHANGE_CONFIG)
            .map_err(|e| match os_code(&e) {
                Some(ERROR_SERVICE_EXISTS) => ServiceError::AlreadyExists(spec.name.clone()),
                _ => manager_error("create service")(e),
            })?;

        service
            .set_description(&spec.description)
            .map_err(manager_error("set description"))
    }

    fn delete(&self, name: &str) -> Result<(), ServiceError> {
        self.open_existing(name, ServiceAccess::DELETE)?
            .delete()
            .map_err(manager_error("delete service"))
    }

    fn start(&self, name: &str) -> Result<(), ServiceError> {
        let service = self.open_existing(name, ServiceAccess::START)?;
        match service.start::<&OsStr>(&[]) {
            Ok(()) => Ok(()),
            Err(e) if os_code(&e) == Some(ERROR_SERVICE_ALREADY_RUNNING) => Ok(()),
            Err(e) => Err(manager_error("start service")(e)),
        }
    }

    fn stop(&self, name: &str) -> Result<(), ServiceError> {
        let service = self.open_existing(name, ServiceAccess::STOP)?;
        match service.stop() {
            Ok(_) => Ok(()),
            Err(e) if os_code(&e) == Some(ERROR_SERVICE_NOT_ACTIVE) => Ok(()),
            Err(e) => Err(manager_error("send control=Stop")(e)),
        }
    }

    fn install_event_source(&self, name: &str) -> Result<(), ServiceError> {
        eventlog::install_source(name)
    }

    fn remove_event_source(&self, name: &str) -> Result<(), ServiceError> {
        eventlog::remove_source(name)
    }
}
