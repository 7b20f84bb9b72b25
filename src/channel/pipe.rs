//! Windows named pipe channel

use crate::error::{ChannelError, ChannelOp};
use std::ffi::c_void;
use std::io;
use std::time::Duration;
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
};
use tokio::time::{self, Instant};
use windows::core::HSTRING;
use windows::Win32::Foundation::{LocalFree, ERROR_PIPE_BUSY, HLOCAL};
use windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};

pub type ServerStream = NamedPipeServer;
pub type ClientStream = NamedPipeClient;

/// Well-known pipe the service listens on
pub const DEFAULT_PIPE_NAME: &str = r"\\.\pipe\SnixconnectPipe";

/// Protected DACL: no inherited entries, full access for LocalSystem and
/// Administrators, read/write for interactive users.
const PIPE_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GA;;;BA)(A;;GRGW;;;IU)";

/// Delay between attempts while every pipe instance is busy
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

pub fn default_pipe_name() -> String {
    DEFAULT_PIPE_NAME.to_string()
}

/// Security descriptor applied to every pipe instance
struct PipeSecurity {
    descriptor: PSECURITY_DESCRIPTOR,
}

// SAFETY: the descriptor is only read after construction and freed once in Drop.
unsafe impl Send for PipeSecurity {}
// SAFETY: see above, shared access never mutates the descriptor.
unsafe impl Sync for PipeSecurity {}

impl PipeSecurity {
    fn new() -> io::Result<Self> {
        let sddl = HSTRING::from(PIPE_SDDL);
        let mut descriptor = PSECURITY_DESCRIPTOR::default();

        // SAFETY: `sddl` is a valid null-terminated wide string and `descriptor`
        // receives a LocalAlloc'd buffer released in Drop.
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                &sddl,
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )?;
        }

        Ok(Self { descriptor })
    }

    fn attributes(&self) -> SECURITY_ATTRIBUTES {
        SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: self.descriptor.0,
            bInheritHandle: false.into(),
        }
    }
}

impl Drop for PipeSecurity {
    fn drop(&mut self) {
        if !self.descriptor.0.is_null() {
            // SAFETY: allocated by ConvertStringSecurityDescriptorToSecurityDescriptorW.
            unsafe {
                let _ = LocalFree(HLOCAL(self.descriptor.0));
            }
        }
    }
}

/// Listening end of the channel
///
/// Always holds one idle pipe instance so that a client can connect while
/// the previous one is being handled.
pub struct ChannelListener {
    name: String,
    security: PipeSecurity,
    next: NamedPipeServer,
}

impl ChannelListener {
    /// Create the first pipe instance
    ///
    /// Fails if another process already owns a pipe with this name.
    pub fn bind(name: &str) -> Result<Self, ChannelError> {
        let bind_error = |source| ChannelError::Bind {
            name: name.to_string(),
            source,
        };

        let security = PipeSecurity::new().map_err(bind_error)?;
        let next = create_instance(name, &security, true).map_err(bind_error)?;

        Ok(Self {
            name: name.to_string(),
            security,
            next,
        })
    }

    /// Wait for the next client
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        if let Err(e) = self.next.connect().await {
            // The instance is unusable after a failed connect
            self.next = create_instance(&self.name, &self.security, false)?;
            return Err(e);
        }

        let fresh = create_instance(&self.name, &self.security, false)?;
        Ok(std::mem::replace(&mut self.next, fresh))
    }
}

fn create_instance(
    name: &str,
    security: &PipeSecurity,
    first: bool,
) -> io::Result<NamedPipeServer> {
    let mut attributes = security.attributes();
    let mut options = ServerOptions::new();
    options.first_pipe_instance(first).reject_remote_clients(true);

    // SAFETY: `attributes` is a valid SECURITY_ATTRIBUTES whose descriptor lives
    // as long as the listener.
    unsafe {
        options.create_with_security_attributes_raw(
            name,
            &mut attributes as *mut SECURITY_ATTRIBUTES as *mut c_void,
        )
    }
}

/// Dial the channel within `timeout`
///
/// Busy pipes are waited on inside the budget, a missing pipe fails at once.
pub async fn connect(name: &str, timeout: Duration) -> Result<ClientStream, ChannelError> {
    let deadline = Instant::now() + timeout;

    loop {
        match ClientOptions::new().open(name) {
            Ok(client) => return Ok(client),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY.0 as i32) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ChannelError::ServiceUnavailable {
                    name: name.to_string(),
                    source: e,
                });
            }
            Err(e) => {
                return Err(ChannelError::Connect {
                    name: name.to_string(),
                    source: e,
                });
            }
        }

        if Instant::now() + BUSY_RETRY_DELAY > deadline {
            return Err(ChannelError::Timeout {
                op: ChannelOp::Connect,
                timeout,
            });
        }
        time::sleep(BUSY_RETRY_DELAY).await;
    }
}
