//! Cross-session launch with a re-stamped service token
//!
//! The service duplicates its own primary token, stamps the copy with the
//! caller's session id and creates the target with it on that session's
//! interactive desktop. The user's own logon token is only used to resolve
//! their LocalAppData folder, which is handed to the target as its argument.
//!
//! Every handle and the environment block are owned by a guard, so each one
//! is released exactly once whichever step fails.

use super::{LaunchTarget, Launcher};
use crate::error::{LaunchError, LaunchStep};
use crate::protocol::SessionId;
use std::ffi::{c_void, OsStr};
use std::io;
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Security::{
    DuplicateTokenEx, SecurityImpersonation, SetTokenInformation, TokenPrimary, TokenSessionId,
    TOKEN_ACCESS_MASK, TOKEN_ALL_ACCESS,
};
use windows::Win32::System::Com::CoTaskMemFree;
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::RemoteDesktop::WTSQueryUserToken;
use windows::Win32::System::SystemServices::MAXIMUM_ALLOWED;
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, GetCurrentProcess, OpenProcessToken, CREATE_NEW_CONSOLE,
    CREATE_UNICODE_ENVIRONMENT, PROCESS_INFORMATION, STARTF_USESHOWWINDOW, STARTUPINFOW,
};
use windows::Win32::UI::Shell::{FOLDERID_LocalAppData, SHGetKnownFolderPath, KF_FLAG_DEFAULT};
use windows::Win32::UI::WindowsAndMessaging::SW_SHOW;

const INTERACTIVE_DESKTOP: &str = r"winsta0\default";

/// Kernel handle closed on drop
struct OwnedHandle(HANDLE);

// SAFETY: a kernel handle may be used and closed from any thread.
unsafe impl Send for OwnedHandle {}

impl OwnedHandle {
    fn empty() -> Self {
        Self(HANDLE::default())
    }

    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            // SAFETY: the handle is owned by this guard and closed only here.
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// Environment block built from a token
struct EnvBlock(*mut c_void);

impl EnvBlock {
    fn new(token: &OwnedHandle) -> Result<Self, LaunchError> {
        let mut block = std::ptr::null_mut();

        // SAFETY: `token` is a valid primary token, `block` receives memory
        // released by DestroyEnvironmentBlock in Drop.
        unsafe { CreateEnvironmentBlock(&mut block, token.raw(), false) }
            .map_err(|e| LaunchError::token(LaunchStep::BuildEnvironment, e))?;

        Ok(Self(block))
    }
}

impl Drop for EnvBlock {
    fn drop(&mut self) {
        // SAFETY: allocated by CreateEnvironmentBlock and destroyed once.
        unsafe {
            let _ = DestroyEnvironmentBlock(self.0);
        }
    }
}

/// Launches the target into the requesting user's session
pub struct SessionLauncher {
    target: LaunchTarget,
}

impl SessionLauncher {
    pub fn new(target: LaunchTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &LaunchTarget {
        &self.target
    }
}

impl Launcher for SessionLauncher {
    fn launch(&self, session_id: SessionId) -> Result<(), LaunchError> {
        let service_token = open_process_token()?;
        let session_token = duplicate_primary(&service_token)?;
        stamp_session(&session_token, session_id)?;

        let local_app_data = user_local_app_data(session_id)?;
        debug!(session = %session_id, "User LocalAppData: {}", local_app_data.display());

        let environment = EnvBlock::new(&session_token)?;
        let pid = create_process(&session_token, &environment, &self.target, &local_app_data)?;

        info!(
            session = %session_id,
            pid,
            "Started {} in {}",
            self.target.executable.display(),
            self.target.working_dir.display()
        );
        Ok(())
    }
}

fn open_process_token() -> Result<OwnedHandle, LaunchError> {
    let mut token = OwnedHandle::empty();

    // SAFETY: the pseudo handle of the current process is always valid.
    unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_ALL_ACCESS, &mut token.0) }
        .map_err(|e| LaunchError::token(LaunchStep::OpenToken, e))?;

    Ok(token)
}

fn duplicate_primary(token: &OwnedHandle) -> Result<OwnedHandle, LaunchError> {
    let mut duplicate = OwnedHandle::empty();

    // SAFETY: `token` is a valid token handle, `duplicate` receives a new owned handle.
    unsafe {
        DuplicateTokenEx(
            token.raw(),
            TOKEN_ACCESS_MASK(MAXIMUM_ALLOWED),
            None,
            SecurityImpersonation,
            TokenPrimary,
            &mut duplicate.0,
        )
    }
    .map_err(|e| LaunchError::token(LaunchStep::DuplicateToken, e))?;

    Ok(duplicate)
}

fn stamp_session(token: &OwnedHandle, session_id: SessionId) -> Result<(), LaunchError> {
    let session = session_id.0;

    // SAFETY: TokenSessionId takes a DWORD, `session` outlives the call.
    unsafe {
        SetTokenInformation(
            token.raw(),
            TokenSessionId,
            &session as *const u32 as *const c_void,
            mem::size_of::<u32>() as u32,
        )
    }
    .map_err(|e| LaunchError::token(LaunchStep::StampSession, e))
}

fn user_local_app_data(session_id: SessionId) -> Result<PathBuf, LaunchError> {
    let mut user_token = OwnedHandle::empty();

    // SAFETY: `user_token` receives a new owned handle.
    unsafe { WTSQueryUserToken(session_id.0, &mut user_token.0) }
        .map_err(|e| LaunchError::token(LaunchStep::QueryUserToken, e))?;

    // SAFETY: `user_token` is a valid primary token for the session user.
    let raw = unsafe { SHGetKnownFolderPath(&FOLDERID_LocalAppData, KF_FLAG_DEFAULT, user_token.raw()) }
        .map_err(|e| LaunchError::token(LaunchStep::ResolveLocalAppData, e))?;

    // SAFETY: `raw` is a null-terminated string owned by us until CoTaskMemFree.
    let path = unsafe { raw.to_string() };
    // SAFETY: allocated by SHGetKnownFolderPath, freed exactly once.
    unsafe { CoTaskMemFree(Some(raw.0 as *const c_void)) };

    path.map(PathBuf::from).map_err(|e| {
        LaunchError::token(
            LaunchStep::ResolveLocalAppData,
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })
}

fn create_process(
    token: &OwnedHandle,
    environment: &EnvBlock,
    target: &LaunchTarget,
    local_app_data: &Path,
) -> Result<u32, LaunchError> {
    let application = to_wide(target.executable.as_os_str());
    let working_dir = to_wide(target.working_dir.as_os_str());
    let mut command_line = to_wide(OsStr::new(&format!(
        "\"{}\" \"{}\"",
        target.executable.display(),
        local_app_data.display()
    )));
    let mut desktop = to_wide(OsStr::new(INTERACTIVE_DESKTOP));

    let startup = STARTUPINFOW {
        cb: mem::size_of::<STARTUPINFOW>() as u32,
        lpDesktop: PWSTR(desktop.as_mut_ptr()),
        dwFlags: STARTF_USESHOWWINDOW,
        wShowWindow: SW_SHOW.0 as u16,
        ..Default::default()
    };
    let mut process_info = PROCESS_INFORMATION::default();

    // SAFETY: all strings are null-terminated and outlive the call, the
    // environment block is Unicode as declared by the creation flags.
    unsafe {
        CreateProcessAsUserW(
            token.raw(),
            PCWSTR(application.as_ptr()),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            false,
            CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_CONSOLE,
            Some(environment.0 as *const c_void),
            PCWSTR(working_dir.as_ptr()),
            &startup,
            &mut process_info,
        )
    }
    .map_err(|e| LaunchError::ProcessCreation(e.into()))?;

    // The child keeps running, we only drop our references to it
    let _process = OwnedHandle(process_info.hProcess);
    let _thread = OwnedHandle(process_info.hThread);

    Ok(process_info.dwProcessId)
}

fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0)).collect()
}
