//! Application event log source for the service
//!
//! The source is registered against `EventCreate.exe` as message file, so any
//! event id from 1 to 1000 renders the inserted string as is.

use crate::error::ServiceError;
use crate::logging::LineSink;
use std::io;
use std::iter;
use tracing::Level;
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{HANDLE, PSID};
use windows::Win32::System::EventLog::{
    DeregisterEventSource, RegisterEventSourceW, ReportEventW, EVENTLOG_ERROR_TYPE,
    EVENTLOG_INFORMATION_TYPE, EVENTLOG_WARNING_TYPE, REPORT_EVENT_TYPE,
};
use winreg::enums::{RegDisposition, RegType, HKEY_LOCAL_MACHINE};
use winreg::{RegKey, RegValue};

const APPLICATION_LOG_KEY: &str = r"SYSTEM\CurrentControlSet\Services\EventLog\Application";
const EVENT_MESSAGE_FILE: &str = r"%SystemRoot%\System32\EventCreate.exe";

/// Error, warning and information events
const TYPES_SUPPORTED: u32 = 0x7;

/// Event id used for every line
const EVENT_ID: u32 = 1;

fn source_key(name: &str) -> String {
    format!(r"{}\{}", APPLICATION_LOG_KEY, name)
}

fn source_error(op: &'static str) -> impl FnOnce(io::Error) -> ServiceError {
    move |source| ServiceError::EventSource { op, source }
}

/// Register `name` as an Application event log source
///
/// Fails if the source is already registered.
pub fn install_source(name: &str) -> Result<(), ServiceError> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let (key, disposition) = hklm
        .create_subkey(source_key(name))
        .map_err(source_error("create registry key"))?;

    if matches!(disposition, RegDisposition::REG_OPENED_EXISTING_KEY) {
        return Err(ServiceError::EventSource {
            op: "create registry key",
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} registry key already exists", source_key(name)),
            ),
        });
    }

    let message_file: Vec<u8> = EVENT_MESSAGE_FILE
        .encode_utf16()
        .chain(iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect();

    key.set_raw_value(
        "EventMessageFile",
        &RegValue {
            vtype: RegType::REG_EXPAND_SZ,
            bytes: message_file,
        },
    )
    .map_err(source_error("set EventMessageFile"))?;
    key.set_value("TypesSupported", &TYPES_SUPPORTED)
        .map_err(source_error("set TypesSupported"))?;
    key.set_value("CustomSource", &1u32)
        .map_err(source_error("set CustomSource"))?;

    Ok(())
}

/// Remove the event log source registration
pub fn remove_source(name: &str) -> Result<(), ServiceError> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    match hklm.delete_subkey(source_key(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ServiceError::EventSource {
            op: "delete registry key",
            source: e,
        }),
    }
}

/// Line sink writing each line as one event
pub struct EventLogSink {
    handle: HANDLE,
}

// SAFETY: event log handles may be used from any thread, ReportEventW is thread-safe.
unsafe impl Send for EventLogSink {}
// SAFETY: see above.
unsafe impl Sync for EventLogSink {}

impl EventLogSink {
    /// Open the registered source `name`
    pub fn register(name: &str) -> io::Result<Self> {
        let source = HSTRING::from(name);

        // SAFETY: `source` is a valid null-terminated wide string.
        let handle = unsafe { RegisterEventSourceW(PCWSTR::null(), &source) }?;

        Ok(Self { handle })
    }

    fn report(&self, event_type: REPORT_EVENT_TYPE, line: &str) -> io::Result<()> {
        let message = HSTRING::from(line);
        let strings = [PCWSTR(message.as_ptr())];

        // SAFETY: the handle is valid until Drop and `strings` outlives the call.
        unsafe {
            ReportEventW(
                self.handle,
                event_type,
                0,
                EVENT_ID,
                PSID::default(),
                0,
                Some(&strings),
                None,
            )
        }?;

        Ok(())
    }
}

impl LineSink for EventLogSink {
    fn write_line(&self, level: Level, line: &str) {
        let event_type = match level {
            Level::ERROR => EVENTLOG_ERROR_TYPE,
            Level::WARN => EVENTLOG_WARNING_TYPE,
            _ => EVENTLOG_INFORMATION_TYPE,
        };

        // Nowhere left to report a failure to
        let _ = self.report(event_type, line);
    }
}

impl Drop for EventLogSink {
    fn drop(&mut self) {
        // SAFETY: the handle came from RegisterEventSourceW and is released once.
        unsafe {
            let _ = DeregisterEventSource(self.handle);
        }
    }
}
