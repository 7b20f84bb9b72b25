//! Wire format shared by the pipe server and client
//!
//! A request is the caller's session id as four big-endian bytes. The reply is
//! four bytes as well: `OKOK` when the target was launched, `!!!!` otherwise.
//! There is no length prefix and no version field.

use crate::error::ProtocolError;
use std::fmt;

/// Request size in bytes
pub const REQUEST_LEN: usize = 4;

/// Response size in bytes
pub const RESPONSE_LEN: usize = 4;

/// Reply sent when the target process was created
pub const SUCCESS_SENTINEL: [u8; RESPONSE_LEN] = *b"OKOK";

/// Reply sent when the launch failed for any reason
pub const FAILURE_SENTINEL: [u8; RESPONSE_LEN] = [0x21; RESPONSE_LEN];

/// Identifier of an interactive logon session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single launch request, one per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub session_id: SessionId,
}

impl LaunchRequest {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        self.session_id.0.to_be_bytes()
    }

    pub fn decode(bytes: [u8; REQUEST_LEN]) -> Self {
        Self::new(SessionId(u32::from_be_bytes(bytes)))
    }
}

/// Result of a launch as seen on the wire
///
/// The failure cause stays on the service side (it is logged there), only
/// success or failure is transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Success,
    Failure,
}

impl LaunchOutcome {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            LaunchOutcome::Success
        } else {
            LaunchOutcome::Failure
        }
    }

    pub fn to_bytes(self) -> [u8; RESPONSE_LEN] {
        match self {
            LaunchOutcome::Success => SUCCESS_SENTINEL,
            LaunchOutcome::Failure => FAILURE_SENTINEL,
        }
    }

    /// Decode a reply, rejecting anything that is not one of the two sentinels
    pub fn from_bytes(bytes: [u8; RESPONSE_LEN]) -> Result<Self, ProtocolError> {
        match bytes {
            SUCCESS_SENTINEL => Ok(LaunchOutcome::Success),
            FAILURE_SENTINEL => Ok(LaunchOutcome::Failure),
            other => Err(ProtocolError::UnexpectedReply(other)),
        }
    }

    pub fn is_success(self) -> bool {
        self == LaunchOutcome::Success
    }
}
