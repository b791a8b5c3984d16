//! Error types for iSCSI initiator operations

use crate::context::CommandStatus;
use thiserror::Error;

/// iSCSI initiator errors
///
/// The async API returns these only synchronously, before an operation is
/// queued. Once a PDU is queued every outcome reaches its callback instead;
/// the blocking wrappers turn a non-`Good` callback into [`IscsiError::Operation`].
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Operation finished with {status:?}: {message}")]
    Operation { status: CommandStatus, message: String },
}

/// Result type for initiator operations
pub type IscsiResult<T> = Result<T, IscsiError>;

/// Decode a login response status (RFC 3720 Section 10.13.5) into a message
/// suitable for logs and error reports.
pub fn decode_login_status(class: u8, detail: u8) -> String {
    let text = match (class, detail) {
        (0x00, 0x00) => "Login success",
        (0x01, 0x01) => {
            "Target moved temporarily: retry the login at the portal given in TargetAddress"
        }
        (0x01, 0x02) => {
            "Target moved permanently: update the configuration to use the portal given in TargetAddress"
        }
        (0x02, 0x00) => "Initiator error: the target rejected the login request",
        (0x02, 0x01) => {
            "Authentication failed: check the CHAP username and password configured for this initiator"
        }
        (0x02, 0x02) => {
            "Authorization failure: the initiator is not in the target's ACL \
             (for tgtd, bind it with 'tgtadm --op bind --mode target --initiator-name ...')"
        }
        (0x02, 0x03) => {
            "Target not found: the requested TargetName doesn't exist on this portal; run discovery to list targets"
        }
        (0x02, 0x04) => "Target removed: the target has been removed and is no longer available",
        (0x02, 0x05) => "Unsupported version: the target does not support this iSCSI protocol version",
        (0x02, 0x06) => {
            "Too many connections: the session already has the maximum allowed by MaxConnections"
        }
        (0x02, 0x07) => {
            "Missing parameter: a required key such as InitiatorName, TargetName or SessionType was not sent"
        }
        (0x02, 0x08) => "Can't include in session: the connection cannot be added to this session",
        (0x02, 0x09) => {
            "Session type not supported: use a discovery session for SendTargets or supply a TargetName"
        }
        (0x02, 0x0a) => "Session does not exist: the target has no session matching this TSIH",
        (0x02, 0x0b) => "Invalid request during login: the target refused a PDU sent in the login phase",
        (0x03, 0x00) => "Target error: the target hit an internal failure during login",
        (0x03, 0x01) => {
            "Service unavailable: the target service is currently unavailable; wait and retry"
        }
        (0x03, 0x02) => "Out of resources: the target is out of resources for new sessions",
        _ => {
            return format!(
                "Unknown login status 0x{:02x}{:02x}: unrecognized code (see RFC 3720 Section 10.13.5)",
                class, detail
            )
        }
    };
    format!("{} (status 0x{:02x}{:02x})", text, class, detail)
}
