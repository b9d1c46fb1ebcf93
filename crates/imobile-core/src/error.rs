//! Error types for the lockdown client stack.

use thiserror::Error;

/// Primary error type for all device operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Plist error: {0}")]
    Plist(#[from] PlistError),

    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Lockdown error: {0}")]
    Lockdown(#[from] LockdownError),

    #[error("Operation timed out")]
    Timeout,
}

/// Malformed plist input or output.
///
/// Every variant is fatal to the encode/decode call that produced it; no
/// partial tree is ever returned alongside one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlistError {
    #[error("Unknown node - binary tag {0:#x}")]
    UnknownBinaryTag(u8),

    #[error("Unknown node - XML tag \"{0}\"")]
    UnknownXmlTag(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Truncated data: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Offset {offset} out of bounds (limit {limit})")]
    OutOfBounds { offset: u64, limit: u64 },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("{0} nodes cannot be represented in {1} plists")]
    Unsupported(&'static str, &'static str),
}

/// Errors raised by the multiplexed device transport and service channels.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No established connection")]
    NoConnection,

    #[error("Message of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u32),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Mux error: {0}")]
    Mux(String),
}

/// Errors reported by, or about, the lockdown protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockdownError {
    #[error("Incorrect response returned, got {actual} instead of {expected}")]
    RequestMismatch { expected: String, actual: String },

    #[error("Invalid host ID")]
    InvalidHostId,

    #[error("Invalid service")]
    InvalidService,

    #[error("Missing value")]
    MissingValue,

    #[error("Pairing dialog response pending")]
    PairingDialogResponsePending,

    #[error("Device is protected, enter the passcode and try again")]
    PasswordRequired,

    #[error("Set prohibited")]
    SetProhibited,

    #[error("User denied pairing")]
    UserDeniedPairing,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Request failed")]
    Failure,

    #[error("Device is not paired")]
    NotPaired,

    #[error("Device is not in lockdown mode (reported type {0})")]
    IncorrectMode(String),

    #[error("Fatal pairing error: {0}")]
    FatalPairing(String),

    #[error("Failed to start service: {0}")]
    ServiceStart(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {key} has unexpected type, expected {expected}")]
    UnexpectedType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("No pair record available")]
    MissingPairRecord,

    #[error("Lockdown connection closed")]
    ConnectionClosed,
}

impl LockdownError {
    /// Map the `Error` string of a lockdown response to its error kind.
    ///
    /// Strings without a dedicated kind are carried through verbatim.
    pub fn from_device_error(error: &str) -> Self {
        match error {
            "InvalidHostID" => Self::InvalidHostId,
            "InvalidService" => Self::InvalidService,
            "MissingValue" => Self::MissingValue,
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "PasswordProtected" => Self::PasswordRequired,
            "SetProhibited" => Self::SetProhibited,
            "UserDeniedPairing" => Self::UserDeniedPairing,
            other => Self::Device(other.to_string()),
        }
    }
}

impl Error {
    /// The lockdown error kind, if this is one.
    pub fn lockdown(&self) -> Option<&LockdownError> {
        match self {
            Error::Lockdown(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
