//! Device representation and identification types.

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// How usbmuxd reaches a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionType {
    #[default]
    Usb,
    Network,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Usb => "USB",
            ConnectionType::Network => "Network",
        }
    }
}

impl FromStr for ConnectionType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USB" => Ok(ConnectionType::Usb),
            "Network" => Ok(ConnectionType::Network),
            other => Err(TransportError::Mux(format!(
                "Unknown connection type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Medium the lockdown connection is carried over.
///
/// Only the usbmux medium has a daemon-side pair record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMedium {
    #[default]
    Usbmux,
    Tcp,
}

/// A device as reported by the multiplexing daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbmuxdDevice {
    pub device_id: u32,
    pub serial_number: String,
    pub connection_type: ConnectionType,
}

impl UsbmuxdDevice {
    pub fn new(
        device_id: u32,
        serial_number: impl Into<String>,
        connection_type: ConnectionType,
    ) -> Self {
        Self {
            device_id,
            serial_number: serial_number.into(),
            connection_type,
        }
    }
}

/// Product family reported in the `DeviceClass` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    Iphone,
    Ipad,
    Ipod,
    Watch,
    AppleTv,
    HomePod,
    #[default]
    Unknown,
}

impl DeviceClass {
    /// Parse a `DeviceClass` string. Unrecognised classes map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "iPhone" => DeviceClass::Iphone,
            "iPad" => DeviceClass::Ipad,
            "iPod" => DeviceClass::Ipod,
            "Watch" => DeviceClass::Watch,
            "AppleTV" => DeviceClass::AppleTv,
            "HomePod" => DeviceClass::HomePod,
            _ => DeviceClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Iphone => "iPhone",
            DeviceClass::Ipad => "iPad",
            DeviceClass::Ipod => "iPod",
            DeviceClass::Watch => "Watch",
            DeviceClass::AppleTv => "AppleTV",
            DeviceClass::HomePod => "HomePod",
            DeviceClass::Unknown => "Unknown",
        }
    }
}

/// Parsed product version (e.g., "17.4.1").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse version from string.
    ///
    /// Supports formats:
    /// - "17.4.1" (three parts)
    /// - "17.4" (two parts, patch defaults to 0)
    /// - "17" (one part, minor and patch default to 0)
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        let mut parts = s.split('.');
        let major = parts.next()?.parse::<u32>().ok()?;
        let minor = match parts.next() {
            Some(p) => p.parse::<u32>().ok()?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(p) => p.parse::<u32>().ok()?,
            None => 0,
        };

        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
