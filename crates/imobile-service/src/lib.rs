//! # imobile-service
//!
//! Device transport contract and framed service connections.
//!
//! This crate provides:
//! - The traits a usbmuxd client implements ([`MuxProvider`], [`MuxTransport`])
//! - [`ServiceConnection`], a length-framed plist channel with in-place TLS upgrade
//! - [`RustlsUpgrade`], the default TLS upgrade

pub mod connection;
pub mod tls;
pub mod traits;

pub use connection::{ServiceConnection, MAX_FRAME_LEN};
pub use tls::RustlsUpgrade;
pub use traits::{
    device_from_properties, DeviceSocket, DeviceStream, MuxProvider, MuxTransport, TlsUpgrade,
};
