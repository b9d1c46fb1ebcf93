//! # imobile-core
//!
//! Core types and error definitions shared across all imobile crates.
//!
//! This crate provides:
//! - Usbmuxd device descriptors and connection types
//! - Device class and product version parsing
//! - Common error types

pub mod device;
pub mod error;

pub use device::{ConnectionMedium, ConnectionType, DeviceClass, UsbmuxdDevice, Version};
pub use error::{Error, LockdownError, PlistError, Result, TransportError};
