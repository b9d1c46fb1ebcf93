//! # imobile-lockdown
//!
//! Client for the lockdown service every iOS device runs on port 62078.
//!
//! This crate provides:
//! - [`LockdownClient`] for sessions, values and service start
//! - Pairing with a pluggable [`CertificateGenerator`]
//! - [`PairRecord`] persistence across the system, transport and cache stores
//!
//! ## Example
//!
//! ```ignore
//! use imobile_lockdown::LockdownBuilder;
//! use std::sync::Arc;
//!
//! let mut lockdown = LockdownBuilder::new(Arc::new(my_usbmux))
//!     .certificate_generator(Arc::new(my_generator))
//!     .auto_pair(true)
//!     .connect()
//!     .await?;
//!
//! println!("{}", lockdown.device_name().await?);
//! let afc = lockdown.start_service("com.apple.afc").await?;
//! ```

mod builder;
mod client;
mod clock;
mod fields;
mod pair_record;
mod pairing;

pub use builder::{default_cache_dir, LockdownBuilder, LockdownConfig};
pub use client::{LockdownClient, LockdownState};
pub use clock::{Clock, TokioClock};
pub use pair_record::{default_system_records_dir, record_path, PairRecord};
pub use pairing::{
    CertificateGenerator, NotPairedReason, PairingCertificates, PairingOutcome,
    PAIR_POLL_INTERVAL,
};

// Re-export commonly used types
pub use imobile_core::{DeviceClass, Error, LockdownError, Result, Version};

/// Lockdown service port.
pub const LOCKDOWN_PORT: u16 = 62078;

/// `Type` reported by `QueryType` when talking to lockdown.
pub const LOCKDOWN_SERVICE_TYPE: &str = "com.apple.mobile.lockdown";

/// Default request `Label`.
pub const DEFAULT_LABEL: &str = "imobile-rs";

/// Domain holding the Wi-Fi connection settings.
pub const WIRELESS_LOCKDOWN_DOMAIN: &str = "com.apple.mobile.wireless_lockdown";
