//! Pairing collaborators and outcomes.

use std::time::Duration;

use imobile_core::error::Result;
use tokio::time::Instant;

use crate::clock::Clock;

/// Delay between `Pair` attempts while the trust dialog is showing.
pub const PAIR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// PEM material produced for a new pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCertificates {
    pub host_certificate: Vec<u8>,
    pub root_certificate: Vec<u8>,
    pub device_certificate: Vec<u8>,
    /// Private key shared by the host and root certificates.
    pub private_key: Vec<u8>,
}

/// Generates the certificate chain for a device public key.
#[cfg_attr(test, mockall::automock)]
pub trait CertificateGenerator: Send + Sync {
    fn generate(&self, device_public_key: &[u8]) -> Result<PairingCertificates>;
}

/// Why a session could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotPairedReason {
    /// No store holds a record for the device.
    NoPairRecord,
    /// The device refused `ValidatePair`.
    ValidatePairRejected,
    /// The device does not recognise the record's host id.
    InvalidHostId,
}

/// Result of session validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired,
    NotPaired(NotPairedReason),
}

impl PairingOutcome {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairingOutcome::Paired)
    }
}

/// Deadline bookkeeping for the `Pair` retry loop.
///
/// A `None` timeout waits forever; a zero timeout never retries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PairingPoll {
    started: Instant,
    timeout: Option<Duration>,
}

impl PairingPoll {
    pub(crate) fn start(clock: &dyn Clock, timeout: Option<Duration>) -> Self {
        Self {
            started: clock.now(),
            timeout,
        }
    }

    pub(crate) fn may_retry(&self, clock: &dyn Clock) -> bool {
        match self.timeout {
            None => true,
            Some(limit) => clock.now().duration_since(self.started) < limit,
        }
    }
}
