//! Client configuration and builder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use imobile_core::error::Result;
use imobile_core::{ConnectionMedium, ConnectionType};
use imobile_plist::{PlistCodec, TagRegistry};
use imobile_service::{MuxProvider, RustlsUpgrade, TlsUpgrade};

use crate::clock::{Clock, TokioClock};
use crate::client::LockdownClient;
use crate::pair_record::default_system_records_dir;
use crate::pairing::CertificateGenerator;
use crate::DEFAULT_LABEL;

/// Settings for a lockdown connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockdownConfig {
    /// `Label` sent with every request.
    pub label: String,
    pub medium: ConnectionMedium,
    pub connection_type: ConnectionType,
    /// Device UDID or serial; `None` picks the first device.
    pub identifier: Option<String>,
    /// Pair automatically when no valid record exists.
    pub auto_pair: bool,
    /// How long to wait for the trust dialog. `None` waits forever.
    pub pair_timeout: Option<Duration>,
    /// Where records created by this host are cached.
    pub cache_dir: PathBuf,
    /// System-wide record directory searched first. `None` skips it.
    pub system_records_dir: Option<PathBuf>,
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            medium: ConnectionMedium::default(),
            connection_type: ConnectionType::default(),
            identifier: None,
            auto_pair: false,
            pair_timeout: None,
            cache_dir: default_cache_dir(),
            system_records_dir: default_system_records_dir(),
        }
    }
}

/// Per-user cache directory for pair records.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("imobile").join("pair_records"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Builder for [`LockdownClient`].
pub struct LockdownBuilder {
    config: LockdownConfig,
    provider: Arc<dyn MuxProvider>,
    tls: Arc<dyn TlsUpgrade>,
    certificates: Option<Arc<dyn CertificateGenerator>>,
    clock: Arc<dyn Clock>,
    registry: Arc<TagRegistry>,
}

impl LockdownBuilder {
    /// Create new builder with defaults over a transport provider.
    pub fn new(provider: Arc<dyn MuxProvider>) -> Self {
        Self {
            config: LockdownConfig::default(),
            provider,
            tls: Arc::new(RustlsUpgrade::new()),
            certificates: None,
            clock: Arc::new(TokioClock),
            registry: Arc::new(TagRegistry::standard()),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LockdownConfig) -> Self {
        self.config = config;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    pub fn medium(mut self, medium: ConnectionMedium) -> Self {
        self.config.medium = medium;
        self
    }

    pub fn connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.config.connection_type = connection_type;
        self
    }

    /// Target a specific device by UDID or serial.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.config.identifier = Some(identifier.into());
        self
    }

    pub fn auto_pair(mut self, enabled: bool) -> Self {
        self.config.auto_pair = enabled;
        self
    }

    /// Set how long pairing waits for the user to answer the trust dialog.
    ///
    /// A zero timeout sends a single `Pair` request.
    pub fn pair_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pair_timeout = timeout;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn system_records_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.config.system_records_dir = dir;
        self
    }

    pub fn tls_upgrade(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = tls;
        self
    }

    /// Certificate generator used by [`LockdownClient::pair`].
    pub fn certificate_generator(mut self, generator: Arc<dyn CertificateGenerator>) -> Self {
        self.certificates = Some(generator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(mut self, registry: Arc<TagRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Connect, verify the lockdown service and establish a session.
    pub async fn connect(self) -> Result<LockdownClient> {
        let mut client = LockdownClient::new(
            self.config,
            self.provider,
            self.tls,
            self.certificates,
            self.clock,
            PlistCodec::new(self.registry),
        );
        client.establish().await?;
        Ok(client)
    }
}
