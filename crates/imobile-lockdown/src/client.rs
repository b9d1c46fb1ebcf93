//! Lockdown protocol client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use imobile_core::error::{Error, Result};
use imobile_core::{ConnectionMedium, DeviceClass, LockdownError, Version};
use imobile_plist::{Dictionary, PlistCodec, PropertyNode};
use imobile_service::{MuxProvider, ServiceConnection, TlsUpgrade};

use crate::builder::LockdownConfig;
use crate::clock::Clock;
use crate::fields;
use crate::pair_record::{record_path, PairRecord};
use crate::pairing::{
    CertificateGenerator, NotPairedReason, PairingOutcome, PairingPoll, PAIR_POLL_INTERVAL,
};
use crate::{LOCKDOWN_PORT, LOCKDOWN_SERVICE_TYPE, WIRELESS_LOCKDOWN_DOMAIN};

/// Protocol state of a [`LockdownClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownState {
    /// Socket open, service type not yet checked.
    Connected,
    TypeVerified,
    Unpaired,
    Paired,
    SessionActive,
    /// Session running over TLS.
    SecureSession,
    /// Connection discarded; requests fail with `ConnectionClosed`.
    Closed,
}

/// Client for the lockdown service on port 62078.
pub struct LockdownClient {
    config: LockdownConfig,
    provider: Arc<dyn MuxProvider>,
    tls: Arc<dyn TlsUpgrade>,
    certificates: Option<Arc<dyn CertificateGenerator>>,
    clock: Arc<dyn Clock>,
    codec: PlistCodec,
    service: Option<ServiceConnection>,
    identifier: Option<String>,
    udid: Option<String>,
    serial_number: Option<String>,
    device_class: DeviceClass,
    product_version: Option<Version>,
    all_values: Dictionary,
    pair_record: Option<PairRecord>,
    session_id: Option<String>,
    paired: bool,
    state: LockdownState,
}

impl LockdownClient {
    pub(crate) fn new(
        config: LockdownConfig,
        provider: Arc<dyn MuxProvider>,
        tls: Arc<dyn TlsUpgrade>,
        certificates: Option<Arc<dyn CertificateGenerator>>,
        clock: Arc<dyn Clock>,
        codec: PlistCodec,
    ) -> Self {
        Self {
            config,
            provider,
            tls,
            certificates,
            clock,
            codec,
            service: None,
            identifier: None,
            udid: None,
            serial_number: None,
            device_class: DeviceClass::Unknown,
            product_version: None,
            all_values: Dictionary::new(),
            pair_record: None,
            session_id: None,
            paired: false,
            state: LockdownState::Closed,
        }
    }

    /// Open the lockdown connection and bring it up to a session if possible.
    pub(crate) async fn establish(&mut self) -> Result<()> {
        let service = ServiceConnection::open(
            self.provider.as_ref(),
            self.config.connection_type,
            self.config.identifier.as_deref(),
            LOCKDOWN_PORT,
            self.codec.clone(),
        )
        .await?;
        self.service = Some(service);
        self.state = LockdownState::Connected;

        let service_type = self.query_type().await?;
        if service_type != LOCKDOWN_SERVICE_TYPE {
            self.discard().await;
            return Err(LockdownError::IncorrectMode(service_type).into());
        }
        self.state = LockdownState::TypeVerified;

        self.refresh_values().await?;
        self.identifier = self
            .config
            .identifier
            .clone()
            .or_else(|| self.mux_serial())
            .or_else(|| self.udid.clone());
        tracing::debug!(
            identifier = self.identifier.as_deref().unwrap_or("<unknown>"),
            class = self.device_class.as_str(),
            "Lockdown service verified"
        );

        match self.validate_pairing().await? {
            PairingOutcome::Paired => {}
            PairingOutcome::NotPaired(reason) if !self.config.auto_pair => {
                tracing::info!(?reason, "Device is not paired with this host");
                return Ok(());
            }
            PairingOutcome::NotPaired(reason) => {
                tracing::info!(?reason, "Pairing with device");
                self.pair(self.config.pair_timeout).await?;
                if let PairingOutcome::NotPaired(reason) = self.validate_pairing().await? {
                    return Err(LockdownError::FatalPairing(format!(
                        "session rejected after pairing ({:?})",
                        reason
                    ))
                    .into());
                }
            }
        }

        self.refresh_values().await?;
        Ok(())
    }

    fn mux_serial(&self) -> Option<String> {
        if self.config.medium != ConnectionMedium::Usbmux {
            return None;
        }
        self.service
            .as_ref()
            .and_then(ServiceConnection::device)
            .map(|device| device.serial_number.clone())
    }

    /// Send a request and verify the echoed `Request` name.
    pub async fn request(
        &mut self,
        request: &str,
        options: Option<Dictionary>,
    ) -> Result<Dictionary> {
        let response = self.send_request(request, options, true).await?;
        check_error(&response)?;
        check_result(&response)?;
        Ok(response)
    }

    /// Send a request without checking the echoed `Request` name.
    pub async fn request_unverified(
        &mut self,
        request: &str,
        options: Option<Dictionary>,
    ) -> Result<Dictionary> {
        let response = self.send_request(request, options, false).await?;
        check_error(&response)?;
        check_result(&response)?;
        Ok(response)
    }

    async fn send_request(
        &mut self,
        request: &str,
        options: Option<Dictionary>,
        verify: bool,
    ) -> Result<Dictionary> {
        let mut message = options.unwrap_or_default();
        message.insert("Label", self.config.label.as_str());
        message.insert("Request", request);

        let service = self
            .service
            .as_mut()
            .ok_or(LockdownError::ConnectionClosed)?;
        tracing::debug!(request, "Lockdown request");
        let response = match service.send_receive(&message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(request, error = %e, "Lockdown connection lost");
                self.discard().await;
                return Err(e);
            }
        };

        if verify {
            let echoed = response.get("Request").and_then(PropertyNode::as_string);
            if echoed != Some(request) {
                return Err(LockdownError::RequestMismatch {
                    expected: request.to_string(),
                    actual: echoed.unwrap_or("<missing>").to_string(),
                }
                .into());
            }
        }
        Ok(response)
    }

    /// The service type the device reports.
    pub async fn query_type(&mut self) -> Result<String> {
        let response = self.request("QueryType", None).await?;
        fields::require_string(&response, "Type")
    }

    /// Read a value. `None` for both domain and key returns every value.
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<PropertyNode> {
        let mut options = Dictionary::new();
        if let Some(domain) = domain {
            options.insert("Domain", domain);
        }
        if let Some(key) = key {
            options.insert("Key", key);
        }

        let mut response = self.request("GetValue", Some(options)).await?;
        response
            .remove("Data")
            .or_else(|| response.remove("Value"))
            .ok_or_else(|| LockdownError::MissingField("Value").into())
    }

    /// Write a value. Without a key the value replaces the whole domain.
    pub async fn set_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
        value: impl Into<PropertyNode>,
    ) -> Result<()> {
        let mut options = Dictionary::new();
        if let Some(domain) = domain {
            options.insert("Domain", domain);
        }
        if let Some(key) = key {
            options.insert("Key", key);
        }
        options.insert("Value", value);
        self.request("SetValue", Some(options)).await?;
        Ok(())
    }

    /// Fetch the full value set and cache it.
    pub async fn all_values(&mut self) -> Result<Dictionary> {
        let values = self
            .get_value(None, None)
            .await?
            .into_dictionary()
            .ok_or(LockdownError::UnexpectedType {
                key: "Value",
                expected: "Dictionary",
            })?;
        self.all_values = values.clone();
        Ok(values)
    }

    /// Re-read the value set and the identity fields derived from it.
    pub async fn refresh_values(&mut self) -> Result<()> {
        let values = self.all_values().await?;
        self.udid = fields::string(&values, "UniqueDeviceID")?;
        self.serial_number = fields::string(&values, "SerialNumber")?;
        self.product_version = fields::string(&values, "ProductVersion")?
            .as_deref()
            .and_then(Version::parse);
        self.device_class = fields::string(&values, "DeviceClass")?
            .as_deref()
            .map_or(DeviceClass::Unknown, DeviceClass::parse);
        Ok(())
    }

    pub async fn device_name(&mut self) -> Result<String> {
        self.get_value(None, Some("DeviceName"))
            .await?
            .as_string()
            .map(str::to_string)
            .ok_or_else(|| {
                LockdownError::UnexpectedType {
                    key: "DeviceName",
                    expected: "String",
                }
                .into()
            })
    }

    /// Whether the device accepts lockdown connections over Wi-Fi.
    pub async fn enable_wifi_connections(&mut self) -> Result<bool> {
        self.get_value(Some(WIRELESS_LOCKDOWN_DOMAIN), Some("EnableWifiConnections"))
            .await?
            .as_boolean()
            .ok_or_else(|| {
                LockdownError::UnexpectedType {
                    key: "EnableWifiConnections",
                    expected: "Boolean",
                }
                .into()
            })
    }

    pub async fn set_enable_wifi_connections(&mut self, enabled: bool) -> Result<()> {
        self.set_value(
            Some(WIRELESS_LOCKDOWN_DOMAIN),
            Some("EnableWifiConnections"),
            enabled,
        )
        .await
    }

    /// Load the first pair record found for this device.
    ///
    /// Order: system record directory, transport store (usbmux only), local
    /// cache. A record already held by the client is kept.
    pub async fn init_preferred_pair_record(&mut self) -> Result<()> {
        if self.pair_record.is_some() {
            return Ok(());
        }
        let Some(identifier) = self.identifier.clone() else {
            return Ok(());
        };

        if let Some(dir) = &self.config.system_records_dir {
            if let Some(record) = self.load_record_file(&record_path(dir, &identifier)) {
                tracing::debug!(%identifier, "Using system pair record");
                self.pair_record = Some(record);
                return Ok(());
            }
        }

        if self.config.medium == ConnectionMedium::Usbmux {
            let mut transport = self.provider.create(self.config.connection_type)?;
            let fetched = transport.get_pair_record(&identifier).await;
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "Closing transport failed");
            }
            if let Some(bytes) = fetched? {
                match PairRecord::from_bytes(&self.codec, &bytes) {
                    Ok(record) => {
                        tracing::debug!(%identifier, "Using pair record from transport store");
                        self.pair_record = Some(record);
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(%identifier, error = %e, "Ignoring malformed stored pair record")
                    }
                }
            }
        }

        let cached = record_path(&self.config.cache_dir, &identifier);
        if let Some(record) = self.load_record_file(&cached) {
            tracing::debug!(%identifier, "Using cached pair record");
            self.pair_record = Some(record);
        }
        Ok(())
    }

    fn load_record_file(&self, path: &Path) -> Option<PairRecord> {
        match PairRecord::load(&self.codec, path) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable pair record");
                None
            }
        }
    }

    /// Start a session with the available pair record.
    pub async fn validate_pairing(&mut self) -> Result<PairingOutcome> {
        self.init_preferred_pair_record().await?;
        let Some(record) = self.pair_record.clone() else {
            return Ok(self.not_paired(NotPairedReason::NoPairRecord));
        };

        let legacy = self
            .product_version
            .is_some_and(|version| version < Version::new(7, 0, 0))
            && self.device_class != DeviceClass::Watch;
        if legacy {
            let mut options = Dictionary::new();
            options.insert("PairRecord", record.to_dictionary());
            options.insert("ProtocolVersion", "2");
            if let Err(e) = self.request("ValidatePair", Some(options)).await {
                tracing::warn!(error = %e, "ValidatePair rejected");
                return Ok(self.not_paired(NotPairedReason::ValidatePairRejected));
            }
        }

        let mut options = Dictionary::new();
        options.insert("HostID", record.host_id.as_str());
        options.insert("SystemBUID", record.system_buid.as_str());
        let response = match self.request("StartSession", Some(options)).await {
            Ok(response) => response,
            Err(Error::Lockdown(LockdownError::InvalidHostId)) => {
                return Ok(self.not_paired(NotPairedReason::InvalidHostId));
            }
            Err(e) => return Err(e),
        };

        self.session_id = Some(fields::require_string(&response, "SessionID")?);
        self.state = LockdownState::SessionActive;

        if fields::boolean(&response, "EnableSessionSSL")?.unwrap_or(false) {
            let key = record
                .host_private_key
                .as_deref()
                .ok_or(LockdownError::MissingField("HostPrivateKey"))?;
            self.upgrade_session(&record.host_certificate, key).await?;
        }

        self.paired = true;
        tracing::info!(
            session = self.session_id.as_deref().unwrap_or_default(),
            encrypted = self.is_encrypted(),
            "Lockdown session started"
        );
        Ok(PairingOutcome::Paired)
    }

    fn not_paired(&mut self, reason: NotPairedReason) -> PairingOutcome {
        self.paired = false;
        self.session_id = None;
        if self.state != LockdownState::Closed {
            self.state = LockdownState::Unpaired;
        }
        PairingOutcome::NotPaired(reason)
    }

    async fn upgrade_session(&mut self, certificate: &[u8], key: &[u8]) -> Result<()> {
        let service = self
            .service
            .as_mut()
            .ok_or(LockdownError::ConnectionClosed)?;
        if let Err(e) = service
            .start_encrypted(self.tls.as_ref(), certificate, key)
            .await
        {
            self.discard().await;
            return Err(e);
        }
        self.state = LockdownState::SecureSession;
        Ok(())
    }

    /// Pair with the device, waiting up to `timeout` for the user to trust
    /// this host. `None` waits forever.
    pub async fn pair(&mut self, timeout: Option<Duration>) -> Result<()> {
        let public_key = match self.get_value(None, Some("DevicePublicKey")).await {
            Ok(node) => node.as_data().map(<[u8]>::to_vec),
            Err(e) if is_absent(&e) => None,
            Err(e) => return Err(e),
        };
        let Some(public_key) = public_key.filter(|key| !key.is_empty()) else {
            self.discard().await;
            return Err(LockdownError::FatalPairing("device public key unavailable".to_string()).into());
        };

        let generator = self.certificates.clone().ok_or_else(|| {
            LockdownError::FatalPairing("no certificate generator configured".to_string())
        })?;
        tracing::debug!("Creating host key and certificates");
        let certificates = generator.generate(&public_key)?;

        let host_id = match &self.pair_record {
            Some(record) => record.host_id.clone(),
            None => new_identifier(),
        };
        let system_buid = match &self.pair_record {
            Some(record) => record.system_buid.clone(),
            None => match self.read_system_buid().await {
                Some(buid) => buid,
                None => new_identifier(),
            },
        };
        let wifi_mac_address = fields::require_string(&self.all_values, "WiFiAddress")?;

        let mut record = PairRecord {
            device_public_key: public_key,
            device_certificate: certificates.device_certificate,
            host_certificate: certificates.host_certificate,
            host_id,
            root_certificate: certificates.root_certificate,
            root_private_key: certificates.private_key.clone(),
            host_private_key: None,
            wifi_mac_address,
            system_buid,
            escrow_bag: None,
        };

        let response = self.request_pair(&record, timeout).await?;
        record.host_private_key = Some(certificates.private_key);
        record.escrow_bag = fields::data(&response, "EscrowBag")?;

        self.store_pair_record(&record).await?;
        tracing::info!(host_id = %record.host_id, "Paired with device");
        self.pair_record = Some(record);
        self.paired = true;
        self.state = LockdownState::Paired;
        Ok(())
    }

    async fn request_pair(
        &mut self,
        record: &PairRecord,
        timeout: Option<Duration>,
    ) -> Result<Dictionary> {
        let mut pairing_options = Dictionary::new();
        pairing_options.insert("ExtendedPairingErrors", true);
        let mut options = Dictionary::new();
        options.insert("PairRecord", record.to_dictionary());
        options.insert("ProtocolVersion", "2");
        options.insert("PairingOptions", pairing_options);

        let clock = self.clock.clone();
        let poll = PairingPoll::start(clock.as_ref(), timeout);
        loop {
            match self.request("Pair", Some(options.clone())).await {
                Err(e) if e.lockdown() == Some(&LockdownError::PairingDialogResponsePending) => {
                    if !poll.may_retry(clock.as_ref()) {
                        return Err(e);
                    }
                    tracing::debug!("Waiting for the user to trust this host");
                    clock.sleep(PAIR_POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    async fn read_system_buid(&self) -> Option<String> {
        if self.config.medium != ConnectionMedium::Usbmux {
            return None;
        }
        let mut transport = match self.provider.create(self.config.connection_type) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot reach transport for system BUID");
                return None;
            }
        };
        let buid = transport.read_buid().await;
        if let Err(e) = transport.close().await {
            tracing::debug!(error = %e, "Closing transport failed");
        }
        match buid {
            Ok(buid) => buid,
            Err(e) => {
                tracing::warn!(error = %e, "Reading system BUID failed");
                None
            }
        }
    }

    async fn store_pair_record(&mut self, record: &PairRecord) -> Result<()> {
        let identifier = self
            .identifier
            .clone()
            .ok_or(LockdownError::MissingField("UniqueDeviceID"))?;
        let path = record_path(&self.config.cache_dir, &identifier);
        record.save(&self.codec, &path)?;
        tracing::debug!(path = %path.display(), "Pair record cached");

        if self.config.medium == ConnectionMedium::Usbmux {
            let bytes = record.to_bytes(&self.codec)?;
            let device_id = self
                .service
                .as_ref()
                .and_then(ServiceConnection::device)
                .map_or(0, |device| device.device_id);
            let mut transport = self.provider.create(self.config.connection_type)?;
            let saved = transport
                .save_pair_record(&identifier, device_id, &bytes)
                .await;
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "Closing transport failed");
            }
            saved?;
        }
        Ok(())
    }

    /// Ask lockdown to start a service and connect to it.
    pub async fn start_service(&mut self, name: &str) -> Result<ServiceConnection> {
        if !self.paired {
            return Err(LockdownError::NotPaired.into());
        }

        let mut options = Dictionary::new();
        options.insert("Service", name);
        let response = self
            .send_request("StartService", Some(options), true)
            .await?;
        if let Some(error) = fields::string(&response, "Error")? {
            return Err(match error.as_str() {
                "PasswordProtected" => LockdownError::PasswordRequired,
                _ => LockdownError::ServiceStart(error),
            }
            .into());
        }
        check_result(&response)?;

        let port = fields::integer(&response, "Port")?.ok_or(LockdownError::MissingField("Port"))?;
        let port = u16::try_from(port).map_err(|_| LockdownError::UnexpectedType {
            key: "Port",
            expected: "16-bit port",
        })?;

        let mut connection = ServiceConnection::open(
            self.provider.as_ref(),
            self.config.connection_type,
            self.identifier.as_deref(),
            port,
            self.codec.clone(),
        )
        .await?;

        if fields::boolean(&response, "EnableServiceSSL")?.unwrap_or(false) {
            let record = self
                .pair_record
                .as_ref()
                .ok_or(LockdownError::MissingPairRecord)?;
            let key = record
                .host_private_key
                .as_deref()
                .ok_or(LockdownError::MissingPairRecord)?;
            connection
                .start_encrypted(self.tls.as_ref(), &record.host_certificate, key)
                .await?;
        }

        tracing::info!(service = name, port, "Service started");
        Ok(connection)
    }

    /// Close the lockdown connection.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut service) = self.service.take() {
            service.close().await?;
        }
        self.state = LockdownState::Closed;
        Ok(())
    }

    async fn discard(&mut self) {
        if let Err(e) = self.close().await {
            tracing::debug!(error = %e, "Closing lockdown connection failed");
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn udid(&self) -> Option<&str> {
        self.udid.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    pub fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    pub fn product_version(&self) -> Option<Version> {
        self.product_version
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    pub fn state(&self) -> LockdownState {
        self.state
    }

    pub fn pair_record(&self) -> Option<&PairRecord> {
        self.pair_record.as_ref()
    }

    /// Values from the last full fetch.
    pub fn cached_values(&self) -> &Dictionary {
        &self.all_values
    }

    pub fn is_encrypted(&self) -> bool {
        self.service
            .as_ref()
            .is_some_and(ServiceConnection::is_encrypted)
    }
}

fn check_error(response: &Dictionary) -> Result<()> {
    match fields::string(response, "Error")? {
        Some(error) => Err(LockdownError::from_device_error(&error).into()),
        None => Ok(()),
    }
}

// Pre-iOS 7 devices report failure through `Result`.
fn check_result(response: &Dictionary) -> Result<()> {
    if response.get("Result").and_then(PropertyNode::as_string) == Some("Failure") {
        return Err(LockdownError::Failure.into());
    }
    Ok(())
}

fn is_absent(err: &Error) -> bool {
    matches!(
        err.lockdown(),
        Some(LockdownError::MissingValue) | Some(LockdownError::MissingField(_))
    )
}

fn new_identifier() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    mod responses {
        use super::*;

        #[test]
        fn error_strings_are_mapped() {
            let mut response = Dictionary::new();
            response.insert("Error", "InvalidHostID");
            assert_eq!(
                check_error(&response).unwrap_err().lockdown(),
                Some(&LockdownError::InvalidHostId)
            );
        }

        #[test]
        fn unknown_errors_pass_through() {
            let mut response = Dictionary::new();
            response.insert("Error", "GetProhibited");
            assert_eq!(
                check_error(&response).unwrap_err().lockdown(),
                Some(&LockdownError::Device("GetProhibited".to_string()))
            );
        }

        #[test]
        fn legacy_failure_result() {
            let mut response = Dictionary::new();
            response.insert("Result", "Failure");
            assert_eq!(
                check_result(&response).unwrap_err().lockdown(),
                Some(&LockdownError::Failure)
            );

            response.insert("Result", "Success");
            assert!(check_result(&response).is_ok());
        }

        #[test]
        fn clean_response_passes() {
            let mut response = Dictionary::new();
            response.insert("Request", "GetValue");
            response.insert("Value", "iPhone");
            assert!(check_error(&response).is_ok());
            assert!(check_result(&response).is_ok());
        }
    }

    mod identifiers {
        use super::*;

        #[test]
        fn new_identifiers_are_uppercase_uuids() {
            let id = new_identifier();
            assert_eq!(id.len(), 36);
            assert_eq!(id, id.to_uppercase());
            assert!(uuid::Uuid::parse_str(&id).is_ok());
            assert_ne!(id, new_identifier());
        }

        #[test]
        fn missing_values_count_as_absent() {
            assert!(is_absent(&LockdownError::MissingValue.into()));
            assert!(is_absent(&LockdownError::MissingField("Value").into()));
            assert!(!is_absent(&LockdownError::SetProhibited.into()));
        }
    }
}
