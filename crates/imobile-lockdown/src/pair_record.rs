//! Pair records and their on-disk form.
//!
//! A record is a plist dictionary stored as `<identifier>.plist`. Records are
//! written as binary plists; reads accept binary or XML.

use std::path::{Path, PathBuf};

use imobile_core::error::Result;
use imobile_plist::{Dictionary, PlistCodec, PlistFormat, PropertyNode};

use crate::fields;

/// Trust material exchanged with a device during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairRecord {
    pub device_public_key: Vec<u8>,
    pub device_certificate: Vec<u8>,
    pub host_certificate: Vec<u8>,
    pub host_id: String,
    pub root_certificate: Vec<u8>,
    pub root_private_key: Vec<u8>,
    /// Present once pairing has completed.
    pub host_private_key: Option<Vec<u8>>,
    pub wifi_mac_address: String,
    pub system_buid: String,
    pub escrow_bag: Option<Vec<u8>>,
}

impl PairRecord {
    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::with_capacity(10);
        dict.insert("DevicePublicKey", self.device_public_key.clone());
        dict.insert("DeviceCertificate", self.device_certificate.clone());
        dict.insert("HostCertificate", self.host_certificate.clone());
        dict.insert("HostID", self.host_id.as_str());
        dict.insert("RootCertificate", self.root_certificate.clone());
        dict.insert("RootPrivateKey", self.root_private_key.clone());
        dict.insert("WiFiMACAddress", self.wifi_mac_address.as_str());
        dict.insert("SystemBUID", self.system_buid.as_str());
        if let Some(key) = &self.host_private_key {
            dict.insert("HostPrivateKey", key.clone());
        }
        if let Some(bag) = &self.escrow_bag {
            dict.insert("EscrowBag", bag.clone());
        }
        dict
    }

    /// Read a record from its dictionary form.
    ///
    /// `HostID`, `SystemBUID` and `HostCertificate` are required; records
    /// written by other tools may omit the rest.
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self> {
        Ok(Self {
            device_public_key: fields::data(dict, "DevicePublicKey")?.unwrap_or_default(),
            device_certificate: fields::data(dict, "DeviceCertificate")?.unwrap_or_default(),
            host_certificate: fields::require_data(dict, "HostCertificate")?,
            host_id: fields::require_string(dict, "HostID")?,
            root_certificate: fields::data(dict, "RootCertificate")?.unwrap_or_default(),
            root_private_key: fields::data(dict, "RootPrivateKey")?.unwrap_or_default(),
            host_private_key: fields::data(dict, "HostPrivateKey")?,
            wifi_mac_address: fields::string(dict, "WiFiMACAddress")?.unwrap_or_default(),
            system_buid: fields::require_string(dict, "SystemBUID")?,
            escrow_bag: fields::data(dict, "EscrowBag")?,
        })
    }

    pub fn from_bytes(codec: &PlistCodec, data: &[u8]) -> Result<Self> {
        Self::from_dictionary(&codec.decode_dictionary(data)?)
    }

    pub fn to_bytes(&self, codec: &PlistCodec) -> Result<Vec<u8>> {
        let node = PropertyNode::Dictionary(self.to_dictionary());
        Ok(codec.encode(&node, PlistFormat::Binary)?)
    }

    /// Load a record file. A missing file is `Ok(None)`.
    pub fn load(codec: &PlistCodec, path: &Path) -> Result<Option<Self>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::from_bytes(codec, &data).map(Some)
    }

    /// Write the record, creating parent directories as needed.
    pub fn save(&self, codec: &PlistCodec, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes(codec)?)?;
        Ok(())
    }
}

/// File name of a device's record inside a records directory.
pub fn record_path(dir: &Path, identifier: &str) -> PathBuf {
    dir.join(format!("{identifier}.plist"))
}

/// Platform directory holding system-wide lockdown records.
pub fn default_system_records_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        Some(PathBuf::from("/var/db/lockdown"))
    } else if cfg!(target_os = "linux") {
        Some(PathBuf::from("/var/lib/lockdown"))
    } else if cfg!(target_os = "windows") {
        Some(PathBuf::from(r"C:\ProgramData\Apple\Lockdown"))
    } else {
        None
    }
}
