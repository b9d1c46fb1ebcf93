//! Traits the service layer requires from the multiplexing daemon client.
//!
//! The usbmuxd protocol itself lives outside this workspace; callers plug
//! it in through [`MuxProvider`].

use async_trait::async_trait;
use imobile_core::error::Result;
use imobile_core::{ConnectionType, TransportError, UsbmuxdDevice};
use imobile_plist::Dictionary;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to a service on the device.
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> DeviceStream for T {}

/// Owned, type-erased device stream.
pub type DeviceSocket = Box<dyn DeviceStream>;

/// A connection to the multiplexing daemon.
///
/// A `None` identifier selects the first attached device.
#[async_trait]
pub trait MuxTransport: Send + Sync {
    /// Open a stream to `port` on the device.
    async fn connect(&mut self, identifier: Option<&str>, port: u16) -> Result<DeviceSocket>;

    async fn get_device(&mut self, identifier: Option<&str>) -> Result<Option<UsbmuxdDevice>>;

    /// Raw pair record bytes held by the daemon for a device.
    async fn get_pair_record(&mut self, identifier: &str) -> Result<Option<Vec<u8>>>;

    async fn save_pair_record(
        &mut self,
        identifier: &str,
        device_id: u32,
        record: &[u8],
    ) -> Result<()>;

    /// The daemon's system BUID, if it exposes one.
    async fn read_buid(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn close(&mut self) -> Result<()>;
}

/// Factory for daemon connections.
#[cfg_attr(test, mockall::automock)]
pub trait MuxProvider: Send + Sync {
    fn create(&self, connection_type: ConnectionType) -> Result<Box<dyn MuxTransport>>;
}

/// In-place TLS upgrade of an established device stream.
#[async_trait]
pub trait TlsUpgrade: Send + Sync {
    /// Wrap `socket` in a TLS client session authenticated with the
    /// PEM-encoded host certificate and private key.
    async fn upgrade(
        &self,
        socket: DeviceSocket,
        certificate: &[u8],
        private_key: &[u8],
    ) -> Result<DeviceSocket>;
}

/// Build a device descriptor from a usbmuxd `Properties` dictionary.
pub fn device_from_properties(device_id: u32, properties: &Dictionary) -> Result<UsbmuxdDevice> {
    let serial = properties
        .get("SerialNumber")
        .and_then(|v| v.as_string())
        .ok_or_else(|| TransportError::Mux("device properties lack SerialNumber".to_string()))?;
    let connection_type = match properties.get("ConnectionType").and_then(|v| v.as_string()) {
        Some(value) => value.parse::<ConnectionType>()?,
        None => ConnectionType::default(),
    };
    Ok(UsbmuxdDevice::new(device_id, serial, connection_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imobile_core::Error;

    struct NullTransport;

    #[async_trait]
    impl MuxTransport for NullTransport {
        async fn connect(&mut self, _identifier: Option<&str>, _port: u16) -> Result<DeviceSocket> {
            Err(TransportError::NoConnection.into())
        }

        async fn get_device(&mut self, _identifier: Option<&str>) -> Result<Option<UsbmuxdDevice>> {
            Ok(None)
        }

        async fn get_pair_record(&mut self, _identifier: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn save_pair_record(
            &mut self,
            _identifier: &str,
            _device_id: u32,
            _record: &[u8],
        ) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    mod properties {
        use super::*;

        #[test]
        fn builds_descriptor() {
            let props: Dictionary = [
                ("SerialNumber", "00008030-001A2B3C4D5E6F70"),
                ("ConnectionType", "Network"),
            ]
            .into_iter()
            .collect();

            let device = device_from_properties(7, &props).unwrap();
            assert_eq!(device.device_id, 7);
            assert_eq!(device.serial_number, "00008030-001A2B3C4D5E6F70");
            assert_eq!(device.connection_type, ConnectionType::Network);
        }

        #[test]
        fn missing_connection_type_defaults_to_usb() {
            let props: Dictionary = [("SerialNumber", "abc")].into_iter().collect();
            let device = device_from_properties(1, &props).unwrap();
            assert_eq!(device.connection_type, ConnectionType::Usb);
        }

        #[test]
        fn unknown_connection_type_is_an_error() {
            let props: Dictionary = [("SerialNumber", "abc"), ("ConnectionType", "Carrier Pigeon")]
                .into_iter()
                .collect();
            assert!(matches!(
                device_from_properties(1, &props),
                Err(Error::Transport(TransportError::Mux(_)))
            ));
        }

        #[test]
        fn missing_serial_is_an_error() {
            assert!(device_from_properties(1, &Dictionary::new()).is_err());
        }
    }

    mod provider {
        use super::*;

        #[tokio::test]
        async fn mock_provider_hands_out_transports() {
            let mut provider = MockMuxProvider::new();
            provider
                .expect_create()
                .withf(|kind| *kind == ConnectionType::Usb)
                .times(1)
                .returning(|_| Ok(Box::new(NullTransport) as Box<dyn MuxTransport>));

            let mut transport = provider.create(ConnectionType::Usb).unwrap();
            assert!(transport.get_device(None).await.unwrap().is_none());
            assert!(transport.read_buid().await.unwrap().is_none());
            assert!(transport.connect(None, 62078).await.is_err());
        }
    }
}
