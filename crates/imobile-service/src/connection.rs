//! Length-framed plist channel to a device service.

use imobile_core::error::{Error, Result};
use imobile_core::{ConnectionType, TransportError, UsbmuxdDevice};
use imobile_plist::{Dictionary, PlistCodec, PlistFormat, PropertyNode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::traits::{DeviceSocket, MuxProvider, TlsUpgrade};

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A service connection carrying one binary plist dictionary per frame.
///
/// Each frame is a 4-byte big-endian length followed by the payload.
pub struct ServiceConnection {
    socket: Option<DeviceSocket>,
    device: Option<UsbmuxdDevice>,
    codec: PlistCodec,
    encrypted: bool,
}

impl ServiceConnection {
    /// Wrap an already connected socket.
    pub fn new(socket: DeviceSocket, device: Option<UsbmuxdDevice>, codec: PlistCodec) -> Self {
        Self {
            socket: Some(socket),
            device,
            codec,
            encrypted: false,
        }
    }

    /// Connect to `port` on the device through a fresh daemon connection.
    pub async fn open(
        provider: &dyn MuxProvider,
        connection_type: ConnectionType,
        identifier: Option<&str>,
        port: u16,
        codec: PlistCodec,
    ) -> Result<Self> {
        let mut transport = provider.create(connection_type)?;
        let device = transport.get_device(identifier).await?;
        let socket = transport.connect(identifier, port).await?;
        tracing::debug!(
            port,
            identifier = identifier.unwrap_or("<first>"),
            device_id = device.as_ref().map(|d| d.device_id),
            "Service connection opened"
        );
        Ok(Self::new(socket, device, codec))
    }

    /// The device this connection was opened against, if known.
    pub fn device(&self) -> Option<&UsbmuxdDevice> {
        self.device.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_connected() && self.encrypted
    }

    /// Send one dictionary and wait for the reply.
    pub async fn send_receive(&mut self, message: &Dictionary) -> Result<Dictionary> {
        self.send_plist(message).await?;
        self.receive_plist().await
    }

    pub async fn send_plist(&mut self, message: &Dictionary) -> Result<()> {
        let payload = self
            .codec
            .encode(&PropertyNode::Dictionary(message.clone()), PlistFormat::Binary)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or(TransportError::FrameTooLarge(
                payload.len().min(u32::MAX as usize) as u32,
            ))?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);

        tracing::debug!(len, encrypted = self.encrypted, "-> plist frame");
        let socket = self.socket_mut()?;
        let written = async {
            socket.write_all(&frame).await?;
            socket.flush().await
        }
        .await;
        written.map_err(|e| self.fail(e))
    }

    pub async fn receive_plist(&mut self) -> Result<Dictionary> {
        let mut header = [0u8; 4];
        let read = self.socket_mut()?.read_exact(&mut header).await;
        if let Err(e) = read {
            return Err(self.fail(e));
        }

        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME_LEN {
            self.socket = None;
            return Err(TransportError::FrameTooLarge(len).into());
        }

        let mut payload = vec![0u8; len as usize];
        let read = self.socket_mut()?.read_exact(&mut payload).await;
        if let Err(e) = read {
            return Err(self.fail(e));
        }
        tracing::debug!(len, encrypted = self.encrypted, "<- plist frame");

        Ok(self.codec.decode_dictionary(&payload)?)
    }

    /// Upgrade the stream to TLS in place.
    ///
    /// On failure the socket is gone and the connection stays closed.
    pub async fn start_encrypted(
        &mut self,
        upgrader: &dyn TlsUpgrade,
        certificate: &[u8],
        private_key: &[u8],
    ) -> Result<()> {
        let socket = self.socket.take().ok_or(TransportError::NoConnection)?;
        let upgraded = upgrader.upgrade(socket, certificate, private_key).await?;
        self.socket = Some(upgraded);
        self.encrypted = true;
        tracing::debug!("Service connection upgraded to TLS");
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.shutdown().await {
                tracing::debug!(error = %e, "Socket shutdown failed");
            }
        }
        self.encrypted = false;
        Ok(())
    }

    fn socket_mut(&mut self) -> Result<&mut DeviceSocket> {
        self.socket
            .as_mut()
            .ok_or_else(|| TransportError::NoConnection.into())
    }

    /// Drop the socket after an I/O failure.
    fn fail(&mut self, err: std::io::Error) -> Error {
        self.socket = None;
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::NoConnection.into(),
            _ => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{duplex, DuplexStream};

    fn connection() -> (ServiceConnection, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let conn = ServiceConnection::new(
            Box::new(local),
            Some(UsbmuxdDevice::new(3, "serial", ConnectionType::Usb)),
            PlistCodec::standard(),
        );
        (conn, remote)
    }

    async fn read_frame(stream: &mut DuplexStream) -> Dictionary {
        let len = stream.read_u32().await.unwrap();
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        PlistCodec::standard().decode_dictionary(&payload).unwrap()
    }

    async fn write_frame(stream: &mut DuplexStream, message: &Dictionary) {
        let payload = PlistCodec::standard()
            .encode(&PropertyNode::Dictionary(message.clone()), PlistFormat::Binary)
            .unwrap();
        stream.write_u32(payload.len() as u32).await.unwrap();
        stream.write_all(&payload).await.unwrap();
    }

    mod framing {
        use super::*;

        #[tokio::test]
        async fn round_trips_a_dictionary() {
            let (mut conn, mut remote) = connection();
            let peer = tokio::spawn(async move {
                let request = read_frame(&mut remote).await;
                let mut reply = request.clone();
                reply.insert("Type", "com.apple.mobile.lockdown");
                write_frame(&mut remote, &reply).await;
                request
            });

            let request: Dictionary = [("Label", "test"), ("Request", "QueryType")]
                .into_iter()
                .collect();
            let reply = conn.send_receive(&request).await.unwrap();

            assert_eq!(peer.await.unwrap(), request);
            assert_eq!(
                reply.get("Type").and_then(|v| v.as_string()),
                Some("com.apple.mobile.lockdown")
            );
            assert_eq!(conn.device().map(|d| d.device_id), Some(3));
        }

        #[tokio::test]
        async fn oversized_frame_is_rejected() {
            let (mut conn, mut remote) = connection();
            remote.write_u32(MAX_FRAME_LEN + 1).await.unwrap();

            let err = conn.receive_plist().await.unwrap_err();
            assert!(matches!(
                err,
                Error::Transport(TransportError::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1
            ));
            assert!(!conn.is_connected());
        }

        #[tokio::test]
        async fn closed_stream_is_a_transport_error() {
            let (mut conn, remote) = connection();
            drop(remote);

            let err = conn.receive_plist().await.unwrap_err();
            assert!(matches!(err, Error::Transport(TransportError::NoConnection)));
            assert!(!conn.is_connected());
        }

        #[tokio::test]
        async fn non_dictionary_reply_is_a_plist_error() {
            let (mut conn, mut remote) = connection();
            let payload = PlistCodec::standard()
                .encode(&PropertyNode::from("hello"), PlistFormat::Binary)
                .unwrap();
            remote.write_u32(payload.len() as u32).await.unwrap();
            remote.write_all(&payload).await.unwrap();

            assert!(matches!(conn.receive_plist().await, Err(Error::Plist(_))));
        }

        #[tokio::test]
        async fn requests_after_close_fail() {
            let (mut conn, _remote) = connection();
            conn.close().await.unwrap();

            assert!(!conn.is_connected());
            assert!(matches!(
                conn.send_plist(&Dictionary::new()).await,
                Err(Error::Transport(TransportError::NoConnection))
            ));
        }
    }

    mod encryption {
        use super::*;

        struct PassThrough;

        #[async_trait]
        impl TlsUpgrade for PassThrough {
            async fn upgrade(
                &self,
                socket: DeviceSocket,
                certificate: &[u8],
                private_key: &[u8],
            ) -> Result<DeviceSocket> {
                assert_eq!(certificate, b"cert");
                assert_eq!(private_key, b"key");
                Ok(socket)
            }
        }

        struct Refuse;

        #[async_trait]
        impl TlsUpgrade for Refuse {
            async fn upgrade(
                &self,
                _socket: DeviceSocket,
                _certificate: &[u8],
                _private_key: &[u8],
            ) -> Result<DeviceSocket> {
                Err(TransportError::Tls("handshake failed".to_string()).into())
            }
        }

        #[tokio::test]
        async fn upgrade_marks_connection_encrypted() {
            let (mut conn, _remote) = connection();
            assert!(!conn.is_encrypted());

            conn.start_encrypted(&PassThrough, b"cert", b"key").await.unwrap();
            assert!(conn.is_encrypted());
            assert!(conn.is_connected());
        }

        #[tokio::test]
        async fn failed_upgrade_discards_connection() {
            let (mut conn, _remote) = connection();
            let err = conn.start_encrypted(&Refuse, b"cert", b"key").await.unwrap_err();

            assert!(matches!(err, Error::Transport(TransportError::Tls(_))));
            assert!(!conn.is_connected());
            assert!(!conn.is_encrypted());
        }
    }

    mod open {
        use super::*;
        use crate::traits::{MockMuxProvider, MuxTransport};
        use std::sync::{Arc, Mutex};

        struct DuplexTransport {
            socket: Option<DuplexStream>,
            connected_port: Arc<Mutex<Option<u16>>>,
        }

        #[async_trait]
        impl MuxTransport for DuplexTransport {
            async fn connect(&mut self, _identifier: Option<&str>, port: u16) -> Result<DeviceSocket> {
                *self.connected_port.lock().unwrap() = Some(port);
                let socket = self.socket.take().ok_or(TransportError::NoConnection)?;
                Ok(Box::new(socket))
            }

            async fn get_device(
                &mut self,
                identifier: Option<&str>,
            ) -> Result<Option<UsbmuxdDevice>> {
                Ok(Some(UsbmuxdDevice::new(
                    11,
                    identifier.unwrap_or("first-device"),
                    ConnectionType::Usb,
                )))
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

        #[tokio::test]
        async fn opens_through_provider() {
            let (local, _remote) = duplex(1024);
            let connected_port = Arc::new(Mutex::new(None));
            let transport = DuplexTransport {
                socket: Some(local),
                connected_port: connected_port.clone(),
            };

            let mut provider = MockMuxProvider::new();
            provider
                .expect_create()
                .return_once(move |_| Ok(Box::new(transport) as Box<dyn MuxTransport>));

            let conn = ServiceConnection::open(
                &provider,
                ConnectionType::Usb,
                None,
                62078,
                PlistCodec::standard(),
            )
            .await
            .unwrap();

            assert!(conn.is_connected());
            assert_eq!(*connected_port.lock().unwrap(), Some(62078));
            assert_eq!(
                conn.device().map(|d| d.serial_number.as_str()),
                Some("first-device")
            );
        }
    }
}
