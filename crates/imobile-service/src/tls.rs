//! TLS upgrade backed by rustls.
//!
//! Devices present a self-signed certificate minted during pairing, so the
//! chain is not validated against any root store. Handshake signatures are
//! still checked with the provider's algorithms.

use std::sync::Arc;

use async_trait::async_trait;
use imobile_core::error::Result;
use imobile_core::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsConnector;

use crate::traits::{DeviceSocket, TlsUpgrade};

/// Server name sent in the ClientHello. The device ignores it.
const DEVICE_SERVER_NAME: &str = "lockdown";

fn tls_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(err.to_string())
}

#[derive(Debug)]
struct DeviceCertificateVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for DeviceCertificateVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Parse the PEM host certificate chain and private key.
pub fn load_identity(
    certificate: &[u8],
    key: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = certs(&mut &certificate[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("invalid host certificate: {e}")))?;
    if chain.is_empty() {
        return Err(TransportError::Tls("no host certificate found".to_string()).into());
    }

    let key = private_key(&mut &key[..])
        .map_err(|e| TransportError::Tls(format!("invalid host private key: {e}")))?
        .ok_or_else(|| TransportError::Tls("no host private key found".to_string()))?;
    Ok((chain, key))
}

/// [`TlsUpgrade`] using a rustls client session.
#[derive(Debug, Clone)]
pub struct RustlsUpgrade {
    provider: Arc<CryptoProvider>,
}

impl RustlsUpgrade {
    /// Upgrader using the aws-lc-rs provider.
    pub fn new() -> Self {
        Self::with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
    }

    pub fn with_provider(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }

    fn client_config(&self, certificate: &[u8], key: &[u8]) -> Result<ClientConfig> {
        let (chain, key) = load_identity(certificate, key)?;
        let verifier = DeviceCertificateVerifier {
            provider: self.provider.clone(),
        };
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(chain, key)
            .map_err(tls_error)?;
        Ok(config)
    }
}

impl Default for RustlsUpgrade {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TlsUpgrade for RustlsUpgrade {
    async fn upgrade(
        &self,
        socket: DeviceSocket,
        certificate: &[u8],
        private_key: &[u8],
    ) -> Result<DeviceSocket> {
        let config = self.client_config(certificate, private_key)?;
        let server_name = ServerName::try_from(DEVICE_SERVER_NAME)
            .map_err(tls_error)?
            .to_owned();

        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, socket)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))?;
        tracing::debug!("TLS handshake with device complete");
        Ok(Box::new(stream))
    }
}
