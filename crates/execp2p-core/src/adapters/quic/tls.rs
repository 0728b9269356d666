//! Ephemeral TLS identity for QUIC.
//!
//! Each process generates a fresh self-signed certificate at startup. PKI
//! validation is deliberately disabled on both sides; the certificate's only
//! job is to be hashed and bound to the post-quantum identity inside the
//! signed announcement. The listener requests (and blindly accepts) a client
//! certificate so both directions can enforce the binding.

use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};

use crate::domain::error::{Error, Result};
use crate::domain::identity::cert_fingerprint;

/// ALPN tag negotiated on every connection.
pub const ALPN: &[u8] = b"execp2p-chat";

/// Certificate validity window.
const CERT_VALIDITY_DAYS: i64 = 365;

/// QUIC idle timeout; generous because chat sessions are mostly silent.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// TlsIdentity
// ---------------------------------------------------------------------------

/// A fresh self-signed certificate plus its private key and fingerprint.
pub struct TlsIdentity {
    cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
    fingerprint: String,
}

impl TlsIdentity {
    /// Generate the per-process certificate: organisation "ExecP2P", one
    /// year of validity, digitalSignature + keyEncipherment, serverAuth.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(vec!["execp2p".to_string()])
            .map_err(|e| Error::Crypto(format!("certificate params: {e}")))?;
        params
            .distinguished_name
            .push(DnType::OrganizationName, "ExecP2P");
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair =
            KeyPair::generate().map_err(|e| Error::Crypto(format!("key generation: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Crypto(format!("self-signing: {e}")))?;

        let cert_der = cert.der().clone();
        let fingerprint = cert_fingerprint(cert_der.as_ref());
        Ok(Self {
            cert_der,
            key_der: key_pair.serialize_der(),
            fingerprint,
        })
    }

    /// SHA-256 of the DER certificate, as advertised in announcements.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone()]
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    /// Listener-side config: our cert, any client cert accepted.
    pub fn server_config(&self) -> Result<quinn::ServerConfig> {
        let mut crypto = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
            .with_single_cert(self.cert_chain(), self.private_key())
            .map_err(|e| Error::Crypto(format!("server TLS config: {e}")))?;
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(crypto)
                .map_err(|e| Error::Crypto(format!("QUIC server config: {e}")))?,
        ));
        server_config.transport_config(Arc::new(transport_config()?));
        Ok(server_config)
    }

    /// Dialer-side config: our cert presented, any server cert accepted.
    pub fn client_config(&self) -> Result<quinn::ClientConfig> {
        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
            .with_client_auth_cert(self.cert_chain(), self.private_key())
            .map_err(|e| Error::Crypto(format!("client TLS config: {e}")))?;
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(crypto)
                .map_err(|e| Error::Crypto(format!("QUIC client config: {e}")))?,
        ));
        client_config.transport_config(Arc::new(transport_config()?));
        Ok(client_config)
    }
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
            .map_err(|e| Error::Crypto(format!("idle timeout: {e}")))?,
    ));
    Ok(transport)
}

/// SHA-256 of the live remote certificate, if the peer presented one.
pub fn remote_cert_fingerprint(connection: &quinn::Connection) -> Option<String> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    certs.first().map(|c| cert_fingerprint(c.as_ref()))
}

// ---------------------------------------------------------------------------
// Pinning-only verifiers (authenticity lives in the announcement binding)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SkipServerVerification(rustls::crypto::CryptoProvider);

impl SkipServerVerification {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyClientCert(rustls::crypto::CryptoProvider);

impl AcceptAnyClientCert {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl rustls::server::danger::ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_64_hex_chars_and_per_process_unique() {
        let a = TlsIdentity::generate().unwrap();
        let b = TlsIdentity::generate().unwrap();
        assert_eq!(a.fingerprint().len(), 64);
        assert!(a.fingerprint().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn configs_build() {
        let identity = TlsIdentity::generate().unwrap();
        identity.server_config().unwrap();
        identity.client_config().unwrap();
    }
}
