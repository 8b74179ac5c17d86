//! expandscreen-pairing — pinned self-signed TLS plus a numeric pairing code.
//!
//! On first start the host generates a self-signed certificate
//! (CN = "ExpandScreen") and persists it through the platform's `CertStore`.
//! Two values derive from the certificate's SHA-256 fingerprint:
//!
//! - the colon-separated hex fingerprint shown to the user for out-of-band
//!   pinning on the handheld, and
//! - a 6-digit pairing code (first 24 bits of the digest mod 10^6) the
//!   handheld must present in its handshake.
//!
//! Both checks must pass before any session state exists: the TLS layer
//! pins the fingerprint, the handshake policy verifies the code in
//! constant time.

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use expandscreen_core::interfaces::CertStore;
use expandscreen_session::{HandshakePolicy, HandshakeRequest};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

pub const CERT_COMMON_NAME: &str = "ExpandScreen";

// ── Fingerprint / code derivation ─────────────────────────────────────────────

/// SHA-256 over the DER-encoded certificate.
pub fn fingerprint_sha256(cert_der: &[u8]) -> [u8; 32] {
    Sha256::digest(cert_der).into()
}

/// Colon-separated uppercase hex, the user-facing identity of the host.
pub fn fingerprint_hex(fingerprint: &[u8; 32]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(3 * fingerprint.len());
    for (i, byte) in fingerprint.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        write!(out, "{byte:02X}").expect("writing to a String cannot fail");
    }
    out
}

/// First 24 bits of the fingerprint modulo 10^6, zero-padded to 6 digits.
pub fn six_digit_code(fingerprint: &[u8; 32]) -> String {
    let prefix =
        ((fingerprint[0] as u32) << 16) | ((fingerprint[1] as u32) << 8) | fingerprint[2] as u32;
    format!("{:06}", prefix % 1_000_000)
}

/// Constant-time byte comparison. The early length check is fine: the code
/// length is public, only its value is secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn verify_pairing_code(expected: &str, presented: &str) -> bool {
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

// ── PairingIdentity ───────────────────────────────────────────────────────────

/// One certificate + key pair with its derived identity values.
pub struct PairingIdentity {
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
    /// PEM form as persisted (certificate then key, one file).
    blob: Vec<u8>,
    fingerprint: [u8; 32],
    code: String,
}

impl PairingIdentity {
    /// Generate a fresh self-signed certificate. rcgen's default validity
    /// window comfortably exceeds the required year.
    pub fn generate() -> Result<Self> {
        let key_pair = rcgen::KeyPair::generate().context("generating key pair")?;
        let mut params = rcgen::CertificateParams::new(vec![
            "expandscreen.local".to_owned(),
            "localhost".to_owned(),
        ])
        .context("certificate params")?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, CERT_COMMON_NAME);
        let cert = params.self_signed(&key_pair).context("self-signing certificate")?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow!("serialising private key: {e}"))?;
        let mut blob = cert.pem().into_bytes();
        blob.extend_from_slice(key_pair.serialize_pem().as_bytes());
        Ok(Self::assemble(cert_der, key_der, blob))
    }

    fn assemble(
        cert_der: CertificateDer<'static>,
        key_der: PrivateKeyDer<'static>,
        blob: Vec<u8>,
    ) -> Self {
        let fingerprint = fingerprint_sha256(cert_der.as_ref());
        let code = six_digit_code(&fingerprint);
        Self { cert_der, key_der, blob, fingerprint, code }
    }

    /// Parse a persisted blob (PEM certificate + PEM key, one file).
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let mut reader = std::io::BufReader::new(blob);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::io::Result<_>>()
            .context("parsing stored certificate")?;
        let cert_der = certs.into_iter().next().ok_or_else(|| anyhow!("store holds no certificate"))?;

        let mut reader = std::io::BufReader::new(blob);
        let key_der = rustls_pemfile::private_key(&mut reader)
            .context("parsing stored key")?
            .ok_or_else(|| anyhow!("store holds no private key"))?;
        Ok(Self::assemble(cert_der, key_der, blob.to_vec()))
    }

    /// The persisted blob format (what `CertStore::save` receives).
    pub fn to_blob(&self) -> Vec<u8> {
        self.blob.clone()
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    pub fn fingerprint_hex(&self) -> String {
        fingerprint_hex(&self.fingerprint)
    }

    pub fn pairing_code(&self) -> &str {
        &self.code
    }

    /// Server-side TLS acceptor using this certificate.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        install_crypto_provider();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], self.key_der.clone_key())
            .context("building TLS server config")?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Install the ring crypto provider as the process default. Required by
/// rustls 0.23+ before any config is built; already-installed is fine.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

// ── PairingManager ────────────────────────────────────────────────────────────

/// Owns the current identity: loads it from the store on startup,
/// generates + persists on first run, swaps it on rotation.
pub struct PairingManager {
    store: Arc<dyn CertStore>,
    identity: RwLock<Arc<PairingIdentity>>,
}

impl PairingManager {
    pub fn load_or_generate(store: Arc<dyn CertStore>) -> Result<Self> {
        let identity = match store.load().context("loading certificate store")? {
            Some(blob) => match PairingIdentity::from_blob(&blob) {
                Ok(identity) => {
                    info!("loaded pairing certificate, fingerprint {}", identity.fingerprint_hex());
                    identity
                }
                Err(e) => {
                    warn!("stored certificate unusable ({e:#}), generating a new one");
                    Self::generate_and_save(&*store)?
                }
            },
            None => Self::generate_and_save(&*store)?,
        };
        Ok(Self { store, identity: RwLock::new(Arc::new(identity)) })
    }

    fn generate_and_save(store: &dyn CertStore) -> Result<PairingIdentity> {
        let identity = PairingIdentity::generate()?;
        store.save(&identity.to_blob()).context("persisting certificate")?;
        info!("generated pairing certificate, fingerprint {}", identity.fingerprint_hex());
        Ok(identity)
    }

    pub fn current(&self) -> Arc<PairingIdentity> {
        Arc::clone(&self.identity.read().expect("identity lock"))
    }

    /// Replace the certificate atomically. Sessions opened against the old
    /// certificate must be closed before callers rely on the new identity.
    pub fn rotate(&self) -> Result<Arc<PairingIdentity>> {
        let fresh = Arc::new(Self::generate_and_save(&*self.store)?);
        *self.identity.write().expect("identity lock") = Arc::clone(&fresh);
        Ok(fresh)
    }
}

// ── Handshake policy ──────────────────────────────────────────────────────────

/// Server-side policy for TLS-wrapped streams: the handshake must carry the
/// pairing code matching the current certificate.
pub struct PairingPolicy {
    manager: Arc<PairingManager>,
}

impl PairingPolicy {
    pub fn new(manager: Arc<PairingManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl HandshakePolicy for PairingPolicy {
    async fn authorize(&self, request: &HandshakeRequest) -> Result<(), String> {
        let expected = self.manager.current();
        let Some(presented) = request.pairing_code.as_deref() else {
            return Err("pairing code required".to_owned());
        };
        if verify_pairing_code(expected.pairing_code(), presented) {
            Ok(())
        } else {
            Err("pairing code mismatch".to_owned())
        }
    }
}

// ── Client-side pinning ───────────────────────────────────────────────────────

/// Accepts exactly one certificate: the one whose SHA-256 fingerprint the
/// user confirmed out-of-band. Everything else fails the TLS handshake.
#[derive(Debug)]
struct PinnedCertVerifier {
    expected: [u8; 32],
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let actual = fingerprint_sha256(end_entity.as_ref());
        if constant_time_eq(&actual, &self.expected) {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("certificate fingerprint mismatch".to_owned()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build a client connector pinned to the given fingerprint.
pub fn pinned_connector(expected_fingerprint: [u8; 32]) -> TlsConnector {
    install_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
            expected: expected_fingerprint,
        }))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
