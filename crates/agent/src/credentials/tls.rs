//! Client certificate minting.
//!
//! Parses the cluster-root CA out of its base64-wrapped PEM encoding and
//! signs a fresh Ed25519 leaf with it. The leaf carries the administrative
//! subject organization, a one-hour NotBefore skew allowance and a 24h
//! lifetime, so a compromised credential expires on its own.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use p256::pkcs8::EncodePrivateKey as _;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs8::EncodePrivateKey as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;

use super::{ADMIN_ROLE, CredentialsError};

/// Common name of the minted client certificate.
const CLIENT_COMMON_NAME: &str = "autobootstrap-extension";

/// Validity period of the minted client certificate.
const CERT_VALIDITY: time::Duration = time::Duration::hours(24);

/// NotBefore is backdated by this much to tolerate clock skew between nodes.
const CLOCK_SKEW_TOLERANCE: time::Duration = time::Duration::hours(1);

/// An ephemeral client credential and the CA it chains to.
///
/// Created once per process and handed to the scanner by reference;
/// never written to disk.
pub struct CredentialBundle {
    ca_cert: CertificateDer<'static>,
    client_cert: CertificateDer<'static>,
    client_key: PrivateKeyDer<'static>,
}

impl CredentialBundle {
    /// Mint a bundle from base64-wrapped PEM CA material.
    pub fn generate(ca_crt_b64: &str, ca_key_b64: &str) -> Result<Self, CredentialsError> {
        let ca_cert_pem = decode_base64(ca_crt_b64, "CA certificate")?;
        let ca_cert = parse_ca_certificate(&ca_cert_pem)?;
        let ca_key = parse_ca_key(&decode_base64(ca_key_b64, "CA key")?)?;

        // Rebuild an issuer handle carrying the CA's subject so the leaf
        // chains to the real CA certificate peers already trust.
        let issuer_pem = String::from_utf8(ca_cert_pem).map_err(|e| {
            CredentialsError::InvalidEncoding(format!("CA certificate: not valid UTF-8: {}", e))
        })?;
        let issuer_params = CertificateParams::from_ca_cert_pem(&issuer_pem).map_err(|e| {
            CredentialsError::Certificate(format!("failed to parse CA parameters: {}", e))
        })?;
        let issuer = issuer_params.self_signed(&ca_key).map_err(|e| {
            CredentialsError::Certificate(format!("failed to rebuild CA issuer: {}", e))
        })?;

        let client_key = KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(|e| {
            CredentialsError::Certificate(format!("failed to generate client key pair: {}", e))
        })?;

        let mut params = CertificateParams::new(Vec::new()).map_err(|e| {
            CredentialsError::Certificate(format!("failed to build certificate params: {}", e))
        })?;

        let mut name = DistinguishedName::new();
        // The organization is the authorization token consumed by peers.
        name.push(DnType::OrganizationName, ADMIN_ROLE);
        name.push(DnType::CommonName, CLIENT_COMMON_NAME);
        params.distinguished_name = name;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW_TOLERANCE;
        params.not_after = now + CERT_VALIDITY;
        params.serial_number = Some(SerialNumber::from_slice(&rand::random::<[u8; 16]>()));
        params.key_usages =
            vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.is_ca = IsCa::ExplicitNoCa;

        let client_cert = params.signed_by(&client_key, &issuer, &ca_key).map_err(|e| {
            CredentialsError::Certificate(format!("failed to sign client certificate: {}", e))
        })?;

        Ok(Self {
            ca_cert,
            client_cert: client_cert.der().clone(),
            client_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(client_key.serialize_der())),
        })
    }

    /// The CA certificate this bundle chains to.
    pub fn ca_certificate(&self) -> &CertificateDer<'static> {
        &self.ca_cert
    }

    /// The minted client leaf certificate.
    pub fn client_certificate(&self) -> &CertificateDer<'static> {
        &self.client_cert
    }

    /// A copy of the client private key for TLS configuration.
    pub fn client_key(&self) -> PrivateKeyDer<'static> {
        self.client_key.clone_key()
    }
}

/// Decode a base64-wrapped PEM document.
fn decode_base64(data: &str, what: &str) -> Result<Vec<u8>, CredentialsError> {
    if data.is_empty() {
        return Err(CredentialsError::CaMissing);
    }

    let decoded = BASE64.decode(data.trim()).map_err(|e| {
        CredentialsError::InvalidEncoding(format!("{}: base64 decode failed: {}", what, e))
    })?;

    if decoded.is_empty() {
        return Err(CredentialsError::InvalidEncoding(format!("{}: decoded data is empty", what)));
    }

    Ok(decoded)
}

/// Parse the PEM CA certificate into DER, requiring a `CERTIFICATE` block.
fn parse_ca_certificate(pem_data: &[u8]) -> Result<CertificateDer<'static>, CredentialsError> {
    let block = pem::parse(pem_data).map_err(|e| {
        CredentialsError::InvalidEncoding(format!("CA certificate: PEM decode failed: {}", e))
    })?;

    if block.tag() != "CERTIFICATE" {
        return Err(CredentialsError::InvalidEncoding(format!(
            "CA certificate: unexpected PEM block type {:?}, expected CERTIFICATE",
            block.tag()
        )));
    }

    Ok(CertificateDer::from(block.contents().to_vec()))
}

/// Parse the PEM CA private key into a signing key pair.
fn parse_ca_key(pem_data: &[u8]) -> Result<KeyPair, CredentialsError> {
    let block = pem::parse(pem_data).map_err(|e| {
        CredentialsError::InvalidEncoding(format!("CA key: PEM decode failed: {}", e))
    })?;

    let pkcs8 = key_to_pkcs8(&block)?;

    KeyPair::try_from(pkcs8.as_slice())
        .map_err(|e| CredentialsError::UnsupportedKey(format!("{}: {}", block.tag(), e)))
}

/// Normalize a private key PEM block to PKCS#8 DER.
///
/// The host OS writes Ed25519 CA keys with an `ED25519 PRIVATE KEY` label but
/// PKCS#8 contents. SEC1 (`EC PRIVATE KEY`) and PKCS#1 (`RSA PRIVATE KEY`)
/// blocks are converted. Unrecognized labels get one attempt per encoding
/// before the key is rejected.
fn key_to_pkcs8(block: &pem::Pem) -> Result<Vec<u8>, CredentialsError> {
    match block.tag() {
        "ED25519 PRIVATE KEY" | "PRIVATE KEY" => Ok(block.contents().to_vec()),
        "EC PRIVATE KEY" => sec1_to_pkcs8(block.contents()),
        "RSA PRIVATE KEY" => pkcs1_to_pkcs8(block.contents()),
        other => {
            if KeyPair::try_from(block.contents()).is_ok() {
                return Ok(block.contents().to_vec());
            }
            if let Ok(der) = sec1_to_pkcs8(block.contents()) {
                return Ok(der);
            }
            if let Ok(der) = pkcs1_to_pkcs8(block.contents()) {
                return Ok(der);
            }
            Err(CredentialsError::UnsupportedKey(format!("unknown PEM block type {:?}", other)))
        },
    }
}

/// Convert a SEC1 EC private key to PKCS#8 DER.
fn sec1_to_pkcs8(der: &[u8]) -> Result<Vec<u8>, CredentialsError> {
    if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
        return key
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CredentialsError::UnsupportedKey(format!("EC P-256 key: {}", e)));
    }

    if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
        return key
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CredentialsError::UnsupportedKey(format!("EC P-384 key: {}", e)));
    }

    Err(CredentialsError::UnsupportedKey("EC key: unsupported curve".to_string()))
}

/// Convert a PKCS#1 RSA private key to PKCS#8 DER.
fn pkcs1_to_pkcs8(der: &[u8]) -> Result<Vec<u8>, CredentialsError> {
    let key = rsa::RsaPrivateKey::from_pkcs1_der(der)
        .map_err(|e| CredentialsError::UnsupportedKey(format!("RSA key: {}", e)))?;

    key.to_pkcs8_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CredentialsError::UnsupportedKey(format!("RSA key: {}", e)))
}
