//! Fallback certificate synthesis
//!
//! Generates a one-year self-signed certificate at startup, served for
//! TLS handshakes whose SNI host has no bound certificate.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::error::Error;
use crate::proxy::tls::certified_key_from_pem;

pub const FALLBACK_COMMON_NAME: &str = "Self Signed Certificate";

/// Generate the self-signed fallback keypair.
///
/// Failure leaves the proxy without a fallback; handshakes for unmatched
/// hosts will then fail.
pub fn generate_fallback_certificate() -> Result<Arc<CertifiedKey>, Error> {
    let key_pair =
        KeyPair::generate().map_err(|e| Error::Certificate(format!("Error creating key: {e}")))?;

    let mut params = CertificateParams::default();

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, FALLBACK_COMMON_NAME);
    params.distinguished_name = name;

    params.serial_number = Some(SerialNumber::from_slice(&random_serial()?));
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(365);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Certificate(format!("Failed to generate certificate: {e}")))?;

    let certified = certified_key_from_pem(
        certificate.pem().as_bytes(),
        key_pair.serialize_pem().as_bytes(),
    )?;
    Ok(Arc::new(certified))
}

/// 128-bit random serial; the top bit is cleared so the encoded integer
/// stays positive
fn random_serial() -> Result<[u8; 16], Error> {
    let rng = SystemRandom::new();
    let mut serial = [0u8; 16];
    rng.fill(&mut serial)
        .map_err(|_| Error::Certificate("Failed to generate serial number".to_string()))?;
    serial[0] &= 0x7f;
    Ok(serial)
}
