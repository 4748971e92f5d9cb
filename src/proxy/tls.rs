//! TLS termination
//!
//! PEM parsing for secret key material and SNI-based certificate
//! selection against the routing state, with a self-signed fallback for
//! unmatched hosts.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::io::{self, BufReader};
use std::sync::Arc;
use tracing::warn;

use crate::controller::state::RoutingState;

/// Parse a PEM certificate chain and private key into a servable keypair
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> io::Result<CertifiedKey> {
    let mut cert_reader = BufReader::new(cert_pem);
    let cert_chain = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if cert_chain.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "No certificate found",
        ));
    }

    let mut key_reader = BufReader::new(key_pem);
    let key = private_key(&mut key_reader)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "No private key found"))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// Certificate selection invoked by the TLS handshake.
///
/// Resolves the ClientHello's SNI host through the routing state; hosts
/// with no bound certificate are served the self-signed fallback. With no
/// fallback available the handshake fails.
pub struct SniResolver {
    state: Arc<RoutingState>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new(state: Arc<RoutingState>, fallback: Option<Arc<CertifiedKey>>) -> Self {
        Self { state, fallback }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();

        if let Some(host) = server_name {
            if let Some(key) = self.state.certificate_for_host(host) {
                return Some(key);
            }
        }

        warn!(
            host = server_name.unwrap_or("<no sni>"),
            "Missing certificate for host, using fallback"
        );
        self.fallback.clone()
    }
}

/// Build the HTTPS server configuration: TLS 1.2 minimum and HTTP/1.1
/// only, so every session uses an ephemeral key exchange
pub fn server_config(resolver: SniResolver) -> ServerConfig {
    let mut config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_crypto() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn test_pem() -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn test_certified_key_from_valid_pem() {
        init_crypto();
        let (cert_pem, key_pem) = test_pem();

        let key = certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
            .expect("valid PEM should parse");
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn test_certified_key_rejects_invalid_pem() {
        init_crypto();
        assert!(certified_key_from_pem(b"not a certificate", b"not a key").is_err());

        let (cert_pem, _) = test_pem();
        assert!(certified_key_from_pem(cert_pem.as_bytes(), b"not a key").is_err());
    }

    #[test]
    fn test_server_config_disables_http2() {
        init_crypto();
        let resolver = SniResolver::new(Arc::new(RoutingState::new()), None);
        let config = server_config(resolver);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
