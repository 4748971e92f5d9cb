//! TLS secret watcher
//!
//! Watches a single named secret and decodes its `tls.crt`/`tls.key` pair
//! into a ready-to-serve certified key. Secrets with missing or unparsable
//! key material are logged and never published.

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, WatchParams};
use kube::Client;
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use tracing::error;

use crate::apis::watch::{WatchedResource, Watcher};
use crate::proxy::tls::certified_key_from_pem;

const TLS_CERTIFICATE_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY: &str = "tls.key";

pub struct NamedTlsSecret {
    namespace: String,
    name: String,
}

impl WatchedResource for NamedTlsSecret {
    type Object = Secret;
    type Changed = Arc<CertifiedKey>;
    type Deleted = ();

    fn api(&self, client: Client) -> Api<Secret> {
        Api::namespaced(client, &self.namespace)
    }

    fn watch_params(&self) -> WatchParams {
        WatchParams::default().fields(&format!("metadata.name={}", self.name))
    }

    fn changed(&self, object: Secret) -> Option<Arc<CertifiedKey>> {
        let data = object.data?;

        let Some(certificate) = data.get(TLS_CERTIFICATE_KEY) else {
            error!(
                secret = %self.describe(),
                "Missing {TLS_CERTIFICATE_KEY} from secret"
            );
            return None;
        };
        let Some(private_key) = data.get(TLS_PRIVATE_KEY) else {
            error!(
                secret = %self.describe(),
                "Missing {TLS_PRIVATE_KEY} from secret"
            );
            return None;
        };

        match certified_key_from_pem(&certificate.0, &private_key.0) {
            Ok(key) => Some(Arc::new(key)),
            Err(error) => {
                error!(secret = %self.describe(), %error, "Unable to parse certificate");
                None
            }
        }
    }

    fn deleted(&self, _object: Secret) -> Option<()> {
        Some(())
    }

    fn describe(&self) -> String {
        format!("secret {}/{}", self.namespace, self.name)
    }
}

pub fn secret_watcher(client: Client, namespace: String, name: String) -> Watcher<NamedTlsSecret> {
    Watcher::new(client, NamedTlsSecret { namespace, name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn init_crypto() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn tls_secret(data: Option<BTreeMap<String, ByteString>>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("web-tls".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data,
            ..Default::default()
        }
    }

    fn target() -> NamedTlsSecret {
        NamedTlsSecret {
            namespace: "default".to_string(),
            name: "web-tls".to_string(),
        }
    }

    #[test]
    fn test_valid_secret_decodes_to_certified_key() {
        init_crypto();

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["a.test".to_string()])
                .expect("generate test certificate");

        let mut data = BTreeMap::new();
        data.insert(
            TLS_CERTIFICATE_KEY.to_string(),
            ByteString(cert.pem().into_bytes()),
        );
        data.insert(
            TLS_PRIVATE_KEY.to_string(),
            ByteString(key_pair.serialize_pem().into_bytes()),
        );

        let key = target().changed(tls_secret(Some(data)));
        assert!(key.is_some(), "valid key material should publish");
        assert_eq!(key.unwrap().cert.len(), 1);
    }

    #[test]
    fn test_secret_without_key_material_is_not_published() {
        init_crypto();

        assert!(target().changed(tls_secret(None)).is_none());

        let mut cert_only = BTreeMap::new();
        cert_only.insert(
            TLS_CERTIFICATE_KEY.to_string(),
            ByteString(b"garbage".to_vec()),
        );
        assert!(target().changed(tls_secret(Some(cert_only))).is_none());
    }

    #[test]
    fn test_secret_with_bad_pem_is_not_published() {
        init_crypto();

        let mut data = BTreeMap::new();
        data.insert(
            TLS_CERTIFICATE_KEY.to_string(),
            ByteString(b"not a certificate".to_vec()),
        );
        data.insert(TLS_PRIVATE_KEY.to_string(), ByteString(b"not a key".to_vec()));

        assert!(target().changed(tls_secret(Some(data))).is_none());
    }
}
