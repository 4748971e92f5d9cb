//! Shared routing state
//!
//! Owns the route table, the service registry, the certificate cache and
//! the host→secret binding. The controller mutates these under
//! per-collection locks; the data plane only reads, in short critical
//! sections.
//!
//! When two collection locks are held together the fixed order is:
//! host bindings → certificates → services → route table.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use rustls::sign::CertifiedKey;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// One `(path prefix → backend)` binding within a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoutePath {
    pub path: String,
    pub service_name: String,
    pub service_port: i32,
}

/// Ordered per-host path list used at request time.
///
/// `paths` is kept sorted by descending path length so the most specific
/// prefix matches first; ties keep insertion order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteTable {
    pub ingress: String,
    pub host: String,
    pub paths: Vec<RoutePath>,
}

/// A service endpoint resolved from the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEndpoint {
    pub service_name: String,
    #[serde(rename = "ClusterIP")]
    pub cluster_ip: String,
}

/// Lock a collection, recovering the guard if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `<namespace>/<name>` key used across all collections
pub fn qualified_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Denormalized routing state shared between the controller and the
/// data plane
#[derive(Default)]
pub struct RoutingState {
    /// host → route table
    routes: Mutex<HashMap<String, RouteTable>>,
    /// "<ns>/<name>" → endpoint
    services: Mutex<HashMap<String, ServiceEndpoint>>,
    /// "<ns>/<secret>" → parsed keypair
    certificates: Mutex<HashMap<String, Arc<CertifiedKey>>>,
    /// host → "<ns>/<secret>"
    host_secrets: Mutex<HashMap<String, String>>,
}

impl RoutingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record host→secret bindings for every TLS section of an ingress,
    /// returning the referenced secret names so the caller can watch them.
    pub fn bind_tls_hosts(&self, ingress: &Ingress) -> Vec<String> {
        let Some(namespace) = ingress.metadata.namespace.as_deref() else {
            return Vec::new();
        };
        let Some(spec) = ingress.spec.as_ref() else {
            return Vec::new();
        };

        let mut secret_names = Vec::new();
        let mut host_secrets = lock(&self.host_secrets);
        for tls in spec.tls.iter().flatten() {
            let Some(secret_name) = tls.secret_name.as_ref() else {
                continue;
            };
            for host in tls.hosts.iter().flatten() {
                host_secrets.insert(host.clone(), qualified_name(namespace, secret_name));
            }
            secret_names.push(secret_name.clone());
        }
        secret_names
    }

    /// Fold an ingress's rules into the route table.
    ///
    /// A path that already exists for the host is overwritten in place;
    /// new paths are appended. The host entry is created on first use and
    /// its paths re-sorted longest-first afterwards.
    pub fn apply_ingress_routes(&self, ingress: &Ingress) {
        let Some(namespace) = ingress.metadata.namespace.as_deref() else {
            return;
        };
        let Some(ingress_name) = ingress.metadata.name.as_deref() else {
            return;
        };
        let Some(spec) = ingress.spec.as_ref() else {
            return;
        };
        let ingress_key = qualified_name(namespace, ingress_name);

        let mut routes = lock(&self.routes);
        for rule in spec.rules.iter().flatten() {
            let host = rule.host.clone().unwrap_or_default();
            let table = routes.entry(host.clone()).or_insert_with(|| RouteTable {
                ingress: ingress_name.to_string(),
                host: host.clone(),
                paths: Vec::new(),
            });

            let Some(http) = rule.http.as_ref() else {
                continue;
            };
            for path_spec in &http.paths {
                let Some(backend) = path_spec.backend.service.as_ref() else {
                    continue;
                };
                let service_name = qualified_name(namespace, &backend.name);
                let service_port = backend
                    .port
                    .as_ref()
                    .and_then(|port| port.number)
                    .unwrap_or_default();
                let path = path_spec.path.clone().unwrap_or_default();

                match table.paths.iter_mut().find(|route| route.path == path) {
                    Some(route) => {
                        route.service_name = service_name.clone();
                        route.service_port = service_port;
                        debug!(
                            ingress = %ingress_key,
                            %path,
                            %host,
                            backend = %format!("{service_name}:{service_port}"),
                            "Ingress route updated"
                        );
                    }
                    None => {
                        table.paths.push(RoutePath {
                            path: path.clone(),
                            service_name: service_name.clone(),
                            service_port,
                        });
                        debug!(
                            ingress = %ingress_key,
                            %path,
                            %host,
                            backend = %format!("{service_name}:{service_port}"),
                            "Ingress route added"
                        );
                    }
                }
            }

            // Longest prefix first; stable sort keeps insertion order on ties
            table.paths.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        }
    }

    /// Strip a deleted ingress's paths from the route table.
    ///
    /// Host entries are retained even when emptied. Certificates, host
    /// bindings and services referenced by the ingress are kept as well;
    /// it is hard to know what else still references them, so everything
    /// stays cached.
    pub fn remove_ingress_routes(&self, ingress: &Ingress) {
        let Some(spec) = ingress.spec.as_ref() else {
            return;
        };

        let mut routes = lock(&self.routes);
        for rule in spec.rules.iter().flatten() {
            let host = rule.host.clone().unwrap_or_default();
            let Some(table) = routes.get_mut(&host) else {
                continue;
            };
            for path_spec in rule.http.iter().flat_map(|http| &http.paths) {
                let path = path_spec.path.clone().unwrap_or_default();
                table.paths.retain(|route| route.path != path);
            }
        }
    }

    pub fn upsert_service(&self, service: &Service) {
        let (Some(namespace), Some(name)) = (
            service.metadata.namespace.as_deref(),
            service.metadata.name.as_deref(),
        ) else {
            return;
        };
        let key = qualified_name(namespace, name);
        let cluster_ip = service
            .spec
            .as_ref()
            .and_then(|spec| spec.cluster_ip.clone())
            .unwrap_or_default();

        debug!(service = %key, %cluster_ip, "Discovered service");
        lock(&self.services).insert(
            key.clone(),
            ServiceEndpoint {
                service_name: key,
                cluster_ip,
            },
        );
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        let key = qualified_name(namespace, name);
        lock(&self.services).remove(&key);
        debug!(service = %key, "Removed service");
    }

    pub fn upsert_certificate(&self, namespace: &str, secret_name: &str, key: Arc<CertifiedKey>) {
        let secret_key = qualified_name(namespace, secret_name);
        debug!(secret = %secret_key, "Discovered certificate");
        lock(&self.certificates).insert(secret_key, key);
    }

    pub fn remove_certificate(&self, namespace: &str, secret_name: &str) {
        let secret_key = qualified_name(namespace, secret_name);
        lock(&self.certificates).remove(&secret_key);
        debug!(secret = %secret_key, "Removed certificate");
    }

    /// Resolve the certificate bound to an SNI host, via the host→secret
    /// indirection. Misses on either step return `None`.
    pub fn certificate_for_host(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let host_secrets = lock(&self.host_secrets);
        let certificates = lock(&self.certificates);

        let secret_key = host_secrets.get(host)?;
        certificates.get(secret_key).cloned()
    }

    pub fn route_table(&self, host: &str) -> Option<RouteTable> {
        lock(&self.routes).get(host).cloned()
    }

    pub fn service(&self, service_name: &str) -> Option<ServiceEndpoint> {
        lock(&self.services).get(service_name).cloned()
    }

    /// Resolve a request path against an ordered path list, returning the
    /// backend as `host:port`. The list is already sorted longest-first, so
    /// the first prefix hit is the most specific one.
    pub fn resolve_backend(&self, paths: &[RoutePath], request_path: &str) -> Option<String> {
        for route in paths {
            if !request_path.starts_with(&route.path) {
                continue;
            }
            let Some(service) = self.service(&route.service_name) else {
                info!(
                    service = %route.service_name,
                    route = %route.path,
                    "Unable to find service to match route"
                );
                return None;
            };
            debug!(
                path = %request_path,
                backend = %format!("{}:{}", service.cluster_ip, route.service_port),
                "Matched path to service"
            );
            return Some(format!("{}:{}", service.cluster_ip, route.service_port));
        }
        None
    }

    /// Snapshot of all route tables, for the status surface
    pub fn route_tables(&self) -> Vec<RouteTable> {
        lock(&self.routes).values().cloned().collect()
    }

    /// Snapshot of all known services, for the status surface
    pub fn services(&self) -> Vec<ServiceEndpoint> {
        lock(&self.services).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec, IngressTLS, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ingress(name: &str, rules: Vec<IngressRule>, tls: Option<Vec<IngressTLS>>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(rules),
                tls,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn rule(host: &str, paths: &[(&str, &str, i32)]) -> IngressRule {
        IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: paths
                    .iter()
                    .map(|(path, service, port)| HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(*port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    })
                    .collect(),
            }),
        }
    }

    fn cluster_service(name: &str, cluster_ip: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn test_certified_key() -> Arc<CertifiedKey> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        Arc::new(
            crate::proxy::tls::certified_key_from_pem(
                cert.pem().as_bytes(),
                key_pair.serialize_pem().as_bytes(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_paths_sorted_longest_first_regardless_of_declaration_order() {
        let state = RoutingState::new();
        state.apply_ingress_routes(&ingress(
            "web",
            vec![rule(
                "a.test",
                &[("/", "root-svc", 80), ("/api/v1", "api-svc", 8080), ("/api", "api-svc", 80)],
            )],
            None,
        ));

        let table = state.route_table("a.test").expect("host entry");
        let paths: Vec<&str> = table.paths.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/api/v1", "/api", "/"]);
    }

    #[test]
    fn test_reapplied_path_overwrites_backend_in_place() {
        let state = RoutingState::new();
        state.apply_ingress_routes(&ingress("web", vec![rule("a.test", &[("/", "svc-a", 80)])], None));
        state.apply_ingress_routes(&ingress("web", vec![rule("a.test", &[("/", "svc-b", 9090)])], None));

        let table = state.route_table("a.test").unwrap();
        assert_eq!(table.paths.len(), 1);
        assert_eq!(table.paths[0].service_name, "default/svc-b");
        assert_eq!(table.paths[0].service_port, 9090);
    }

    #[test]
    fn test_ingress_delete_strips_paths_but_keeps_host_entry() {
        let state = RoutingState::new();
        let web = ingress(
            "web",
            vec![rule("a.test", &[("/", "svc-a", 80), ("/api", "svc-b", 80)])],
            None,
        );
        state.apply_ingress_routes(&web);
        state.remove_ingress_routes(&web);

        let table = state.route_table("a.test").expect("host entry is retained");
        assert!(table.paths.is_empty());
    }

    #[test]
    fn test_service_upsert_keeps_latest_cluster_ip() {
        let state = RoutingState::new();
        state.upsert_service(&cluster_service("svc-a", "10.0.0.1"));
        state.upsert_service(&cluster_service("svc-a", "10.0.0.2"));

        assert_eq!(state.services().len(), 1);
        assert_eq!(state.service("default/svc-a").unwrap().cluster_ip, "10.0.0.2");

        state.remove_service("default", "svc-a");
        assert!(state.service("default/svc-a").is_none());
    }

    #[test]
    fn test_certificate_resolution_is_a_two_step_indirection() {
        let state = RoutingState::new();
        state.bind_tls_hosts(&ingress(
            "web",
            vec![],
            Some(vec![IngressTLS {
                hosts: Some(vec!["a.test".to_string()]),
                secret_name: Some("tls-a".to_string()),
            }]),
        ));

        // Bound host without a loaded certificate still misses
        assert!(state.certificate_for_host("a.test").is_none());
        assert!(state.certificate_for_host("unknown.test").is_none());

        state.upsert_certificate("default", "tls-a", test_certified_key());
        assert!(state.certificate_for_host("a.test").is_some());

        state.remove_certificate("default", "tls-a");
        assert!(state.certificate_for_host("a.test").is_none());
    }

    #[test]
    fn test_bind_tls_hosts_returns_referenced_secrets() {
        let state = RoutingState::new();
        let secrets = state.bind_tls_hosts(&ingress(
            "web",
            vec![],
            Some(vec![
                IngressTLS {
                    hosts: Some(vec!["a.test".to_string(), "b.test".to_string()]),
                    secret_name: Some("tls-ab".to_string()),
                },
                IngressTLS {
                    hosts: Some(vec!["c.test".to_string()]),
                    secret_name: None,
                },
            ]),
        ));
        assert_eq!(secrets, vec!["tls-ab".to_string()]);
    }

    #[test]
    fn test_resolve_backend_prefers_longest_prefix() {
        let state = RoutingState::new();
        state.upsert_service(&cluster_service("svc-a", "10.0.0.1"));
        state.upsert_service(&cluster_service("svc-b", "10.0.0.2"));
        state.apply_ingress_routes(&ingress(
            "web",
            vec![rule("a.test", &[("/", "svc-a", 80), ("/api", "svc-b", 8080)])],
            None,
        ));

        let table = state.route_table("a.test").unwrap();
        assert_eq!(
            state.resolve_backend(&table.paths, "/api/x"),
            Some("10.0.0.2:8080".to_string())
        );
        assert_eq!(
            state.resolve_backend(&table.paths, "/other"),
            Some("10.0.0.1:80".to_string())
        );
    }

    #[test]
    fn test_resolve_backend_with_unknown_service_is_a_miss() {
        let state = RoutingState::new();
        state.apply_ingress_routes(&ingress("web", vec![rule("a.test", &[("/", "svc-a", 80)])], None));

        let table = state.route_table("a.test").unwrap();
        assert_eq!(state.resolve_backend(&table.paths, "/foo"), None);
    }

    #[test]
    fn test_status_snapshot_serializes_with_original_field_names() {
        let state = RoutingState::new();
        state.upsert_service(&cluster_service("svc-a", "10.0.0.1"));
        state.apply_ingress_routes(&ingress("web", vec![rule("a.test", &[("/", "svc-a", 80)])], None));

        let services = serde_json::to_value(state.services()).unwrap();
        assert_eq!(services[0]["ServiceName"], "default/svc-a");
        assert_eq!(services[0]["ClusterIP"], "10.0.0.1");

        let routes = serde_json::to_value(state.route_tables()).unwrap();
        assert_eq!(routes[0]["Host"], "a.test");
        assert_eq!(routes[0]["Paths"][0]["ServicePort"], 80);
    }
}
