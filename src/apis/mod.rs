//! Kubernetes API integrations
//!
//! One watcher specialization per resource kind consumed by the
//! controller:
//! - Namespaces: cluster-wide discovery (name-only payloads)
//! - Ingresses: routing rules per namespace
//! - Services: backend endpoints, one watcher per referenced service
//! - Secrets: TLS key material, one watcher per referenced secret

pub mod ingresses;
pub mod namespaces;
pub mod secrets;
pub mod services;
pub mod watch;
