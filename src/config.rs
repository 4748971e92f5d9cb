//! Configuration for the inlet proxy
//!
//! Everything comes from the environment; the listening ports are fixed.

use std::env;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listener port
    pub http_port: u16,

    /// HTTPS listener port
    pub https_port: u16,

    /// Status/healthcheck listener port
    pub status_port: u16,

    /// Namespace to watch for ingress rules; all namespaces when unset
    pub target_namespace: Option<String>,

    /// Path to a kubeconfig file; in-cluster credentials when unset
    pub kubeconfig: Option<String>,

    /// Log filter derived from LOG_LEVEL
    pub log_filter: &'static str,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            status_port: 8080,
            target_namespace: None,
            kubeconfig: None,
            log_filter: "info",
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.target_namespace = env::var("TARGET_NAMESPACE").ok().filter(|v| !v.is_empty());
        config.kubeconfig = env::var("KUBECONFIG").ok().filter(|v| !v.is_empty());
        config.log_filter = log_filter(env::var("LOG_LEVEL").ok().as_deref());

        config
    }
}

/// Map LOG_LEVEL onto a tracing filter; unknown values fall back to info
fn log_filter(level: Option<&str>) -> &'static str {
    match level {
        Some("verbose") => "debug",
        Some("warning") => "warn",
        _ => "info",
    }
}
