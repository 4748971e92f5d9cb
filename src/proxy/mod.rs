//! Data plane
//!
//! Serves live traffic against the routing state: TLS termination with
//! SNI-resolved certificates, HTTP→HTTPS redirection, longest-prefix
//! route matching and byte-level forwarding to cluster backends.

pub mod fallback;
pub mod forwarder;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod tls;
