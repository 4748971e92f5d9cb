//! Inlet - cluster-aware HTTPS ingress proxy
//!
//! Watches Ingress, Service and TLS Secret resources in a Kubernetes
//! cluster, converges an in-memory routing table and serves live
//! HTTP/HTTPS traffic against it.

pub mod apis;
pub mod config;
pub mod controller;
pub mod error;
pub mod proxy;
