//! Namespace watcher
//!
//! Cluster-wide discovery feeding the per-namespace reconciliation tree.
//! Only the namespace name is published; a Modified event republishes the
//! name and the controller's handle map deduplicates it.

use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::Client;

use crate::apis::watch::{WatchedResource, Watcher};

pub struct ClusterNamespaces;

impl WatchedResource for ClusterNamespaces {
    type Object = Namespace;
    type Changed = String;
    type Deleted = String;

    fn api(&self, client: Client) -> Api<Namespace> {
        Api::all(client)
    }

    fn changed(&self, object: Namespace) -> Option<String> {
        object.metadata.name
    }

    fn deleted(&self, object: Namespace) -> Option<String> {
        object.metadata.name
    }

    fn describe(&self) -> String {
        "namespaces".to_string()
    }
}

pub fn namespace_watcher(client: Client) -> Watcher<ClusterNamespaces> {
    Watcher::new(client, ClusterNamespaces)
}
