//! Ingress watcher
//!
//! Watches Ingress resources in one namespace and publishes the full
//! object; the controller extracts rules, TLS sections and backend
//! references from it.

use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::Client;

use crate::apis::watch::{WatchedResource, Watcher};

pub struct NamespacedIngresses {
    namespace: String,
}

impl WatchedResource for NamespacedIngresses {
    type Object = Ingress;
    type Changed = Ingress;
    type Deleted = Ingress;

    fn api(&self, client: Client) -> Api<Ingress> {
        Api::namespaced(client, &self.namespace)
    }

    fn changed(&self, object: Ingress) -> Option<Ingress> {
        object.metadata.name.is_some().then_some(object)
    }

    fn deleted(&self, object: Ingress) -> Option<Ingress> {
        object.metadata.name.is_some().then_some(object)
    }

    fn describe(&self) -> String {
        format!("ingresses in {}", self.namespace)
    }
}

pub fn ingress_watcher(client: Client, namespace: String) -> Watcher<NamespacedIngresses> {
    Watcher::new(client, NamespacedIngresses { namespace })
}
