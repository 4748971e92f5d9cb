//! Service watcher
//!
//! Watches a single named service, selected with a field selector the way
//! the control plane filters watches server-side.

use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, WatchParams};
use kube::Client;

use crate::apis::watch::{WatchedResource, Watcher};

pub struct NamedService {
    namespace: String,
    name: String,
}

impl WatchedResource for NamedService {
    type Object = Service;
    type Changed = Service;
    type Deleted = String;

    fn api(&self, client: Client) -> Api<Service> {
        Api::namespaced(client, &self.namespace)
    }

    fn watch_params(&self) -> WatchParams {
        WatchParams::default().fields(&format!("metadata.name={}", self.name))
    }

    fn changed(&self, object: Service) -> Option<Service> {
        object.metadata.name.is_some().then_some(object)
    }

    fn deleted(&self, object: Service) -> Option<String> {
        object.metadata.name
    }

    fn describe(&self) -> String {
        format!("service {}/{}", self.namespace, self.name)
    }
}

pub fn service_watcher(client: Client, namespace: String, name: String) -> Watcher<NamedService> {
    Watcher::new(client, NamedService { namespace, name })
}
