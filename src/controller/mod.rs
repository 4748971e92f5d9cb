//! Control-plane reconciler
//!
//! A tree of cancelable watchers converging the shared routing state:
//! namespace discovery at the root, one ingress watcher per namespace,
//! and one service/certificate watcher per reference found in an ingress.
//! Handle registries suppress the duplicate subtrees the control plane
//! would otherwise create when it re-fires Added events.

pub mod state;

use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::apis::ingresses::ingress_watcher;
use crate::apis::namespaces::namespace_watcher;
use crate::apis::secrets::secret_watcher;
use crate::apis::services::service_watcher;
use crate::apis::watch::{WatchedResource, Watcher};
use crate::controller::state::{lock, qualified_name, RoutingState};

use k8s_openapi::api::networking::v1::Ingress;

const SUBSCRIBER: &str = "controller";

/// Watches cluster resources and converges the routing state
pub struct Controller {
    client: Client,
    target_namespace: Option<String>,
    state: Arc<RoutingState>,
    /// namespace → scope of its reconciliation subtree
    namespace_handles: Mutex<HashMap<String, CancellationToken>>,
    /// "<ns>/<ingress>" → scope of its watcher subtree
    ingress_handles: Mutex<HashMap<String, CancellationToken>>,
}

fn spawn_watcher<R: WatchedResource>(watcher: Arc<Watcher<R>>, scope: CancellationToken) {
    tokio::spawn(async move {
        if let Err(error) = watcher.run(scope).await {
            error!(%error, "Watcher terminated");
        }
    });
}

impl Controller {
    pub fn new(client: Client, target_namespace: Option<String>, state: Arc<RoutingState>) -> Arc<Self> {
        Arc::new(Self {
            client,
            target_namespace,
            state,
            namespace_handles: Mutex::new(HashMap::new()),
            ingress_handles: Mutex::new(HashMap::new()),
        })
    }

    /// Monitor cluster changes until `scope` is canceled
    pub async fn monitor(self: Arc<Self>, scope: CancellationToken) {
        // Only watch one namespace if configured to do so
        if let Some(namespace) = self.target_namespace.clone() {
            self.monitor_namespace(scope, namespace).await;
            return;
        }

        let watcher = Arc::new(namespace_watcher(self.client.clone()));
        let (added_tx, mut added) = mpsc::channel(1);
        let (deleted_tx, mut deleted) = mpsc::channel(1);
        watcher.subscribe_changed(SUBSCRIBER, added_tx);
        watcher.subscribe_deleted(SUBSCRIBER, deleted_tx);
        spawn_watcher(watcher, scope.clone());

        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                Some(namespace) = added.recv() => {
                    let mut handles = lock(&self.namespace_handles);
                    if !handles.contains_key(&namespace) {
                        let child = scope.child_token();
                        handles.insert(namespace.clone(), child.clone());
                        let controller = Arc::clone(&self);
                        tokio::spawn(async move {
                            controller.monitor_namespace(child, namespace).await;
                        });
                    }
                }
                Some(namespace) = deleted.recv() => {
                    if let Some(handle) = lock(&self.namespace_handles).remove(&namespace) {
                        handle.cancel();
                    }
                }
            }
        }
    }

    /// Watch one namespace's ingresses, maintaining a watcher subtree per
    /// ingress
    async fn monitor_namespace(self: Arc<Self>, scope: CancellationToken, namespace: String) {
        debug!(%namespace, "Discovered namespace");

        let watcher = Arc::new(ingress_watcher(self.client.clone(), namespace));
        let (changed_tx, mut changed) = mpsc::channel(1);
        let (deleted_tx, mut deleted) = mpsc::channel(1);
        watcher.subscribe_changed(SUBSCRIBER, changed_tx);
        watcher.subscribe_deleted(SUBSCRIBER, deleted_tx);
        spawn_watcher(watcher, scope.clone());

        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                Some(ingress) = changed.recv() => {
                    Arc::clone(&self).ingress_changed(&scope, ingress).await;
                }
                Some(ingress) = deleted.recv() => {
                    self.ingress_deleted(&ingress);
                }
            }
        }
    }

    /// Apply an ingress event: replace the ingress's watcher subtree, bind
    /// its TLS hosts, watch its referenced services and certificates, and
    /// fold its rules into the route table.
    async fn ingress_changed(self: Arc<Self>, parent: &CancellationToken, ingress: Ingress) {
        let (Some(namespace), Some(name)) = (
            ingress.metadata.namespace.clone(),
            ingress.metadata.name.clone(),
        ) else {
            return;
        };
        let key = qualified_name(&namespace, &name);

        // A re-fired ingress replaces the whole subtree: cancel the previous
        // watchers before any state from this event becomes visible
        let child = self.replace_ingress_handle(&key, parent);

        // TLS sections: bind hosts and watch each referenced secret
        for secret_name in self.state.bind_tls_hosts(&ingress) {
            let controller = Arc::clone(&self);
            let scope = child.clone();
            let namespace = namespace.clone();
            tokio::spawn(async move {
                controller
                    .monitor_certificate(scope, namespace, secret_name)
                    .await;
            });
        }

        // Rules: watch every referenced backend service. One watcher is
        // spawned per reference; duplicates are tolerated because the state
        // handlers are idempotent upserts and the subtree dies as one.
        if let Some(spec) = ingress.spec.as_ref() {
            for rule in spec.rules.iter().flatten() {
                for path in rule.http.iter().flat_map(|http| &http.paths) {
                    let Some(backend) = path.backend.service.as_ref() else {
                        continue;
                    };
                    let controller = Arc::clone(&self);
                    let scope = child.clone();
                    let namespace = namespace.clone();
                    let service_name = backend.name.clone();
                    tokio::spawn(async move {
                        controller
                            .monitor_service(scope, namespace, service_name)
                            .await;
                    });
                }
            }
        }

        self.state.apply_ingress_routes(&ingress);
        info!(ingress = %key, "Ingress applied");
    }

    fn ingress_deleted(&self, ingress: &Ingress) {
        let (Some(namespace), Some(name)) = (
            ingress.metadata.namespace.as_deref(),
            ingress.metadata.name.as_deref(),
        ) else {
            return;
        };
        let key = qualified_name(namespace, name);

        self.state.remove_ingress_routes(ingress);
        if let Some(handle) = lock(&self.ingress_handles).remove(&key) {
            handle.cancel();
        }
        info!(ingress = %key, "Ingress removed");
    }

    /// Watch one backend service and mirror it into the service registry
    async fn monitor_service(
        self: Arc<Self>,
        scope: CancellationToken,
        namespace: String,
        name: String,
    ) {
        let watcher = Arc::new(service_watcher(
            self.client.clone(),
            namespace.clone(),
            name,
        ));
        let (changed_tx, mut changed) = mpsc::channel(1);
        let (deleted_tx, mut deleted) = mpsc::channel(1);
        watcher.subscribe_changed(SUBSCRIBER, changed_tx);
        watcher.subscribe_deleted(SUBSCRIBER, deleted_tx);
        spawn_watcher(watcher, scope.clone());

        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                Some(service) = changed.recv() => self.state.upsert_service(&service),
                Some(deleted_name) = deleted.recv() => {
                    self.state.remove_service(&namespace, &deleted_name);
                }
            }
        }
    }

    /// Watch one TLS secret and mirror its keypair into the certificate
    /// cache
    async fn monitor_certificate(
        self: Arc<Self>,
        scope: CancellationToken,
        namespace: String,
        secret_name: String,
    ) {
        let watcher = Arc::new(secret_watcher(
            self.client.clone(),
            namespace.clone(),
            secret_name.clone(),
        ));
        let (changed_tx, mut changed) = mpsc::channel(1);
        let (deleted_tx, mut deleted) = mpsc::channel(1);
        watcher.subscribe_changed(SUBSCRIBER, changed_tx);
        watcher.subscribe_deleted(SUBSCRIBER, deleted_tx);
        spawn_watcher(watcher, scope.clone());

        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                Some(certificate) = changed.recv() => {
                    self.state
                        .upsert_certificate(&namespace, &secret_name, certificate);
                }
                Some(()) = deleted.recv() => {
                    self.state.remove_certificate(&namespace, &secret_name);
                }
            }
        }
    }

    /// Replace the watcher-subtree handle for an ingress key, canceling any
    /// previous subtree first
    fn replace_ingress_handle(&self, key: &str, parent: &CancellationToken) -> CancellationToken {
        let mut handles = lock(&self.ingress_handles);
        if let Some(previous) = handles.remove(key) {
            previous.cancel();
        }
        let child = parent.child_token();
        handles.insert(key.to_string(), child.clone());
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_controller() -> Arc<Controller> {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        Controller::new(client, None, Arc::new(RoutingState::new()))
    }

    #[tokio::test]
    async fn test_refired_ingress_cancels_previous_subtree() {
        let controller = test_controller();
        let root = CancellationToken::new();

        let first = controller.replace_ingress_handle("default/web", &root);
        assert!(!first.is_cancelled());

        let second = controller.replace_ingress_handle("default/web", &root);
        assert!(first.is_cancelled(), "prior subtree must die before the replacement");
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn test_subtree_scopes_follow_the_parent() {
        let controller = test_controller();
        let root = CancellationToken::new();

        let handle = controller.replace_ingress_handle("default/web", &root);
        root.cancel();
        assert!(handle.is_cancelled(), "cancellation propagates downward");
    }
}
