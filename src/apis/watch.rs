//! Generic resource watcher
//!
//! Maintains a live watch stream over a filtered slice of one resource
//! kind and republishes decoded events to named subscribers. The server
//! may close a watch stream at any time; that is routine and the stream
//! is reopened. Any other stream error terminates the watcher.

use kube::api::{Api, WatchEvent, WatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::controller::state::lock;

/// Decodes one watched resource kind into subscriber payloads.
///
/// `changed` and `deleted` return `None` when the event carries no usable
/// payload; such events are dropped.
pub trait WatchedResource: Send + Sync + 'static {
    type Object: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static;
    type Changed: Clone + Send + 'static;
    type Deleted: Clone + Send + 'static;

    fn api(&self, client: Client) -> Api<Self::Object>;

    fn watch_params(&self) -> WatchParams {
        WatchParams::default()
    }

    fn changed(&self, object: Self::Object) -> Option<Self::Changed>;

    fn deleted(&self, object: Self::Object) -> Option<Self::Deleted>;

    /// Human-readable identity of the watched slice, for logs
    fn describe(&self) -> String;
}

/// Long-running observer over one resource stream.
///
/// Subscribers are registered under a name; re-subscribing under the same
/// name replaces the previous sink. Publishing is synchronous: every sink
/// receives every event in registration order, so subscribers must drain
/// promptly.
pub struct Watcher<R: WatchedResource> {
    client: Client,
    resource: R,
    changed_subscribers: Mutex<Vec<(String, mpsc::Sender<R::Changed>)>>,
    deleted_subscribers: Mutex<Vec<(String, mpsc::Sender<R::Deleted>)>>,
}

impl<R: WatchedResource> Watcher<R> {
    pub fn new(client: Client, resource: R) -> Self {
        Self {
            client,
            resource,
            changed_subscribers: Mutex::new(Vec::new()),
            deleted_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a sink receiving the decoded resource on Added/Modified
    pub fn subscribe_changed(&self, source: &str, sink: mpsc::Sender<R::Changed>) {
        let mut subscribers = lock(&self.changed_subscribers);
        subscribers.retain(|(name, _)| name != source);
        subscribers.push((source.to_string(), sink));
    }

    /// Register a sink receiving the decoded identity on Deleted
    pub fn subscribe_deleted(&self, source: &str, sink: mpsc::Sender<R::Deleted>) {
        let mut subscribers = lock(&self.deleted_subscribers);
        subscribers.retain(|(name, _)| name != source);
        subscribers.push((source.to_string(), sink));
    }

    /// Watch until `scope` is canceled.
    ///
    /// Each iteration opens a stream and consumes events from it. A closed
    /// stream is reopened; opening or reading any other error ends the
    /// watcher with that error.
    pub async fn run(&self, scope: CancellationToken) -> Result<(), kube::Error> {
        use futures::TryStreamExt;

        loop {
            if scope.is_cancelled() {
                return Ok(());
            }

            let api = self.resource.api(self.client.clone());
            let params = self.resource.watch_params();
            let stream = api.watch(&params, "0").await.inspect_err(|error| {
                error!(
                    resource = %self.resource.describe(),
                    %error,
                    "Failed to open watch stream"
                );
            })?;
            futures::pin_mut!(stream);

            loop {
                tokio::select! {
                    _ = scope.cancelled() => return Ok(()),
                    event = stream.try_next() => match event {
                        Ok(Some(event)) => self.dispatch(event).await,
                        Ok(None) => {
                            debug!(
                                resource = %self.resource.describe(),
                                "Watch stream closed, reopening"
                            );
                            break;
                        }
                        Err(error) => {
                            error!(
                                resource = %self.resource.describe(),
                                %error,
                                "Watch stream failed"
                            );
                            return Err(error);
                        }
                    },
                }
            }
        }
    }

    async fn dispatch(&self, event: WatchEvent<R::Object>) {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                match self.resource.changed(object) {
                    Some(payload) => self.publish_changed(payload).await,
                    None => debug!(
                        resource = %self.resource.describe(),
                        "Dropping change event without usable payload"
                    ),
                }
            }
            WatchEvent::Deleted(object) => match self.resource.deleted(object) {
                Some(payload) => self.publish_deleted(payload).await,
                None => debug!(
                    resource = %self.resource.describe(),
                    "Dropping delete event without usable payload"
                ),
            },
            other => debug!(
                resource = %self.resource.describe(),
                event = ?other,
                "Ignoring watch event"
            ),
        }
    }

    async fn publish_changed(&self, payload: R::Changed) {
        // Snapshot the sinks so the registry lock is never held across a send
        let sinks: Vec<mpsc::Sender<R::Changed>> = lock(&self.changed_subscribers)
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();

        for sink in sinks {
            // A closed receiver means its scope was canceled; nothing to do
            let _ = sink.send(payload.clone()).await;
        }
    }

    async fn publish_deleted(&self, payload: R::Deleted) {
        let sinks: Vec<mpsc::Sender<R::Deleted>> = lock(&self.deleted_subscribers)
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();

        for sink in sinks {
            let _ = sink.send(payload.clone()).await;
        }
    }

    #[cfg(test)]
    fn changed_subscriber_names(&self) -> Vec<String> {
        lock(&self.changed_subscribers)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::namespaces::ClusterNamespaces;

    async fn test_client() -> Client {
        // A client pointed at a reserved address; watcher tests here only
        // exercise the subscriber registry, which never dials out.
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        Client::try_from(config).expect("client from static config")
    }

    #[tokio::test]
    async fn test_resubscribing_replaces_sink_and_keeps_order() {
        let watcher = Watcher::new(test_client().await, ClusterNamespaces);

        let (first_tx, _first_rx) = mpsc::channel(1);
        let (second_tx, _second_rx) = mpsc::channel(1);
        let (replacement_tx, mut replacement_rx) = mpsc::channel(1);

        watcher.subscribe_changed("first", first_tx);
        watcher.subscribe_changed("second", second_tx);
        watcher.subscribe_changed("first", replacement_tx);

        // Replacing a sink re-registers it at the end; names stay unique
        assert_eq!(
            watcher.changed_subscriber_names(),
            vec!["second".to_string(), "first".to_string()]
        );

        watcher.publish_changed("kube-system".to_string()).await;
        assert_eq!(replacement_rx.recv().await.unwrap(), "kube-system");
    }

    #[tokio::test]
    async fn test_publish_tolerates_closed_sinks() {
        let watcher = Watcher::new(test_client().await, ClusterNamespaces);

        let (dead_tx, dead_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(1);
        watcher.subscribe_changed("dead", dead_tx);
        watcher.subscribe_changed("live", live_tx);
        drop(dead_rx);

        watcher.publish_changed("default".to_string()).await;
        assert_eq!(live_rx.recv().await.unwrap(), "default");
    }

    #[tokio::test]
    async fn test_run_returns_when_scope_already_canceled() {
        let watcher = Watcher::new(test_client().await, ClusterNamespaces);
        let scope = CancellationToken::new();
        scope.cancel();

        // Must not attempt to open a stream against the dead endpoint
        watcher.run(scope).await.expect("canceled scope is a clean exit");
    }
}
