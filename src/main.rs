//! Inlet entry point
//!
//! Wires the controller and the serving surface together: loads
//! environment configuration, authenticates against the cluster, starts
//! the watcher tree and serves traffic until interrupted.

use anyhow::Result;
use kube::config::KubeConfigOptions;
use kube::Client;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inlet::config::Config;
use inlet::controller::state::RoutingState;
use inlet::controller::Controller;
use inlet::error::Error;
use inlet::proxy::server::Proxy;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter)),
        )
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    match &config.target_namespace {
        Some(namespace) => info!(%namespace, "Starting for namespace"),
        None => info!("Starting for all namespaces"),
    }

    let client = build_client(&config).await?;

    let state = Arc::new(RoutingState::new());
    let controller = Controller::new(client, config.target_namespace.clone(), Arc::clone(&state));

    // The root scope is tied to process lifetime; SIGINT cancels it and
    // the whole watcher tree unwinds with it
    let root = CancellationToken::new();
    let signal_scope = root.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutting down from interrupt");
            signal_scope.cancel();
        }
    });

    tokio::spawn(controller.monitor(root.clone()));

    let proxy = Proxy::new(state, config);
    let result = proxy.run(root.clone()).await;
    root.cancel();
    Ok(result?)
}

async fn build_client(config: &Config) -> Result<Client, Error> {
    let client_config = match &config.kubeconfig {
        Some(path) => {
            info!(%path, "Connecting using kubeconfig");
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .map_err(|e| Error::Config(format!("Error reading kubeconfig: {e}")))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Config(format!("Error loading kubeconfig: {e}")))?
        }
        None => {
            info!("Connecting using in-cluster configuration");
            kube::Config::incluster()
                .map_err(|e| Error::Config(format!("Error connecting to cluster: {e}")))?
        }
    };

    Client::try_from(client_config).map_err(Error::from)
}
