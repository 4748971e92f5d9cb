//! Serving surface
//!
//! Three listeners share the routing state: HTTPS with SNI-resolved
//! certificates, plain HTTP that redirects to HTTPS (except ACME
//! challenges), and a status listener exposing a healthcheck, metrics and
//! a JSON snapshot of the known services and routes.

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use serde::Serialize;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::controller::state::{RouteTable, RoutingState, ServiceEndpoint};
use crate::error::Error;
use crate::proxy::fallback::generate_fallback_certificate;
use crate::proxy::forwarder::{http_client, HttpClient};
use crate::proxy::handler::{empty, full, handle};
use crate::proxy::metrics;
use crate::proxy::tls::{server_config, SniResolver};

const HEALTHCHECK_PATH: &str = "/healthcheck";
const METRICS_PATH: &str = "/metrics";

/// The proxy's listening side
pub struct Proxy {
    state: Arc<RoutingState>,
    config: Config,
}

impl Proxy {
    pub fn new(state: Arc<RoutingState>, config: Config) -> Self {
        Self { state, config }
    }

    /// Bind all listeners and serve until `scope` is canceled.
    ///
    /// Failing to bind any socket ends the proxy with an error; individual
    /// connection failures never do.
    pub async fn run(self, scope: CancellationToken) -> Result<(), Error> {
        info!("Starting web server");

        let fallback = match generate_fallback_certificate() {
            Ok(key) => {
                info!("Generated fallback TLS certificate");
                Some(key)
            }
            Err(error) => {
                error!(%error, "Unable to generate fallback certificate");
                None
            }
        };
        let tls_config = Arc::new(server_config(SniResolver::new(
            Arc::clone(&self.state),
            fallback,
        )));
        let client = http_client();

        let https = bind(self.config.https_port).await?;
        info!(port = self.config.https_port, "Listening on HTTPS");
        let http = bind(self.config.http_port).await?;
        info!(port = self.config.http_port, "Listening on HTTP");
        let status = bind(self.config.status_port).await?;
        info!(port = self.config.status_port, "Listening on status");

        let mut listeners = JoinSet::new();
        listeners.spawn(serve_https(
            https,
            tls_config,
            Arc::clone(&self.state),
            client.clone(),
            scope.clone(),
        ));
        listeners.spawn(serve_http(
            http,
            Arc::clone(&self.state),
            client.clone(),
            "http",
            scope.clone(),
        ));
        listeners.spawn(serve_status(status, Arc::clone(&self.state), scope.clone()));

        while let Some(result) = listeners.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(error.into()),
                Err(join_error) => {
                    return Err(Error::Io(io::Error::other(join_error)));
                }
            }
        }
        Ok(())
    }
}

async fn bind(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

/// Accept TLS connections, terminate them and serve requests with the
/// HTTPS handler semantics
pub(crate) async fn serve_https(
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    state: Arc<RoutingState>,
    client: HttpClient,
    scope: CancellationToken,
) -> io::Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                let acceptor = acceptor.clone();
                let state = Arc::clone(&state);
                let client = client.clone();

                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(error) => {
                            debug!(%remote, %error, "TLS handshake failed");
                            return;
                        }
                    };

                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&state), client.clone(), "https", remote)
                    });
                    if let Err(error) = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .with_upgrades()
                        .await
                    {
                        debug!(%remote, %error, "Connection ended with error");
                    }
                });
            }
        }
    }
}

/// Accept plain-TCP connections and serve requests with the given scheme
/// semantics
pub(crate) async fn serve_http(
    listener: TcpListener,
    state: Arc<RoutingState>,
    client: HttpClient,
    scheme: &'static str,
    scope: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                let state = Arc::clone(&state);
                let client = client.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&state), client.clone(), scheme, remote)
                    });
                    if let Err(error) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        debug!(%remote, %error, "Connection ended with error");
                    }
                });
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StatusSnapshot {
    services: Vec<ServiceEndpoint>,
    routes: Vec<RouteTable>,
}

async fn handle_status(
    req: Request<hyper::body::Incoming>,
    state: Arc<RoutingState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    if req.uri().path() == HEALTHCHECK_PATH {
        return Ok(Response::new(full("Healthy\n")));
    }

    if req.uri().path() == METRICS_PATH {
        return Ok(match metrics::encode() {
            Ok(body) => Response::builder()
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(full(body))
                .unwrap(),
            Err(error) => {
                error!(%error, "Failed to encode metrics");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(empty())
                    .unwrap()
            }
        });
    }

    let snapshot = StatusSnapshot {
        services: state.services(),
        routes: state.route_tables(),
    };
    Ok(match serde_json::to_vec_pretty(&snapshot) {
        Ok(body) => Response::builder()
            .header("Content-Type", "application/json")
            .body(full(body))
            .unwrap(),
        Err(_) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(full("Error returning status"))
            .unwrap(),
    })
}

/// Serve the healthcheck/metrics/state-dump listener
pub(crate) async fn serve_status(
    listener: TcpListener,
    state: Arc<RoutingState>,
    scope: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle_status(req, Arc::clone(&state)));
                    if let Err(error) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%remote, %error, "Status connection ended with error");
                    }
                });
            }
        }
    }
}
