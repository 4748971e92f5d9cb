//! Request handling
//!
//! Matches each incoming request against the routing state: unknown hosts
//! are refused, plain-HTTP traffic is upgraded to HTTPS unless it is an
//! ACME challenge, and matched requests are forwarded to the resolved
//! backend with HSTS stamped on the way out.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, HOST, LOCATION, STRICT_TRANSPORT_SECURITY};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::controller::state::RoutingState;
use crate::proxy::forwarder::{forward, HttpClient};
use crate::proxy::metrics;

/// Certificate-issuance validation traffic must never be redirected to
/// HTTPS
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const HSTS_VALUE: &str = "max-age=63072000; includeSubDomains";

pub(crate) fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(full(message))
        .unwrap()
}

/// Strip any `:port` suffix from a Host header value
pub fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(index) => &host[..index],
        None => host,
    }
}

/// Handle one request from either listener
pub async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<RoutingState>,
    client: HttpClient,
    scheme: &'static str,
    remote: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let started = Instant::now();
    let response = route_request(req, &state, &client, scheme, remote).await;
    metrics::record_request(
        scheme,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    Ok(response)
}

async fn route_request(
    req: Request<hyper::body::Incoming>,
    state: &Arc<RoutingState>,
    client: &HttpClient,
    scheme: &'static str,
    remote: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .unwrap_or_default()
        .to_string();

    // No route table: no defined contract, or the controller isn't ready yet
    let Some(table) = state.route_table(&host) else {
        return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable\n");
    };

    let path = req.uri().path().to_string();

    // Upgrade to HTTPS unless this is ACME challenge traffic
    if scheme == "http" && !path.starts_with(ACME_CHALLENGE_PREFIX) {
        let target = format!(
            "https://{host}{}",
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        return Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(LOCATION, target)
            .body(empty())
            .unwrap();
    }

    let hsts = HeaderValue::from_static(HSTS_VALUE);

    let Some(backend) = state.resolve_backend(&table.paths, &path) else {
        let mut response =
            plain_response(StatusCode::NOT_FOUND, "Unable to resolve service for path\n");
        response
            .headers_mut()
            .insert(STRICT_TRANSPORT_SECURITY, hsts);
        return response;
    };

    info!(%backend, "Routing request");

    match forward(req, &backend, scheme, remote.ip(), client).await {
        Ok(mut response) => {
            response
                .headers_mut()
                .insert(STRICT_TRANSPORT_SECURITY, hsts);
            response
        }
        Err(error) => {
            error!(%backend, %error, "Forwarding failed");
            let mut response = plain_response(StatusCode::BAD_GATEWAY, "Bad gateway\n");
            response
                .headers_mut()
                .insert(STRICT_TRANSPORT_SECURITY, hsts);
            response
        }
    }
}
