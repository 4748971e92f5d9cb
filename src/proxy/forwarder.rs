//! Backend request forwarding
//!
//! Byte-level proxying to a resolved cluster backend over a pooled HTTP
//! client. The inbound Host header is preserved for the backend, and
//! upstream `X-Forwarded-*` headers are discarded and re-stamped because
//! the proxy is internet-facing. Upgrade requests (WebSockets) are
//! tunneled by splicing the two upgraded connections together.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, HOST, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::proxy::handler::empty;

/// Pooled HTTP client used for all backend traffic
pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Check if a header is hop-by-hop and should not be forwarded
/// Per RFC 2616 Section 13.5.1
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn is_forwarded_header(name: &str) -> bool {
    name.len() >= 12 && name[..12].eq_ignore_ascii_case("x-forwarded-")
}

fn forwarded_headers(
    host: Option<&HeaderValue>,
    scheme: &str,
    remote_ip: IpAddr,
) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = vec![
        (
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_str(&remote_ip.to_string()).expect("IP addresses are valid header values"),
        ),
        (
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static(if scheme == "https" { "https" } else { "http" }),
        ),
    ];
    if let Some(host) = host {
        headers.push((HeaderName::from_static("x-forwarded-host"), host.clone()));
    }
    headers
}

/// Forward a request to `backend` (`host:port`), returning the backend's
/// response with hop-by-hop headers removed
pub async fn forward(
    req: Request<hyper::body::Incoming>,
    backend: &str,
    scheme: &'static str,
    remote_ip: IpAddr,
    client: &HttpClient,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, String> {
    if req.headers().contains_key(UPGRADE) {
        return forward_upgrade(req, backend, scheme, remote_ip, client).await;
    }

    let (parts, body) = req.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| format!("Failed to read request body: {e}"))?
        .to_bytes();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let backend_uri = format!("http://{backend}{path_and_query}");

    let mut backend_req_builder = Request::builder()
        .method(parts.method.clone())
        .uri(&backend_uri);

    // Copy end-to-end headers; the Host header passes through unchanged so
    // name-based virtual hosting keeps working behind the proxy
    for (name, value) in parts.headers.iter() {
        let name_str = name.as_str();
        if !is_hop_by_hop_header(name_str) && !is_forwarded_header(name_str) {
            backend_req_builder = backend_req_builder.header(name, value);
        }
    }
    for (name, value) in forwarded_headers(parts.headers.get(HOST), scheme, remote_ip) {
        backend_req_builder = backend_req_builder.header(name, value);
    }

    let backend_req = backend_req_builder
        .body(Full::new(body_bytes))
        .map_err(|e| format!("Failed to build backend request: {e}"))?;

    let backend_resp = client.request(backend_req).await.map_err(|e| {
        warn!(backend = %backend_uri, error = %e, "Backend connection failed");
        format!("Backend connection failed: {e}")
    })?;

    let (mut parts, body) = backend_resp.into_parts();
    let hop_by_hop: Vec<_> = parts
        .headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        parts.headers.remove(name);
    }

    Ok(Response::from_parts(parts, body.boxed()))
}

/// Forward an upgrade request and, once both sides switch protocols,
/// splice the upgraded connections together
async fn forward_upgrade(
    req: Request<hyper::body::Incoming>,
    backend: &str,
    scheme: &'static str,
    remote_ip: IpAddr,
    client: &HttpClient,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, String> {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let backend_uri = format!("http://{backend}{path_and_query}");

    // The upgrade negotiation headers (Connection, Upgrade,
    // Sec-WebSocket-*) must reach the backend verbatim
    let mut backend_req_builder = Request::builder()
        .method(parts.method.clone())
        .uri(&backend_uri);
    for (name, value) in parts.headers.iter() {
        if !is_forwarded_header(name.as_str()) {
            backend_req_builder = backend_req_builder.header(name, value);
        }
    }
    for (name, value) in forwarded_headers(parts.headers.get(HOST), scheme, remote_ip) {
        backend_req_builder = backend_req_builder.header(name, value);
    }

    let backend_req = backend_req_builder
        .body(Full::new(Bytes::new()))
        .map_err(|e| format!("Failed to build upgrade request: {e}"))?;

    let backend_resp = client.request(backend_req).await.map_err(|e| {
        warn!(backend = %backend_uri, error = %e, "Backend connection failed");
        format!("Backend connection failed: {e}")
    })?;

    if backend_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // Backend declined the upgrade; relay its answer as-is
        let (mut parts, body) = backend_resp.into_parts();
        let hop_by_hop: Vec<_> = parts
            .headers
            .keys()
            .filter(|name| is_hop_by_hop_header(name.as_str()))
            .cloned()
            .collect();
        for name in hop_by_hop {
            parts.headers.remove(name);
        }
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in backend_resp.headers().iter() {
        response = response.header(name, value);
    }

    // The client-side upgrade completes only after this response is
    // written, so the splice has to happen on its own task
    let mut client_req = Request::from_parts(parts, body);
    tokio::spawn(async move {
        let backend_upgraded = match hyper::upgrade::on(backend_resp).await {
            Ok(upgraded) => upgraded,
            Err(error) => {
                warn!(%error, "Backend upgrade failed");
                return;
            }
        };
        let client_upgraded = match hyper::upgrade::on(&mut client_req).await {
            Ok(upgraded) => upgraded,
            Err(error) => {
                warn!(%error, "Client upgrade failed");
                return;
            }
        };

        let mut backend_io = TokioIo::new(backend_upgraded);
        let mut client_io = TokioIo::new(client_upgraded);
        match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
            Ok((from_client, from_backend)) => {
                debug!(from_client, from_backend, "Upgraded connection closed");
            }
            Err(error) => debug!(%error, "Upgraded connection failed"),
        }
    });

    response
        .body(empty())
        .map_err(|e| format!("Failed to build upgrade response: {e}"))
}
