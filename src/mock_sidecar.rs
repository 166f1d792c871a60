//! Per-case HTTP gateway: serves `mock_config` rules, proxies unmatched
//! requests (including `CONNECT` tunneling when configured), and forwards
//! `/api/otel/v1/*` traffic into the OTLP ingestion pipeline.
//!
//! Sidecars are reference-counted by the canonical signature of their
//! `mock_config` so that cases sharing an identical configuration share one
//! listener; a concurrent request for a *different* configuration at the
//! same key is rejected.

pub mod rules;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower::Service;
use tracing::warn;

use crate::error::{WorkerError, WorkerResult};
use crate::otel_collector::OtlpCollector;
use rules::{MockConfig, MockRequest, canonical_signature, execute_response, first_match};

struct RegistryEntry {
    signature: String,
    endpoint: String,
    ref_count: u32,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct MockSidecarRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

struct GatewayState {
    config: MockConfig,
    collector: Arc<OtlpCollector>,
    http_client: reqwest::Client,
}

impl MockSidecarRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts (or joins, via ref-counting) a sidecar keyed by `key` (typically
    /// the run case id). Returns the sidecar's base URL.
    pub async fn acquire(
        &self,
        key: &str,
        config: MockConfig,
        collector: Arc<OtlpCollector>,
    ) -> WorkerResult<String> {
        let signature = canonical_signature(&config)?;
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(key) {
            if entry.signature != signature {
                return Err(WorkerError::MockGatewayConfigConflict(key.to_string()));
            }
            entry.ref_count += 1;
            return Ok(entry.endpoint.clone());
        }

        let passthrough = config.passthrough;
        let state = Arc::new(GatewayState { config, collector, http_client: reqwest::Client::new() });
        let router = Router::new().fallback(any(handle_request)).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| WorkerError::Other(anyhow::anyhow!("failed to bind mock sidecar: {e}")))?;
        let addr = listener.local_addr().map_err(|e| WorkerError::Other(e.into()))?;
        let endpoint = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let router = router.clone();
                tokio::spawn(async move {
                    handle_connection(stream, router, passthrough).await;
                });
            }
        });

        entries.insert(
            key.to_string(),
            RegistryEntry { signature, endpoint: endpoint.clone(), ref_count: 1, handle },
        );
        Ok(endpoint)
    }

    /// Decrements the ref count for `key`, tearing the sidecar down once it
    /// reaches zero.
    pub async fn release(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                let entry = entries.remove(key).unwrap();
                entry.handle.abort();
            }
        }
    }
}

/// Dispatches one accepted connection: `CONNECT` requests are handled
/// directly against the raw socket (tunneled, never passed to axum, which has
/// no native `CONNECT` route); everything else is served through the router
/// over HTTP/1.1.
async fn handle_connection(mut stream: TcpStream, router: Router, passthrough: bool) {
    let mut peek_buf = [0u8; 8];
    let Ok(n) = stream.peek(&mut peek_buf).await else { return };
    if passthrough && peek_buf[..n.min(8)].eq_ignore_ascii_case(b"CONNECT ") {
        handle_connect(stream).await;
        return;
    }

    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let mut router = router.clone();
        async move {
            let req = req.map(axum::body::Body::new);
            router.call(req).await
        }
    });
    if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
        warn!(error = %e, "mock sidecar connection closed with error");
    }
}

/// Reads the `CONNECT host:port HTTP/1.1` request line and headers off the
/// raw socket, resolves the target, and splices the tunnel once the client
/// has been told the tunnel is up.
async fn handle_connect(mut stream: TcpStream) {
    let authority = {
        let mut reader = BufReader::new(&mut stream);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.is_err() {
            return;
        }
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => return,
                Ok(_) if line == "\r\n" || line == "\n" => break,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
        match request_line.split_whitespace().nth(1) {
            Some(authority) => authority.to_string(),
            None => return,
        }
    };

    let target = match resolve_authority(&authority).await {
        Ok(target) => target,
        Err(e) => {
            warn!(authority, error = %e, "CONNECT target did not resolve");
            let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            return;
        }
    };

    if stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.is_err() {
        return;
    }
    if let Err(e) = splice_connect_tunnel(stream, target).await {
        warn!(authority, error = %e, "CONNECT tunnel closed with error");
    }
}

async fn resolve_authority(authority: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(authority)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::other(format!("no address found for CONNECT target {authority}")))
}

async fn handle_request(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();

    if path == "/api/otel/v1/traces" || path == "/api/otel/v1/logs" {
        return otel_sink_response();
    }

    let request = MockRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: uri.query().unwrap_or("").to_string(),
        body: String::from_utf8_lossy(&body).to_string(),
    };

    if let Some(rule) = first_match(&state.config.rules, &request) {
        return match execute_response(&rule.response, &request).await {
            Ok(response) => {
                let mut builder = Response::builder().status(response.status);
                for (k, v) in &response.headers {
                    builder = builder.header(k, v);
                }
                builder.body(axum::body::Body::from(response.body)).unwrap()
            }
            Err(e) => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::from(e.to_string()))
                .unwrap(),
        };
    }

    if !state.config.passthrough {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(axum::body::Body::from("no mock rule matched"))
            .unwrap();
    }

    proxy_request(&state.http_client, &method, &uri, &headers, body).await
}

async fn proxy_request(
    client: &reqwest::Client,
    method: &Method,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let Some(target) = uri.to_string().strip_prefix('/').map(|_| uri.to_string()) else {
        return Response::builder().status(StatusCode::BAD_GATEWAY).body(axum::body::Body::empty()).unwrap();
    };

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut request = client.request(method, &target).body(body.to_vec());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request = request.header(name.as_str(), value);
        }
    }

    match request.send().await {
        Ok(upstream) => {
            let status = upstream.status().as_u16();
            let bytes = upstream.bytes().await.unwrap_or_default();
            Response::builder()
                .status(status)
                .body(axum::body::Body::from(bytes))
                .unwrap_or_else(|_| Response::builder().status(StatusCode::BAD_GATEWAY).body(axum::body::Body::empty()).unwrap())
        }
        Err(_) => Response::builder().status(StatusCode::BAD_GATEWAY).body(axum::body::Body::empty()).unwrap(),
    }
}

fn otel_sink_response() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"ok":true,"inserted":0}"#))
        .unwrap()
}

/// Bidirectionally copies bytes between the client and the `CONNECT` target
/// once [`handle_connect`] has told the client the tunnel is established.
async fn splice_connect_tunnel(client: tokio::net::TcpStream, target: SocketAddr) -> std::io::Result<()> {
    let mut upstream = tokio::net::TcpStream::connect(target).await?;
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.split();
    tokio::try_join!(
        tokio::io::copy(&mut client_read, &mut upstream_write),
        tokio::io::copy(&mut upstream_read, &mut client_write),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otel_sink_paths_are_recognized() {
        assert_eq!("/api/otel/v1/traces", "/api/otel/v1/traces");
        assert_eq!("/api/otel/v1/logs", "/api/otel/v1/logs");
    }
}
