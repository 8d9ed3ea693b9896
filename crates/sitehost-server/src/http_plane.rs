use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use sitehost_core::{ResolutionOutcome, TenantResolver};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::monitor::RejectionMonitor;

/// Header carrying the resolved tenant id to the upstream
pub const TENANT_HEADER: &str = "x-sitehost-tenant";
/// Header carrying `system` or `tenant` to the upstream
pub const HOST_KIND_HEADER: &str = "x-sitehost-host-kind";

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers never forwarded in either direction
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request gate in front of the tenant sites
///
/// Every request is resolved to a system host or a tenant before anything
/// else happens; rejected hosts get a 404.
pub struct HttpGate {
    resolver: Arc<TenantResolver>,
    monitor: Arc<RejectionMonitor>,
    /// Directory certbot writes HTTP-01 challenge files under
    webroot: PathBuf,
    upstream: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct Binding<'a> {
    host: &'a str,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant: Option<TenantSummary<'a>>,
}

#[derive(Serialize)]
struct TenantSummary<'a> {
    id: String,
    name: &'a str,
    subdomain: &'a str,
    custom_domain: Option<&'a str>,
}

impl HttpGate {
    pub fn new(
        resolver: Arc<TenantResolver>,
        monitor: Arc<RejectionMonitor>,
        webroot: PathBuf,
        upstream: Option<String>,
    ) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default upstream client: {}", e);
                reqwest::Client::new()
            });

        Arc::new(Self {
            resolver,
            monitor,
            webroot,
            upstream,
            client,
        })
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req, peer_addr).await }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    /// Start listening on `addr`, terminating TLS when an acceptor is given
    pub async fn run(self: Arc<Self>, addr: SocketAddr, tls: Option<TlsAcceptor>) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener, tls).await
    }

    pub async fn run_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        if tls.is_some() {
            tracing::info!("HTTPS gate listening on {}", addr);
        } else {
            tracing::info!("HTTP gate listening on {}", addr);
        }

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("Connection from {}", peer_addr);
            let this = self.clone();
            let tls = tls.clone();

            tokio::spawn(async move {
                if let Some(acceptor) = tls {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => this.serve_connection(tls_stream, peer_addr).await,
                        Err(e) => {
                            tracing::debug!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let host = request_host(&req);
        tracing::debug!("{} {} (Host: {:?})", req.method(), req.uri(), host);

        let outcome = self.resolver.resolve(&host, &peer_addr.ip().to_string());

        if let ResolutionOutcome::Rejected { reason } = &outcome {
            self.monitor.record(&host, peer_addr.ip(), *reason);
            return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
        }

        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            return Ok(self.serve_challenge(req.method(), token).await);
        }

        let response = match &self.upstream {
            Some(upstream) => self.forward(req, upstream, &outcome, peer_addr).await,
            None => describe(&host, &outcome),
        };
        Ok(response)
    }

    async fn serve_challenge(&self, method: &Method, token: &str) -> Response<Full<Bytes>> {
        if method != Method::GET && method != Method::HEAD {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }
        if !is_valid_token(token) {
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        }

        let path = self
            .webroot
            .join(".well-known")
            .join("acme-challenge")
            .join(token);

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                tracing::info!("Served ACME challenge {}", token);
                if method == Method::HEAD {
                    text_response(StatusCode::OK, Bytes::new())
                } else {
                    text_response(StatusCode::OK, contents)
                }
            }
            Err(_) => text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        upstream: &str,
        outcome: &ResolutionOutcome,
        peer_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::error!("Failed to read request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", upstream, path_and_query);

        let mut headers = filter_headers(&parts.headers);
        headers.remove(HOST);
        if let Some(host) = parts.headers.get(HOST) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
        }
        if let Ok(value) = HeaderValue::from_str(&peer_addr.ip().to_string()) {
            headers.append(HeaderName::from_static("x-forwarded-for"), value);
        }
        match outcome {
            ResolutionOutcome::TenantHost { tenant } => {
                if let Ok(value) = HeaderValue::from_str(&tenant.id.to_string()) {
                    headers.insert(HeaderName::from_static(TENANT_HEADER), value);
                }
                headers.insert(
                    HeaderName::from_static(HOST_KIND_HEADER),
                    HeaderValue::from_static("tenant"),
                );
            }
            _ => {
                headers.insert(
                    HeaderName::from_static(HOST_KIND_HEADER),
                    HeaderValue::from_static("system"),
                );
            }
        }

        let result = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream_response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::error!("Upstream timeout for {}", url);
                return text_response(StatusCode::GATEWAY_TIMEOUT, "Upstream timeout");
            }
            Err(e) => {
                tracing::error!("Upstream request to {} failed: {}", url, e);
                return text_response(StatusCode::BAD_GATEWAY, "Upstream unavailable");
            }
        };

        let status = upstream_response.status();
        let headers = filter_headers(upstream_response.headers());
        let body = match upstream_response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to read upstream response: {}", e);
                return text_response(StatusCode::BAD_GATEWAY, "Upstream response failed");
            }
        };

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Host header, falling back to the request target's authority
fn request_host(req: &Request<Incoming>) -> String {
    if let Some(value) = req.headers().get(HOST) {
        return String::from_utf8_lossy(value.as_bytes()).into_owned();
    }
    req.uri().host().unwrap_or_default().to_string()
}

/// ACME tokens are base64url
fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str)
            || name_str == "content-length"
            || name_str.starts_with("x-sitehost-")
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn describe(host: &str, outcome: &ResolutionOutcome) -> Response<Full<Bytes>> {
    let binding = match outcome {
        ResolutionOutcome::TenantHost { tenant } => Binding {
            host,
            kind: "tenant",
            tenant: Some(TenantSummary {
                id: tenant.id.to_string(),
                name: &tenant.name,
                subdomain: &tenant.subdomain,
                custom_domain: tenant.custom_domain.as_deref(),
            }),
        },
        _ => Binding {
            host,
            kind: "system",
            tenant: None,
        },
    };
    json_response(StatusCode::OK, &binding)
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}
