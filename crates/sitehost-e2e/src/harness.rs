//! Test server harness for E2E tests
//!
//! Runs the HTTP gate, the HTTPS gate, the control plane and the job
//! dispatcher on ephemeral ports with scripted DNS and ACME. Lifecycle
//! delays are scaled down to milliseconds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sitehost_common::CertificateStore;
use sitehost_core::{ResolverConfig, Tenant, TenantRegistry, TenantResolver};
use sitehost_server::{
    CertificateWorker, ControlPlane, DomainScheduler, FrontendReloader, HttpGate,
    JsonFileRegistry, MemoryQueue, RejectionMonitor, ReloadChain, StoreReloader, TaskQueue,
    WorkerSettings,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::mock_acme::MockAcmeClient;
use crate::mock_dns::MockDnsVerifier;
use crate::mock_notifier::{CountingReloader, RecordingNotifier};

pub const BASE_DOMAIN: &str = "sites.test";
pub const CONTACT_EMAIL: &str = "ops@sites.test";

/// Knobs for a test server
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    pub dns_check_offsets: Vec<Duration>,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub invalid_host_threshold: u32,
    /// Forward resolved requests here instead of answering with JSON
    pub upstream: Option<String>,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            dns_check_offsets: [20, 100, 200, 400]
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            retry_count: 3,
            retry_backoff: Duration::from_millis(50),
            invalid_host_threshold: 20,
            upstream: None,
        }
    }
}

/// A running test server instance
pub struct TestServer {
    /// Plain HTTP gate
    pub http_addr: SocketAddr,
    /// TLS gate using the certificate store
    pub https_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub base_domain: String,
    pub registry: Arc<JsonFileRegistry>,
    pub store: Arc<CertificateStore>,
    pub worker: Arc<CertificateWorker>,
    pub queue: Arc<dyn TaskQueue>,
    pub dns: Arc<MockDnsVerifier>,
    pub acme: Arc<MockAcmeClient>,
    pub notifier: Arc<RecordingNotifier>,
    pub reloads: Arc<CountingReloader>,
    dir: TempDir,
    tasks: Vec<JoinHandle<()>>,
}

impl TestServer {
    /// Start a test server with default options
    pub async fn start() -> Self {
        Self::start_with(TestServerOptions::default()).await
    }

    pub async fn start_with(options: TestServerOptions) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let live_dir = dir.path().join("live");
        let webroot = dir.path().join("webroot");
        std::fs::create_dir_all(&live_dir).unwrap();
        std::fs::create_dir_all(&webroot).unwrap();

        let registry = Arc::new(
            JsonFileRegistry::open(dir.path().join("tenants.json"))
                .expect("Failed to open registry"),
        );

        let mut resolver_config = ResolverConfig::new(BASE_DOMAIN);
        resolver_config.extra_system_hosts.push("127.0.0.1".to_string());
        let resolver = Arc::new(TenantResolver::new(registry.clone(), resolver_config));

        let notifier = RecordingNotifier::new();
        let monitor = Arc::new(RejectionMonitor::new(
            notifier.clone(),
            options.invalid_host_threshold,
            Duration::from_secs(600),
        ));

        let store = Arc::new(CertificateStore::new(&live_dir));
        let reloads = CountingReloader::new();
        let reloaders: Vec<Arc<dyn FrontendReloader>> = vec![
            Arc::new(StoreReloader::new(store.clone())),
            reloads.clone(),
        ];
        let reloader: Arc<dyn FrontendReloader> = Arc::new(ReloadChain::new(reloaders));

        let dns = MockDnsVerifier::new();
        let acme = MockAcmeClient::new(&live_dir);

        let (queue, dispatcher) = MemoryQueue::new(2);
        let queue: Arc<dyn TaskQueue> = Arc::new(queue);

        let worker = Arc::new(CertificateWorker::new(
            registry.clone(),
            queue.clone(),
            dns.clone(),
            acme.clone(),
            notifier.clone(),
            reloader,
            WorkerSettings {
                base_domain: BASE_DOMAIN.to_string(),
                default_contact_email: CONTACT_EMAIL.to_string(),
                retry_count: options.retry_count,
                retry_backoff: options.retry_backoff,
            },
        ));

        let scheduler = Arc::new(DomainScheduler::new(
            registry.clone(),
            resolver.clone(),
            queue.clone(),
            options.dns_check_offsets.clone(),
        ));

        let gate = HttpGate::new(resolver.clone(), monitor, webroot, options.upstream.clone());
        let control_plane =
            ControlPlane::new(registry.clone(), resolver, scheduler, queue.clone());

        // Bind to ephemeral ports
        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP gate");
        let https_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTPS gate");
        let control_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control plane");

        let http_addr = http_listener.local_addr().unwrap();
        let https_addr = https_listener.local_addr().unwrap();
        let control_addr = control_listener.local_addr().unwrap();

        let acceptor = TlsAcceptor::from(Arc::new(store.server_config()));

        let mut tasks = Vec::new();

        let http_gate = gate.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http_gate.run_with_listener(http_listener, None).await {
                tracing::error!("HTTP gate error: {}", e);
            }
        }));

        tasks.push(tokio::spawn(async move {
            if let Err(e) = gate.run_with_listener(https_listener, Some(acceptor)).await {
                tracing::error!("HTTPS gate error: {}", e);
            }
        }));

        tasks.push(tokio::spawn(async move {
            if let Err(e) = control_plane.run_with_listener(control_listener).await {
                tracing::error!("Control plane error: {}", e);
            }
        }));

        let handler = worker.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.run(handler).await;
        }));

        // Give the servers a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            http_addr,
            https_addr,
            control_addr,
            base_domain: BASE_DOMAIN.to_string(),
            registry,
            store,
            worker,
            queue,
            dns,
            acme,
            notifier,
            reloads,
            dir,
            tasks,
        }
    }

    /// Host header value for a tenant subdomain
    pub fn host_for(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.base_domain)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    pub fn control_url(&self, path: &str) -> String {
        format!("http://{}{}", self.control_addr, path)
    }

    pub fn webroot(&self) -> std::path::PathBuf {
        self.dir.path().join("webroot")
    }

    pub fn live_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("live")
    }

    /// Place an HTTP-01 challenge file where certbot's webroot mode would
    pub fn write_challenge(&self, token: &str, contents: &str) {
        let dir = self.webroot().join(".well-known").join("acme-challenge");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(token), contents).unwrap();
    }

    /// Tenant as currently stored
    pub fn tenant(&self, subdomain: &str) -> Tenant {
        self.registry
            .find_by_subdomain(subdomain, false)
            .expect("Registry lookup failed")
            .into_iter()
            .next()
            .expect("Tenant not found")
    }

    /// Create a tenant through the control plane
    pub async fn create_tenant(
        &self,
        subdomain: &str,
        custom_domain: Option<&str>,
    ) -> reqwest::Response {
        reqwest::Client::new()
            .post(self.control_url("/tenants"))
            .json(&serde_json::json!({
                "name": format!("Site {}", subdomain),
                "subdomain": subdomain,
                "custom_domain": custom_domain,
            }))
            .send()
            .await
            .expect("Control plane request failed")
    }

    /// TLS handshake against the HTTPS gate; returns the presented leaf
    /// certificate and the HTTP status line of a `GET /`
    pub async fn https_get(&self, server_name: &str) -> (CertificateDer<'static>, String) {
        let verifier = Arc::new(CapturingVerifier::new());
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let stream = TcpStream::connect(self.https_addr)
            .await
            .expect("Failed to connect to HTTPS gate");
        let name = ServerName::try_from(server_name.to_string()).expect("Invalid server name");
        let mut tls = connector
            .connect(name, stream)
            .await
            .expect("TLS handshake failed");

        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            server_name
        );
        tls.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let _ = tls.read_to_end(&mut response).await;
        let response = String::from_utf8_lossy(&response);
        let status_line = response.lines().next().unwrap_or_default().to_string();

        let leaf = verifier.seen().expect("No certificate presented");
        (leaf, status_line)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Accepts any server certificate and remembers the leaf
#[derive(Debug)]
struct CapturingVerifier {
    provider: Arc<CryptoProvider>,
    seen: Mutex<Option<CertificateDer<'static>>>,
}

impl CapturingVerifier {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            seen: Mutex::new(None),
        }
    }

    fn seen(&self) -> Option<CertificateDer<'static>> {
        self.seen.lock().clone()
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        *self.seen.lock() = Some(end_entity.clone().into_owned());
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
