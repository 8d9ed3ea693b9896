//! End-to-end test utilities for sitehost
//!
//! Starts the gate, the control plane and the certificate worker in-process
//! with scripted DNS and ACME so the whole lifecycle runs without certbot or
//! real DNS.

pub mod certificates;
pub mod harness;
pub mod mock_acme;
pub mod mock_dns;
pub mod mock_notifier;
pub mod mock_upstream;

pub use certificates::TestCertificate;
pub use harness::{wait_for, TestServer, TestServerOptions};
pub use mock_acme::MockAcmeClient;
pub use mock_dns::MockDnsVerifier;
pub use mock_notifier::{CountingReloader, RecordingNotifier};
pub use mock_upstream::{MockUpstream, RecordedRequest};

/// Initialize tracing and the crypto provider for tests
pub fn init_test() {
    // Ignore the error when another test installed it first
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("sitehost_server=debug,sitehost_core=debug,sitehost_e2e=debug")
        .with_test_writer()
        .try_init();
}
