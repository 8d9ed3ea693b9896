//! Scripted DNS verification

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sitehost_server::{DnsCheckError, DnsVerifier};

/// DNS verifier whose answer per domain is set by the test
///
/// Domains not marked as propagated fail with `NotFound`.
pub struct MockDnsVerifier {
    propagated: RwLock<Vec<String>>,
    checks: AtomicUsize,
}

impl MockDnsVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            propagated: RwLock::new(Vec::new()),
            checks: AtomicUsize::new(0),
        })
    }

    /// Make `domain` resolve to the server from now on
    pub fn propagate(&self, domain: &str) {
        self.propagated.write().push(domain.to_string());
    }

    /// Make `domain` stop resolving to the server
    pub fn withdraw(&self, domain: &str) {
        self.propagated.write().retain(|d| d != domain);
    }

    /// Number of verifications performed so far
    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsVerifier for MockDnsVerifier {
    async fn verify(&self, domain: &str) -> Result<(), DnsCheckError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.propagated.read().iter().any(|d| d == domain) {
            Ok(())
        } else {
            Err(DnsCheckError::NotFound {
                domain: domain.to_string(),
            })
        }
    }
}
