//! Scripted ACME client

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sitehost_server::{AcmeClient, AcmeError, RenewReport};

use crate::certificates::TestCertificate;

/// ACME client that records requests and issues self-signed certificates
///
/// Successful issuance writes a certificate into the live directory so the
/// certificate store picks it up on reload.
pub struct MockAcmeClient {
    live_dir: PathBuf,
    /// Remaining issuance attempts that fail before one succeeds
    failures_left: AtomicU32,
    issued: RwLock<Vec<(String, String)>>,
    attempts: AtomicUsize,
    renew_report: RwLock<RenewReport>,
    renew_all_calls: AtomicUsize,
    renewed: RwLock<Vec<String>>,
}

impl MockAcmeClient {
    pub fn new(live_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            live_dir: live_dir.into(),
            failures_left: AtomicU32::new(0),
            issued: RwLock::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            renew_report: RwLock::new(RenewReport::default()),
            renew_all_calls: AtomicUsize::new(0),
            renewed: RwLock::new(Vec::new()),
        })
    }

    /// Fail the next `count` issuance attempts
    pub fn fail_next_issues(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Report returned by the next bulk renewals
    pub fn set_renew_report(&self, report: RenewReport) {
        *self.renew_report.write() = report;
    }

    /// Successful issuances as `(domain, contact_email)`
    pub fn issued(&self) -> Vec<(String, String)> {
        self.issued.read().clone()
    }

    /// Issuance attempts, failed ones included
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Domains passed to single-certificate renewals
    pub fn renewed(&self) -> Vec<String> {
        self.renewed.read().clone()
    }

    pub fn renew_all_count(&self) -> usize {
        self.renew_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcmeClient for MockAcmeClient {
    async fn issue(&self, domain: &str, contact_email: &str) -> Result<String, AcmeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AcmeError::Failed(format!(
                "Challenge failed for domain {}",
                domain
            )));
        }

        TestCertificate::for_domain(domain).write_live(&self.live_dir, domain)?;
        self.issued
            .write()
            .push((domain.to_string(), contact_email.to_string()));
        Ok(format!("Certificate obtained for {} and www.{}", domain, domain))
    }

    async fn renew(&self, domain: &str) -> Result<String, AcmeError> {
        self.renewed.write().push(domain.to_string());
        Ok(format!("Certificate for {} not yet due for renewal", domain))
    }

    async fn renew_all(&self) -> Result<RenewReport, AcmeError> {
        self.renew_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.renew_report.read().clone())
    }
}
