//! Certificate lifecycle worker
//!
//! Handles every job kind. Handlers re-read the tenant before acting and
//! write status changes conditionally, so redelivered and superseded jobs
//! are no-ops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sitehost_core::{
    transition, DnsStatus, Expected, Job, LifecycleEvent, RegistryError, SslStatus, Tenant,
    TenantId, TenantRegistry, UpdateOutcome,
};

use crate::acme::{AcmeClient, AcmeError, RenewReport};
use crate::dns::DnsVerifier;
use crate::notifier::Notifier;
use crate::queue::{JobHandler, TaskQueue};
use crate::reload::FrontendReloader;

/// Tunables for the worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Hosts under this domain are covered by the platform wildcard certificate
    pub base_domain: String,
    /// ACME contact used when a tenant has none
    pub default_contact_email: String,
    /// Total issuance attempts, including the first
    pub retry_count: u32,
    pub retry_backoff: Duration,
}

pub struct CertificateWorker {
    registry: Arc<dyn TenantRegistry>,
    queue: Arc<dyn TaskQueue>,
    dns: Arc<dyn DnsVerifier>,
    acme: Arc<dyn AcmeClient>,
    notifier: Arc<dyn Notifier>,
    reloader: Arc<dyn FrontendReloader>,
    settings: WorkerSettings,
}

impl CertificateWorker {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        queue: Arc<dyn TaskQueue>,
        dns: Arc<dyn DnsVerifier>,
        acme: Arc<dyn AcmeClient>,
        notifier: Arc<dyn Notifier>,
        reloader: Arc<dyn FrontendReloader>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            dns,
            acme,
            notifier,
            reloader,
            settings,
        }
    }

    /// Load the tenant for a job, or `None` if the job no longer applies
    fn current_tenant(&self, tenant_id: TenantId, domain: &str) -> anyhow::Result<Option<Tenant>> {
        let tenant = match self.registry.get(tenant_id) {
            Ok(tenant) => tenant,
            Err(RegistryError::NotFound(_)) => {
                tracing::info!("Tenant {} is gone, dropping job for {}", tenant_id, domain);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if !tenant.has_custom_domain(domain) {
            tracing::debug!(
                "Tenant {} no longer uses {}, dropping job",
                tenant_id,
                domain
            );
            return Ok(None);
        }
        Ok(Some(tenant))
    }

    /// Run `event` through the state machine and write the result
    ///
    /// Returns the updated tenant, or `None` when the event was not valid
    /// from the current state or the write lost a race.
    fn apply(
        &self,
        tenant: &Tenant,
        expected: &Expected,
        event: LifecycleEvent,
    ) -> Result<Option<Tenant>, RegistryError> {
        let domain = tenant.custom_domain.as_deref().unwrap_or("-");

        let update = match transition(&tenant.certificate, &event) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!("Dropping event for {}: {}", domain, e);
                return Ok(None);
            }
        };
        if update.is_empty() {
            return Ok(Some(tenant.clone()));
        }

        match self.registry.update_status(tenant.id, expected, &update)? {
            UpdateOutcome::Applied(updated) => {
                tracing::info!(
                    "{} for {}: dns={} ssl={}",
                    event.name(),
                    domain,
                    updated.dns_status(),
                    updated.ssl_status()
                );
                Ok(Some(updated))
            }
            UpdateOutcome::Stale => {
                tracing::debug!("Discarding stale {} for {}", event.name(), domain);
                Ok(None)
            }
        }
    }

    fn in_flight(domain: &str) -> Expected {
        Expected {
            ssl_status: Some(SslStatus::Generating),
            ..Expected::domain(domain)
        }
    }

    fn is_covered_by_wildcard(&self, domain: &str) -> bool {
        let base = self.settings.base_domain.as_str();
        domain == base
            || domain
                .strip_suffix(base)
                .is_some_and(|prefix| prefix.ends_with('.'))
    }

    async fn reload_frontend(&self) {
        if let Err(e) = self.reloader.reload().await {
            tracing::error!("Failed to reload front end: {}", e);
        }
    }

    async fn dns_check(&self, tenant_id: TenantId, domain: &str) -> anyhow::Result<()> {
        let Some(tenant) = self.current_tenant(tenant_id, domain)? else {
            return Ok(());
        };
        if tenant.dns_status() == DnsStatus::Ok {
            tracing::debug!("DNS for {} already verified", domain);
            return Ok(());
        }

        tracing::info!("Checking DNS for {}", domain);
        match self.dns.verify(domain).await {
            Ok(()) => {
                let expected = Expected::snapshot(&tenant);
                let Some(updated) = self.apply(&tenant, &expected, LifecycleEvent::DnsVerified)?
                else {
                    return Ok(());
                };

                if updated.ssl_status() == SslStatus::Generating {
                    let contact_email = updated
                        .contact_email
                        .clone()
                        .unwrap_or_else(|| self.settings.default_contact_email.clone());
                    self.queue
                        .enqueue(
                            Job::Issue {
                                tenant_id,
                                domain: domain.to_string(),
                                contact_email,
                                attempt: 1,
                            },
                            Duration::ZERO,
                        )
                        .await?;
                }
            }
            Err(e) => {
                tracing::warn!("DNS check failed for {}: {}", domain, e);
                self.apply(
                    &tenant,
                    &Expected::domain(domain),
                    LifecycleEvent::DnsFailed {
                        message: e.to_string(),
                    },
                )?;
            }
        }
        Ok(())
    }

    async fn issue(
        &self,
        tenant_id: TenantId,
        domain: &str,
        contact_email: &str,
        attempt: u32,
    ) -> anyhow::Result<()> {
        let Some(tenant) = self.current_tenant(tenant_id, domain)? else {
            return Ok(());
        };
        if tenant.dns_status() != DnsStatus::Ok {
            tracing::warn!("Skipping issuance for {}: DNS not verified", domain);
            return Ok(());
        }
        if tenant.ssl_status() == SslStatus::Active {
            tracing::debug!("Certificate for {} already active", domain);
            return Ok(());
        }

        let Some(tenant) = self.apply(
            &tenant,
            &Expected::snapshot(&tenant),
            LifecycleEvent::IssuanceStarted,
        )?
        else {
            return Ok(());
        };

        if self.is_covered_by_wildcard(domain) {
            tracing::info!("{} is covered by the wildcard certificate", domain);
            self.apply(
                &tenant,
                &Self::in_flight(domain),
                LifecycleEvent::IssuanceSucceeded,
            )?;
            return Ok(());
        }

        tracing::info!(
            "Issuing certificate for {} (attempt {}/{})",
            domain,
            attempt,
            self.settings.retry_count
        );

        match self.acme.issue(domain, contact_email).await {
            Ok(message) => {
                let applied = self.apply(
                    &tenant,
                    &Self::in_flight(domain),
                    LifecycleEvent::IssuanceSucceeded,
                )?;
                if applied.is_none() {
                    tracing::info!(
                        "Certificate for {} issued but the tenant moved on, not announcing it",
                        domain
                    );
                    return Ok(());
                }
                self.reload_frontend().await;
                self.notifier
                    .notify(
                        &format!("Certificate issued: {}", domain),
                        &format!(
                            "{}\n\nSite: {}\nContact: {}",
                            message, tenant.name, contact_email
                        ),
                    )
                    .await;
            }
            Err(e) => self.issuance_failed(&tenant, domain, contact_email, attempt, e).await?,
        }
        Ok(())
    }

    async fn issuance_failed(
        &self,
        tenant: &Tenant,
        domain: &str,
        contact_email: &str,
        attempt: u32,
        error: AcmeError,
    ) -> anyhow::Result<()> {
        let message = error.to_string();
        self.apply(
            tenant,
            &Self::in_flight(domain),
            LifecycleEvent::IssuanceFailed {
                message: message.clone(),
            },
        )?;

        if attempt < self.settings.retry_count {
            tracing::warn!(
                "Issuance attempt {} for {} failed, retrying in {}s: {}",
                attempt,
                domain,
                self.settings.retry_backoff.as_secs(),
                message
            );
            self.queue
                .enqueue(
                    Job::Issue {
                        tenant_id: tenant.id,
                        domain: domain.to_string(),
                        contact_email: contact_email.to_string(),
                        attempt: attempt + 1,
                    },
                    self.settings.retry_backoff,
                )
                .await?;
            return Ok(());
        }

        tracing::error!(
            "Giving up on certificate for {} after {} attempts: {}",
            domain,
            attempt,
            message
        );
        self.notifier
            .notify(
                &format!("Certificate issuance failed: {}", domain),
                &format!(
                    "Could not obtain a certificate for {} after {} attempts.\n\n{}\n\nSite: {}",
                    domain, attempt, message, tenant.name
                ),
            )
            .await;
        Ok(())
    }

    async fn renew(&self, tenant_id: TenantId, domain: &str) -> anyhow::Result<()> {
        let Some(tenant) = self.current_tenant(tenant_id, domain)? else {
            return Ok(());
        };
        if tenant.ssl_status() != SslStatus::Active {
            tracing::debug!("No active certificate to renew for {}", domain);
            return Ok(());
        }

        match self.acme.renew(domain).await {
            Ok(message) => {
                tracing::info!("{}: {}", domain, message);
                self.reload_frontend().await;
            }
            Err(e) => {
                tracing::error!("Renewal failed for {}: {}", domain, e);
                self.renewal_failed(&tenant, &e.to_string())?;
                self.notifier
                    .notify(
                        &format!("Certificate renewal failed: {}", domain),
                        &e.to_string(),
                    )
                    .await;
            }
        }
        Ok(())
    }

    fn renewal_failed(&self, tenant: &Tenant, message: &str) -> Result<(), RegistryError> {
        let Some(domain) = tenant.custom_domain.as_deref() else {
            return Ok(());
        };
        let expected = Expected {
            ssl_status: Some(SslStatus::Active),
            ..Expected::domain(domain)
        };
        self.apply(
            tenant,
            &expected,
            LifecycleEvent::RenewalFailed {
                message: message.to_string(),
            },
        )?;
        Ok(())
    }

    /// Renew every due certificate in one certbot run
    ///
    /// Tenants whose certificate failed to renew move to `error`; the front
    /// end is reloaded only when something was renewed.
    pub async fn renew_all(&self) -> Result<RenewReport, AcmeError> {
        let report = match self.acme.renew_all().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Bulk certificate renewal failed: {}", e);
                self.notifier
                    .notify(
                        "Certificate renewal failed",
                        &format!("Bulk certificate renewal failed:\n\n{}", e),
                    )
                    .await;
                return Err(e);
            }
        };

        for name in &report.failed {
            let tenants = match self.registry.find_by_custom_domain(name, false) {
                Ok(tenants) => tenants,
                Err(e) => {
                    tracing::error!("Could not look up tenant for {}: {}", name, e);
                    continue;
                }
            };
            for tenant in tenants
                .iter()
                .filter(|t| t.ssl_status() == SslStatus::Active)
            {
                if let Err(e) =
                    self.renewal_failed(tenant, &format!("Certificate renewal failed for {}", name))
                {
                    tracing::error!("Could not record renewal failure for {}: {}", name, e);
                }
            }
        }

        if report.renewed_count() > 0 {
            self.reload_frontend().await;
        }

        if !report.is_empty() {
            let mut body = format!(
                "{} certificate(s) renewed, {} failed.",
                report.renewed_count(),
                report.failed_count()
            );
            if !report.failed.is_empty() {
                body.push_str(&format!("\n\nFailed: {}", report.failed.join(", ")));
            }
            self.notifier.notify("Certificate renewal", &body).await;
        }

        Ok(report)
    }

    /// Queue a first issuance attempt for every certificate left `generating`
    ///
    /// Queued jobs do not outlive the process, so issuance that was queued or
    /// running when the previous run stopped is picked up here. Call once at
    /// startup, before the dispatcher runs.
    pub async fn resume_interrupted(&self) -> anyhow::Result<usize> {
        let mut queued = 0;
        for tenant in self.registry.list()? {
            let Some(domain) = tenant.custom_domain.clone() else {
                continue;
            };
            if tenant.dns_status() != DnsStatus::Ok || tenant.ssl_status() != SslStatus::Generating
            {
                continue;
            }
            let contact_email = tenant
                .contact_email
                .clone()
                .unwrap_or_else(|| self.settings.default_contact_email.clone());
            self.queue
                .enqueue(
                    Job::Issue {
                        tenant_id: tenant.id,
                        domain,
                        contact_email,
                        attempt: 1,
                    },
                    Duration::ZERO,
                )
                .await?;
            queued += 1;
        }
        tracing::info!("Resumed {} interrupted issuance(s)", queued);
        Ok(queued)
    }

    /// Queue an immediate DNS check for every domain not yet verified
    pub async fn sweep_pending(&self) -> anyhow::Result<usize> {
        let mut queued = 0;
        for tenant in self.registry.list()? {
            let Some(domain) = tenant.custom_domain.clone() else {
                continue;
            };
            if matches!(tenant.dns_status(), DnsStatus::Pending | DnsStatus::Error) {
                self.queue
                    .enqueue(
                        Job::DnsCheck {
                            tenant_id: tenant.id,
                            domain,
                        },
                        Duration::ZERO,
                    )
                    .await?;
                queued += 1;
            }
        }
        tracing::info!("Pending domain sweep queued {} check(s)", queued);
        Ok(queued)
    }
}

#[async_trait]
impl JobHandler for CertificateWorker {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::DnsCheck { tenant_id, domain } => self.dns_check(tenant_id, &domain).await,
            Job::Issue {
                tenant_id,
                domain,
                contact_email,
                attempt,
            } => self.issue(tenant_id, &domain, &contact_email, attempt).await,
            Job::Renew { tenant_id, domain } => self.renew(tenant_id, &domain).await,
            Job::RenewAll => {
                if let Err(e) = self.renew_all().await {
                    tracing::warn!("Scheduled renewal did not complete: {}", e);
                }
                Ok(())
            }
            Job::SweepPending => self.sweep_pending().await.map(|_| ()),
        }
    }
}
