//! Custom-domain changes and periodic certificate jobs

use std::sync::Arc;
use std::time::Duration;

use sitehost_core::{
    normalize_custom_domain, DomainChange, FieldError, Job, RegistryError, TenantId,
    TenantRegistry, TenantResolver,
};
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::queue::{QueueError, TaskQueue};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Invalid(#[from] FieldError),

    #[error("{0} is reserved by the platform")]
    SystemHost(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Writes custom domains and schedules their verification
pub struct DomainScheduler {
    registry: Arc<dyn TenantRegistry>,
    resolver: Arc<TenantResolver>,
    queue: Arc<dyn TaskQueue>,
    offsets: Vec<Duration>,
}

impl DomainScheduler {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        resolver: Arc<TenantResolver>,
        queue: Arc<dyn TaskQueue>,
        offsets: Vec<Duration>,
    ) -> Self {
        Self {
            registry,
            resolver,
            queue,
            offsets,
        }
    }

    /// Normalize a custom domain and refuse the platform's own hosts
    pub fn check_domain(&self, raw: Option<&str>) -> Result<Option<String>, ScheduleError> {
        let domain = normalize_custom_domain(raw)?;
        if let Some(domain) = &domain {
            if self.resolver.is_system_host(domain) {
                return Err(ScheduleError::SystemHost(domain.clone()));
            }
        }
        Ok(domain)
    }

    /// Set or clear a tenant's custom domain
    ///
    /// When the stored value changes the status pair is reset and, for a
    /// non-empty domain, one DNS check is queued per offset. Writing the
    /// same value again schedules nothing.
    pub async fn set_custom_domain(
        &self,
        tenant_id: TenantId,
        raw: Option<&str>,
    ) -> Result<DomainChange, ScheduleError> {
        let domain = self.check_domain(raw)?;
        let change = self.registry.set_custom_domain(tenant_id, domain)?;
        if !change.changed {
            return Ok(change);
        }

        match &change.tenant.custom_domain {
            Some(domain) => {
                tracing::info!(
                    "Custom domain for tenant {} changed from {:?} to {}",
                    tenant_id,
                    change.previous,
                    domain
                );
                self.schedule_checks(tenant_id, domain).await?;
            }
            None => {
                tracing::info!(
                    "Custom domain {:?} removed from tenant {}",
                    change.previous,
                    tenant_id
                );
            }
        }
        Ok(change)
    }

    /// Queue the DNS propagation checks for `domain`
    pub async fn schedule_checks(
        &self,
        tenant_id: TenantId,
        domain: &str,
    ) -> Result<(), QueueError> {
        for offset in &self.offsets {
            self.queue
                .enqueue(
                    Job::DnsCheck {
                        tenant_id,
                        domain: domain.to_string(),
                    },
                    *offset,
                )
                .await?;
        }
        Ok(())
    }
}

/// Shortest period accepted by [`run_periodic`]
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Periodically queue bulk renewal and the pending-domain sweep
///
/// The first run of each happens one period after startup. Periods are
/// floored at one second.
pub async fn run_periodic(
    queue: Arc<dyn TaskQueue>,
    renewal_interval: Duration,
    sweep_interval: Duration,
) {
    let renewal_interval = renewal_interval.max(MIN_PERIOD);
    let sweep_interval = sweep_interval.max(MIN_PERIOD);
    let mut renewal = interval_at(Instant::now() + renewal_interval, renewal_interval);
    renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "Certificate renewal every {}h, pending sweep every {}m",
        renewal_interval.as_secs() / 3600,
        sweep_interval.as_secs() / 60
    );

    loop {
        let job = tokio::select! {
            _ = renewal.tick() => Job::RenewAll,
            _ = sweep.tick() => Job::SweepPending,
        };
        if let Err(e) = queue.enqueue(job, Duration::ZERO).await {
            tracing::error!("Periodic scheduler stopping: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RecordingQueue;
    use sitehost_core::{DnsStatus, InMemoryRegistry, ResolverConfig, SslStatus, Tenant};

    const OFFSETS: [u64; 4] = [5, 30, 60, 120];

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        queue: Arc<RecordingQueue>,
        scheduler: DomainScheduler,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let queue = Arc::new(RecordingQueue::new());
        let resolver = Arc::new(TenantResolver::new(
            registry.clone(),
            ResolverConfig::new("sites.test"),
        ));
        let scheduler = DomainScheduler::new(
            registry.clone(),
            resolver,
            queue.clone(),
            OFFSETS.iter().map(|m| Duration::from_secs(m * 60)).collect(),
        );
        Fixture {
            registry,
            queue,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_new_domain_schedules_four_checks() {
        let f = fixture();
        let tenant = f.registry.insert(Tenant::new("Shop", "shop")).unwrap();

        let change = f
            .scheduler
            .set_custom_domain(tenant.id, Some("New.Test"))
            .await
            .unwrap();
        assert!(change.changed);
        assert_eq!(change.tenant.custom_domain.as_deref(), Some("new.test"));
        assert_eq!(change.tenant.dns_status(), DnsStatus::Pending);
        assert_eq!(change.tenant.ssl_status(), SslStatus::None);

        let jobs = f.queue.jobs();
        let delays: Vec<u64> = jobs.iter().map(|(_, d)| d.as_secs() / 60).collect();
        assert_eq!(delays, OFFSETS.to_vec());
        assert!(jobs
            .iter()
            .all(|(j, _)| matches!(j, Job::DnsCheck { domain, .. } if domain == "new.test")));
    }

    #[tokio::test]
    async fn test_same_domain_schedules_nothing() {
        let f = fixture();
        let tenant = f.registry.insert(Tenant::new("Shop", "shop")).unwrap();
        f.scheduler
            .set_custom_domain(tenant.id, Some("new.test"))
            .await
            .unwrap();
        f.queue.drain();

        let change = f
            .scheduler
            .set_custom_domain(tenant.id, Some("new.test"))
            .await
            .unwrap();
        assert!(!change.changed);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_clearing_domain_schedules_nothing() {
        let f = fixture();
        let tenant = f.registry.insert(Tenant::new("Shop", "shop")).unwrap();
        f.scheduler
            .set_custom_domain(tenant.id, Some("new.test"))
            .await
            .unwrap();
        f.queue.drain();

        let change = f
            .scheduler
            .set_custom_domain(tenant.id, Some("  "))
            .await
            .unwrap();
        assert!(change.changed);
        assert_eq!(change.tenant.custom_domain, None);
        assert_eq!(change.tenant.ssl_status(), SslStatus::None);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_domains() {
        let f = fixture();
        let tenant = f.registry.insert(Tenant::new("Shop", "shop")).unwrap();
        let other = f.registry.insert(Tenant::new("Other", "other")).unwrap();
        f.scheduler
            .set_custom_domain(other.id, Some("taken.test"))
            .await
            .unwrap();
        f.queue.drain();

        assert!(matches!(
            f.scheduler
                .set_custom_domain(tenant.id, Some("bad domain"))
                .await,
            Err(ScheduleError::Invalid(_))
        ));
        assert!(matches!(
            f.scheduler
                .set_custom_domain(tenant.id, Some("app.sites.test"))
                .await,
            Err(ScheduleError::SystemHost(_))
        ));
        assert!(matches!(
            f.scheduler
                .set_custom_domain(tenant.id, Some("taken.test"))
                .await,
            Err(ScheduleError::Registry(RegistryError::DomainTaken(_)))
        ));
        assert!(f.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_jobs() {
        let queue = Arc::new(RecordingQueue::new());
        let handle = tokio::spawn(run_periodic(
            queue.clone(),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(30 * 60),
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        let jobs: Vec<Job> = queue.jobs().into_iter().map(|(j, _)| j).collect();
        assert_eq!(jobs.iter().filter(|j| **j == Job::RenewAll).count(), 1);
        assert_eq!(
            jobs.iter().filter(|j| **j == Job::SweepPending).count(),
            48
        );
        handle.abort();
    }

    #[tokio::test]
    async fn test_periodic_zero_periods_are_floored() {
        let queue = Arc::new(RecordingQueue::new());
        let run = run_periodic(queue.clone(), Duration::ZERO, Duration::ZERO);
        assert!(tokio::time::timeout(Duration::from_millis(200), run)
            .await
            .is_err());
        assert!(queue.is_empty());
    }
}
