//! Certificate lifecycle jobs and their scheduling envelope

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenant::TenantId;

/// Kind of certificate lifecycle job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DnsCheck,
    Issue,
    Renew,
    RenewAll,
    SweepPending,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DnsCheck => "dns_check",
            JobKind::Issue => "issue",
            JobKind::Renew => "renew",
            JobKind::RenewAll => "renew_all",
            JobKind::SweepPending => "sweep_pending",
        }
    }
}

/// Work items consumed by the certificate worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Check that `domain` points at this server
    DnsCheck { tenant_id: TenantId, domain: String },

    /// Obtain a certificate for `domain` and its `www` alias
    Issue {
        tenant_id: TenantId,
        domain: String,
        contact_email: String,
        /// 1-based attempt number
        attempt: u32,
    },

    /// Renew a single certificate
    Renew { tenant_id: TenantId, domain: String },

    /// Renew every certificate that is due
    RenewAll,

    /// Re-check every domain still pending or in error
    SweepPending,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::DnsCheck { .. } => JobKind::DnsCheck,
            Job::Issue { .. } => JobKind::Issue,
            Job::Renew { .. } => JobKind::Renew,
            Job::RenewAll => JobKind::RenewAll,
            Job::SweepPending => JobKind::SweepPending,
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        match self {
            Job::DnsCheck { tenant_id, .. }
            | Job::Issue { tenant_id, .. }
            | Job::Renew { tenant_id, .. } => Some(*tenant_id),
            Job::RenewAll | Job::SweepPending => None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Job::DnsCheck { domain, .. } | Job::Issue { domain, .. } | Job::Renew { domain, .. } => {
                Some(domain)
            }
            Job::RenewAll | Job::SweepPending => None,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Issue {
                domain, attempt, ..
            } => write!(f, "issue({}, attempt {})", domain, attempt),
            _ => match self.domain() {
                Some(domain) => write!(f, "{}({})", self.kind().as_str(), domain),
                None => f.write_str(self.kind().as_str()),
            },
        }
    }
}

/// A job accepted by a queue, with its identity and due time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub job: Job,
    pub run_after: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(job: Job, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        Self {
            id: Uuid::new_v4(),
            job,
            run_after: Utc::now().checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wire_format() {
        let tenant_id = TenantId::new();
        let job = Job::DnsCheck {
            tenant_id,
            domain: "shop.test".into(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"], "dns_check");
        assert_eq!(json["domain"], "shop.test");

        let json = serde_json::to_value(Job::RenewAll).unwrap();
        assert_eq!(json["kind"], "renew_all");
    }

    #[test]
    fn test_display() {
        let tenant_id = TenantId::new();
        let issue = Job::Issue {
            tenant_id,
            domain: "shop.test".into(),
            contact_email: "ops@sites.test".into(),
            attempt: 2,
        };
        assert_eq!(issue.to_string(), "issue(shop.test, attempt 2)");
        assert_eq!(Job::SweepPending.to_string(), "sweep_pending");
        assert_eq!(issue.tenant_id(), Some(tenant_id));
        assert_eq!(Job::RenewAll.domain(), None);
    }

    #[test]
    fn test_scheduled_job_run_after() {
        let before = Utc::now();
        let scheduled = ScheduledJob::new(Job::RenewAll, Duration::from_secs(300));
        assert!(scheduled.run_after >= before + chrono::Duration::seconds(300));
    }
}
