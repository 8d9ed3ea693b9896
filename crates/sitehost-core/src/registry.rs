//! Tenant registry abstraction
//!
//! The registry is the persistence boundary. Lookups are synchronous point
//! lookups so the resolver can run in the request path.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;

use crate::lifecycle::{transition, LifecycleEvent, StatusUpdate};
use crate::tenant::{DnsStatus, SslStatus, Tenant, TenantId};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tenant not found: {0}")]
    NotFound(TenantId),

    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    #[error("Custom domain already taken: {0}")]
    DomainTaken(String),

    #[error("Registry storage error: {0}")]
    Storage(String),
}

/// Preconditions for a status write
///
/// Every `Some` field must match the stored tenant or the write is discarded
/// as stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expected {
    pub custom_domain: Option<String>,
    pub dns_status: Option<DnsStatus>,
    pub ssl_status: Option<SslStatus>,
}

impl Expected {
    /// Only require that the custom domain has not changed
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            custom_domain: Some(domain.into()),
            ..Default::default()
        }
    }

    /// Require domain and both statuses to equal the snapshot
    pub fn snapshot(tenant: &Tenant) -> Self {
        Self {
            custom_domain: tenant.custom_domain.clone(),
            dns_status: Some(tenant.dns_status()),
            ssl_status: Some(tenant.ssl_status()),
        }
    }

    pub fn matches(&self, tenant: &Tenant) -> bool {
        if let Some(domain) = &self.custom_domain {
            if !tenant.has_custom_domain(domain) {
                return false;
            }
        }
        if let Some(dns) = self.dns_status {
            if tenant.dns_status() != dns {
                return false;
            }
        }
        if let Some(ssl) = self.ssl_status {
            if tenant.ssl_status() != ssl {
                return false;
            }
        }
        true
    }
}

/// Result of a conditional status write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied(Tenant),
    /// The tenant moved on since the snapshot; nothing was written
    Stale,
}

/// Result of writing a tenant's custom domain
#[derive(Debug, Clone)]
pub struct DomainChange {
    pub tenant: Tenant,
    pub previous: Option<String>,
    pub changed: bool,
}

/// Persistence boundary for tenant records
pub trait TenantRegistry: Send + Sync {
    /// Tenants whose custom domain equals `host` exactly
    fn find_by_custom_domain(&self, host: &str, active_only: bool)
        -> Result<Vec<Tenant>, RegistryError>;

    /// Tenants whose subdomain label equals `label`
    fn find_by_subdomain(&self, label: &str, active_only: bool)
        -> Result<Vec<Tenant>, RegistryError>;

    fn get(&self, id: TenantId) -> Result<Tenant, RegistryError>;

    /// Write status fields in one atomic step if `expected` still holds
    fn update_status(
        &self,
        id: TenantId,
        expected: &Expected,
        update: &StatusUpdate,
    ) -> Result<UpdateOutcome, RegistryError>;

    /// Add a new tenant, enforcing unique subdomain and custom domain
    fn insert(&self, tenant: Tenant) -> Result<Tenant, RegistryError>;

    /// Write the custom domain; when the value changes the status pair is
    /// reset in the same write
    fn set_custom_domain(
        &self,
        id: TenantId,
        domain: Option<String>,
    ) -> Result<DomainChange, RegistryError>;

    fn set_active(&self, id: TenantId, active: bool) -> Result<Tenant, RegistryError>;

    fn list(&self) -> Result<Vec<Tenant>, RegistryError>;
}

/// In-memory registry backed by a lock-protected map
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from existing records without uniqueness checks
    pub fn from_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        Self {
            tenants: RwLock::new(tenants.into_iter().map(|t| (t.id, t)).collect()),
        }
    }

    /// Insert a record as-is, bypassing uniqueness checks
    ///
    /// Used to load persisted data and to seed invariant violations in tests.
    pub fn seed(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id, tenant);
    }

    /// Replace every record at once
    pub fn replace_all(&self, tenants: impl IntoIterator<Item = Tenant>) {
        *self.tenants.write() = tenants.into_iter().map(|t| (t.id, t)).collect();
    }

    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.read().is_empty()
    }

    fn find_by<F>(&self, active_only: bool, pred: F) -> Vec<Tenant>
    where
        F: Fn(&Tenant) -> bool,
    {
        self.tenants
            .read()
            .values()
            .filter(|t| (!active_only || t.is_active) && pred(t))
            .cloned()
            .collect()
    }
}

impl TenantRegistry for InMemoryRegistry {
    fn find_by_custom_domain(
        &self,
        host: &str,
        active_only: bool,
    ) -> Result<Vec<Tenant>, RegistryError> {
        Ok(self.find_by(active_only, |t| t.has_custom_domain(host)))
    }

    fn find_by_subdomain(
        &self,
        label: &str,
        active_only: bool,
    ) -> Result<Vec<Tenant>, RegistryError> {
        Ok(self.find_by(active_only, |t| t.subdomain == label))
    }

    fn get(&self, id: TenantId) -> Result<Tenant, RegistryError> {
        self.tenants
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound(id))
    }

    fn update_status(
        &self,
        id: TenantId,
        expected: &Expected,
        update: &StatusUpdate,
    ) -> Result<UpdateOutcome, RegistryError> {
        let mut tenants = self.tenants.write();
        let tenant = tenants.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        if !expected.matches(tenant) {
            return Ok(UpdateOutcome::Stale);
        }

        update.apply_to(&mut tenant.certificate);
        tenant.updated_at = Utc::now();
        Ok(UpdateOutcome::Applied(tenant.clone()))
    }

    fn insert(&self, tenant: Tenant) -> Result<Tenant, RegistryError> {
        let mut tenants = self.tenants.write();

        if tenants.values().any(|t| t.subdomain == tenant.subdomain) {
            return Err(RegistryError::SubdomainTaken(tenant.subdomain));
        }
        if let Some(domain) = &tenant.custom_domain {
            if tenants.values().any(|t| t.has_custom_domain(domain)) {
                return Err(RegistryError::DomainTaken(domain.clone()));
            }
        }

        tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    fn set_custom_domain(
        &self,
        id: TenantId,
        domain: Option<String>,
    ) -> Result<DomainChange, RegistryError> {
        let mut tenants = self.tenants.write();

        if let Some(domain) = &domain {
            if tenants
                .values()
                .any(|t| t.id != id && t.has_custom_domain(domain))
            {
                return Err(RegistryError::DomainTaken(domain.clone()));
            }
        }

        let tenant = tenants.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let previous = tenant.custom_domain.clone();
        let changed = previous != domain;

        if changed {
            let event = LifecycleEvent::DomainChanged {
                domain: domain.clone(),
            };
            // A domain change is valid from every state
            if let Ok(update) = transition(&tenant.certificate, &event) {
                update.apply_to(&mut tenant.certificate);
            }
            tenant.custom_domain = domain;
            tenant.updated_at = Utc::now();
        }

        Ok(DomainChange {
            tenant: tenant.clone(),
            previous,
            changed,
        })
    }

    fn set_active(&self, id: TenantId, active: bool) -> Result<Tenant, RegistryError> {
        let mut tenants = self.tenants.write();
        let tenant = tenants.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        tenant.is_active = active;
        tenant.updated_at = Utc::now();
        Ok(tenant.clone())
    }

    fn list(&self) -> Result<Vec<Tenant>, RegistryError> {
        let mut tenants: Vec<Tenant> = self.tenants.read().values().cloned().collect();
        tenants.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tenants)
    }
}
