//! JSON file backed tenant registry

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sitehost_core::{
    DomainChange, Expected, InMemoryRegistry, RegistryError, StatusUpdate, Tenant, TenantId,
    TenantRegistry, UpdateOutcome,
};

/// Tenant registry persisted as a JSON array
///
/// Reads are served from memory. Every write rewrites the whole file through
/// a temporary sibling and a rename, so a crash leaves either the old or the
/// new contents on disk.
pub struct JsonFileRegistry {
    path: PathBuf,
    inner: InMemoryRegistry,
    /// Serializes copy-persist-publish so the file follows memory order
    write_lock: Mutex<()>,
}

impl JsonFileRegistry {
    /// Open the registry at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();

        let tenants: Vec<Tenant> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RegistryError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Registry {} not found, starting empty", path.display());
                Vec::new()
            }
            Err(e) => {
                return Err(RegistryError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        tracing::info!("Loaded {} tenant(s) from {}", tenants.len(), path.display());

        Ok(Self {
            path,
            inner: InMemoryRegistry::from_tenants(tenants),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, tenants: &[Tenant]) -> Result<(), RegistryError> {
        let json = serde_json::to_vec_pretty(tenants)
            .map_err(|e| RegistryError::Storage(format!("Failed to encode tenants: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        let storage = |e: std::io::Error| {
            RegistryError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage)?;
        }
        std::fs::write(&tmp, json).map_err(storage)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(storage(e));
        }
        Ok(())
    }

    /// Apply `op` to a copy, persist the copy, then publish it
    ///
    /// Memory only changes once the file holds the new contents.
    fn write<T>(
        &self,
        op: impl FnOnce(&InMemoryRegistry) -> Result<T, RegistryError>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, RegistryError> {
        let _guard = self.write_lock.lock();
        let candidate = InMemoryRegistry::from_tenants(self.inner.list()?);
        let result = op(&candidate)?;
        if !changed(&result) {
            return Ok(result);
        }

        let tenants = candidate.list()?;
        if let Err(e) = self.persist(&tenants) {
            tracing::error!("Registry write not persisted, keeping previous state: {}", e);
            return Err(e);
        }
        self.inner.replace_all(tenants);
        Ok(result)
    }
}

impl TenantRegistry for JsonFileRegistry {
    fn find_by_custom_domain(
        &self,
        host: &str,
        active_only: bool,
    ) -> Result<Vec<Tenant>, RegistryError> {
        self.inner.find_by_custom_domain(host, active_only)
    }

    fn find_by_subdomain(
        &self,
        label: &str,
        active_only: bool,
    ) -> Result<Vec<Tenant>, RegistryError> {
        self.inner.find_by_subdomain(label, active_only)
    }

    fn get(&self, id: TenantId) -> Result<Tenant, RegistryError> {
        self.inner.get(id)
    }

    fn update_status(
        &self,
        id: TenantId,
        expected: &Expected,
        update: &StatusUpdate,
    ) -> Result<UpdateOutcome, RegistryError> {
        // Stale writes changed nothing
        self.write(
            |inner| inner.update_status(id, expected, update),
            |outcome| matches!(outcome, UpdateOutcome::Applied(_)),
        )
    }

    fn insert(&self, tenant: Tenant) -> Result<Tenant, RegistryError> {
        self.write(|inner| inner.insert(tenant), |_| true)
    }

    fn set_custom_domain(
        &self,
        id: TenantId,
        domain: Option<String>,
    ) -> Result<DomainChange, RegistryError> {
        self.write(|inner| inner.set_custom_domain(id, domain), |_| true)
    }

    fn set_active(&self, id: TenantId, active: bool) -> Result<Tenant, RegistryError> {
        self.write(|inner| inner.set_active(id, active), |_| true)
    }

    fn list(&self) -> Result<Vec<Tenant>, RegistryError> {
        self.inner.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitehost_core::{DnsStatus, SslStatus};

    #[test]
    fn test_missing_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = JsonFileRegistry::open(tmp.path().join("tenants.json")).unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_writes_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data").join("tenants.json");

        let registry = JsonFileRegistry::open(&path).unwrap();
        let tenant = registry.insert(Tenant::new("Shop", "shop")).unwrap();
        registry
            .set_custom_domain(tenant.id, Some("shop.test".into()))
            .unwrap();
        let update = StatusUpdate {
            dns_status: Some(DnsStatus::Ok),
            ssl_status: Some(SslStatus::Generating),
            ..Default::default()
        };
        let outcome = registry
            .update_status(tenant.id, &Expected::domain("shop.test"), &update)
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied(_)));

        let reopened = JsonFileRegistry::open(&path).unwrap();
        let stored = reopened.get(tenant.id).unwrap();
        assert_eq!(stored.custom_domain.as_deref(), Some("shop.test"));
        assert_eq!(stored.dns_status(), DnsStatus::Ok);
        assert_eq!(stored.ssl_status(), SslStatus::Generating);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_failed_insert_does_not_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tenants.json");
        let registry = JsonFileRegistry::open(&path).unwrap();
        registry.insert(Tenant::new("Shop", "shop")).unwrap();

        let err = registry.insert(Tenant::new("Other", "shop")).unwrap_err();
        assert!(matches!(err, RegistryError::SubdomainTaken(_)));
        assert_eq!(JsonFileRegistry::open(&path).unwrap().list().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tenants.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileRegistry::open(&path),
            Err(RegistryError::Storage(_))
        ));
    }

    #[test]
    fn test_unpersisted_write_leaves_memory_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tenants.json");
        let registry = JsonFileRegistry::open(&path).unwrap();
        let tenant = registry.insert(Tenant::new("Shop", "shop")).unwrap();

        // A directory in place of the file makes the rename fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = registry
            .set_custom_domain(tenant.id, Some("shop.test".into()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        let stored = registry.get(tenant.id).unwrap();
        assert_eq!(stored.custom_domain, None);
        assert!(registry.find_by_custom_domain("shop.test", false).unwrap().is_empty());

        assert!(registry.set_active(tenant.id, false).is_err());
        assert!(registry.get(tenant.id).unwrap().is_active);

        assert!(registry.insert(Tenant::new("Other", "other")).is_err());
        assert_eq!(registry.list().unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_unpersisted_status_update_is_not_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tenants.json");
        let registry = JsonFileRegistry::open(&path).unwrap();
        let tenant = registry.insert(Tenant::new("Shop", "shop")).unwrap();
        registry
            .set_custom_domain(tenant.id, Some("shop.test".into()))
            .unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let update = StatusUpdate {
            dns_status: Some(DnsStatus::Ok),
            ..Default::default()
        };
        assert!(registry
            .update_status(tenant.id, &Expected::domain("shop.test"), &update)
            .is_err());
        assert_eq!(registry.get(tenant.id).unwrap().dns_status(), DnsStatus::Pending);
    }
}
