//! Tenant resolution for inbound requests
//!
//! Maps a raw `Host` header to the system, exactly one tenant, or a
//! rejection. Rejections must be answered with a 404 by the caller.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::registry::{RegistryError, TenantRegistry};
use crate::tenant::Tenant;
use crate::validation::{validate_hostname, validate_subdomain_label};

/// Labels under the base domain that belong to the platform itself
pub const DEFAULT_RESERVED_LABELS: [&str; 4] = ["www", "app", "api", "admin"];

/// Why a host was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Malformed or unsafe host string
    InvalidHost,
    /// More than one tenant claims the host
    AmbiguousConfiguration,
    /// No tenant claims the host
    UnregisteredDomain,
    /// The registry could not be queried
    RegistryUnavailable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidHost => "invalid_host",
            RejectReason::AmbiguousConfiguration => "ambiguous_configuration",
            RejectReason::UnregisteredDomain => "unregistered_domain",
            RejectReason::RegistryUnavailable => "registry_unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request result of host resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// A platform host, not bound to any tenant
    SystemHost,
    /// Exactly one active tenant claims the host
    TenantHost { tenant: Tenant },
    Rejected { reason: RejectReason },
}

impl ResolutionOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ResolutionOutcome::Rejected { .. })
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        match self {
            ResolutionOutcome::TenantHost { tenant } => Some(tenant),
            _ => None,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        ResolutionOutcome::Rejected { reason }
    }
}

/// Static configuration for the resolver
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Platform base domain, e.g. `sites.example.com`
    pub base_domain: String,
    /// Labels under the base domain that are never tenants
    pub reserved_labels: Vec<String>,
    /// Extra hosts treated as system hosts (e.g. the server's public IP)
    pub extra_system_hosts: Vec<String>,
}

impl ResolverConfig {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            reserved_labels: DEFAULT_RESERVED_LABELS.iter().map(|s| s.to_string()).collect(),
            extra_system_hosts: Vec::new(),
        }
    }
}

enum Lookup {
    Found(Tenant),
    Missing,
    Failed(ResolutionOutcome),
}

/// Resolves inbound hosts against the tenant registry
pub struct TenantResolver {
    registry: Arc<dyn TenantRegistry>,
    base_domain: String,
    base_suffix: String,
    system_hosts: HashSet<String>,
    reserved_labels: HashSet<String>,
}

impl TenantResolver {
    pub fn new(registry: Arc<dyn TenantRegistry>, config: ResolverConfig) -> Self {
        let base_domain = config.base_domain.to_ascii_lowercase();

        let mut system_hosts: HashSet<String> = [
            base_domain.clone(),
            format!("www.{}", base_domain),
            format!("app.{}", base_domain),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ]
        .into_iter()
        .collect();
        system_hosts.extend(
            config
                .extra_system_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase()),
        );

        Self {
            registry,
            base_suffix: format!(".{}", base_domain),
            base_domain,
            system_hosts,
            reserved_labels: config
                .reserved_labels
                .iter()
                .map(|l| l.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Whether `host` (normalized) is one of the platform's own hosts
    pub fn is_system_host(&self, host: &str) -> bool {
        if self.system_hosts.contains(host) {
            return true;
        }
        host.strip_suffix(&self.base_suffix)
            .is_some_and(|rest| self.reserved_labels.contains(rest))
    }

    /// Whether `host` lies under the platform base domain
    pub fn is_under_base_domain(&self, host: &str) -> bool {
        host == self.base_domain || host.ends_with(&self.base_suffix)
    }

    /// Resolve a raw `Host` header value
    ///
    /// `remote_addr` is only used for logging.
    pub fn resolve(&self, raw_host: &str, remote_addr: &str) -> ResolutionOutcome {
        let host = normalize_host(raw_host);

        if !validate_hostname(&host) {
            tracing::warn!(
                "Rejected invalid host {:?} (remote: {})",
                raw_host,
                remote_addr
            );
            return ResolutionOutcome::rejected(RejectReason::InvalidHost);
        }

        if self.system_hosts.contains(&host) {
            return ResolutionOutcome::SystemHost;
        }

        match self.lookup(
            self.registry.find_by_custom_domain(&host, true),
            &host,
            remote_addr,
            "custom_domain",
        ) {
            Lookup::Found(tenant) => return ResolutionOutcome::TenantHost { tenant },
            Lookup::Failed(outcome) => return outcome,
            Lookup::Missing => {}
        }

        if let Some(rest) = host.strip_suffix(&self.base_suffix) {
            // Multi-level hosts only use the first label
            let label = rest.split('.').next().unwrap_or(rest);

            if self.reserved_labels.contains(label) {
                return ResolutionOutcome::SystemHost;
            }

            if !validate_subdomain_label(label) {
                tracing::warn!(
                    "Rejected invalid subdomain {:?} of {} (remote: {})",
                    label,
                    host,
                    remote_addr
                );
                return ResolutionOutcome::rejected(RejectReason::InvalidHost);
            }

            match self.lookup(
                self.registry.find_by_subdomain(label, true),
                &host,
                remote_addr,
                "subdomain",
            ) {
                Lookup::Found(tenant) => return ResolutionOutcome::TenantHost { tenant },
                Lookup::Failed(outcome) => return outcome,
                Lookup::Missing => {}
            }
        }

        tracing::warn!(
            "Access denied to unregistered domain: {} (remote: {})",
            host,
            remote_addr
        );
        ResolutionOutcome::rejected(RejectReason::UnregisteredDomain)
    }

    fn lookup(
        &self,
        result: Result<Vec<Tenant>, RegistryError>,
        host: &str,
        remote_addr: &str,
        key: &str,
    ) -> Lookup {
        match result {
            Ok(mut matches) => match matches.len() {
                0 => Lookup::Missing,
                1 => Lookup::Found(matches.remove(0)),
                n => {
                    let ids: Vec<String> = matches.iter().map(|t| t.id.to_string()).collect();
                    tracing::error!(
                        "Ambiguous tenant configuration: {} tenants share {} {} ({}) (remote: {})",
                        n,
                        key,
                        host,
                        ids.join(", "),
                        remote_addr
                    );
                    Lookup::Failed(ResolutionOutcome::rejected(
                        RejectReason::AmbiguousConfiguration,
                    ))
                }
            },
            Err(e) => {
                tracing::error!(
                    "Registry lookup by {} failed for {}: {} (remote: {})",
                    key,
                    host,
                    e,
                    remote_addr
                );
                Lookup::Failed(ResolutionOutcome::rejected(
                    RejectReason::RegistryUnavailable,
                ))
            }
        }
    }
}

/// Lower-case and strip a trailing `:port`
///
/// Whitespace and control bytes are kept so validation rejects them.
pub fn normalize_host(raw: &str) -> String {
    let host = match raw.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => raw,
    };
    host.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    const BASE: &str = "sites.test";

    fn resolver_with(tenants: Vec<Tenant>) -> TenantResolver {
        let registry = Arc::new(InMemoryRegistry::from_tenants(tenants));
        TenantResolver::new(registry, ResolverConfig::new(BASE))
    }

    fn rejected(reason: RejectReason) -> ResolutionOutcome {
        ResolutionOutcome::Rejected { reason }
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM:8080"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("example.com:"), "example.com:");
        assert_eq!(normalize_host(" Example.com\r\n"), " example.com\r\n");
    }

    #[test]
    fn test_padded_hosts_do_not_resolve() {
        let resolver = resolver_with(vec![
            Tenant::new("X", "x").with_custom_domain("x.test"),
            Tenant::new("Y", "y"),
        ]);
        for host in [
            "x.test\r\n",
            "x.test\n",
            "x.test\r",
            " x.test",
            "x.test ",
            "\tx.test",
            "y.sites.test\r\n",
            "x.test\r\n:443",
        ] {
            assert_eq!(
                resolver.resolve(host, "10.0.0.1"),
                rejected(RejectReason::InvalidHost),
                "{:?}",
                host
            );
        }
    }

    #[test]
    fn test_unknown_host_rejected() {
        let resolver = resolver_with(vec![]);
        assert_eq!(
            resolver.resolve("unknown.test", "10.0.0.1"),
            rejected(RejectReason::UnregisteredDomain)
        );
    }

    #[test]
    fn test_custom_domain_match_is_case_insensitive() {
        let tenant = Tenant::new("X", "x").with_custom_domain("x.test");
        let resolver = resolver_with(vec![tenant.clone()]);

        for host in ["x.test", "X.TEST", "x.test:443"] {
            match resolver.resolve(host, "10.0.0.1") {
                ResolutionOutcome::TenantHost { tenant: found } => assert_eq!(found.id, tenant.id),
                other => panic!("{} resolved to {:?}", host, other),
            }
        }
    }

    #[test]
    fn test_duplicate_custom_domain_is_ambiguous() {
        let resolver = resolver_with(vec![
            Tenant::new("A", "a").with_custom_domain("dup.test"),
            Tenant::new("B", "b").with_custom_domain("dup.test"),
        ]);
        assert_eq!(
            resolver.resolve("dup.test", "10.0.0.1"),
            rejected(RejectReason::AmbiguousConfiguration)
        );
    }

    #[test]
    fn test_duplicate_subdomain_is_ambiguous() {
        let resolver = resolver_with(vec![Tenant::new("A", "twin"), Tenant::new("B", "twin")]);
        assert_eq!(
            resolver.resolve("twin.sites.test", "10.0.0.1"),
            rejected(RejectReason::AmbiguousConfiguration)
        );
    }

    #[test]
    fn test_system_hosts() {
        // Even a tenant claiming the base domain cannot capture it
        let resolver = resolver_with(vec![
            Tenant::new("Evil", "evil").with_custom_domain(BASE),
            Tenant::new("App", "app"),
        ]);

        for host in [
            "sites.test",
            "www.sites.test",
            "app.sites.test",
            "api.sites.test",
            "admin.sites.test",
            "localhost",
            "127.0.0.1:8000",
        ] {
            assert_eq!(
                resolver.resolve(host, "10.0.0.1"),
                ResolutionOutcome::SystemHost,
                "{}",
                host
            );
        }
    }

    #[test]
    fn test_subdomain_match() {
        let tenant = Tenant::new("Acme", "acme");
        let resolver = resolver_with(vec![tenant.clone()]);

        let outcome = resolver.resolve("ACME.sites.test", "10.0.0.1");
        assert_eq!(outcome.tenant().map(|t| t.id), Some(tenant.id));

        // Multi-level host uses the first label
        let outcome = resolver.resolve("acme.extra.sites.test", "10.0.0.1");
        assert_eq!(outcome.tenant().map(|t| t.id), Some(tenant.id));
    }

    #[test]
    fn test_inactive_tenant_rejected() {
        let resolver = resolver_with(vec![
            Tenant::new("Gone", "gone").with_custom_domain("gone.test").inactive(),
        ]);
        assert_eq!(
            resolver.resolve("gone.test", "10.0.0.1"),
            rejected(RejectReason::UnregisteredDomain)
        );
        assert_eq!(
            resolver.resolve("gone.sites.test", "10.0.0.1"),
            rejected(RejectReason::UnregisteredDomain)
        );
    }

    #[test]
    fn test_invalid_hosts_rejected_before_lookup() {
        let resolver = resolver_with(vec![]);
        for host in [
            "evil.test\r\nX-Injected: 1",
            "ex\u{e4}mple.test",
            "10.1.2.3",
            "bad_host.test",
            "",
        ] {
            assert_eq!(
                resolver.resolve(host, "10.0.0.1"),
                rejected(RejectReason::InvalidHost),
                "{:?}",
                host
            );
        }
    }

    #[test]
    fn test_is_system_host() {
        let resolver = resolver_with(vec![]);
        assert!(resolver.is_system_host("sites.test"));
        assert!(resolver.is_system_host("api.sites.test"));
        assert!(!resolver.is_system_host("acme.sites.test"));
        assert!(resolver.is_under_base_domain("acme.sites.test"));
        assert!(!resolver.is_under_base_domain("othersites.test"));
    }
}
