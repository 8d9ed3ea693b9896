//! Tenant record, lifecycle statuses and field normalization

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::validation::{validate_hostname, validate_subdomain_label};

/// Maximum length of a tenant subdomain label
pub const MAX_SUBDOMAIN_LEN: usize = 50;

/// Maximum length of a tenant custom domain
pub const MAX_CUSTOM_DOMAIN_LEN: usize = 255;

/// Stable tenant identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// DNS verification status of a tenant's custom domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsStatus {
    #[default]
    Pending,
    Ok,
    Error,
}

impl DnsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsStatus::Pending => "pending",
            DnsStatus::Ok => "ok",
            DnsStatus::Error => "error",
        }
    }
}

impl fmt::Display for DnsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate status of a tenant's custom domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslStatus {
    #[default]
    None,
    Generating,
    Active,
    Error,
}

impl SslStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslStatus::None => "none",
            SslStatus::Generating => "generating",
            SslStatus::Active => "active",
            SslStatus::Error => "error",
        }
    }
}

impl fmt::Display for SslStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status pair owned by the certificate state machine
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CertificateState {
    pub dns_status: DnsStatus,
    pub dns_error: Option<String>,
    pub ssl_status: SslStatus,
    pub ssl_error: Option<String>,
}

/// A hosted site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub subdomain: String,
    pub custom_domain: Option<String>,
    /// ACME contact address; the configured default is used when absent
    pub contact_email: Option<String>,
    pub is_active: bool,
    #[serde(flatten)]
    pub certificate: CertificateState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Create an active tenant without a custom domain
    pub fn new(name: impl Into<String>, subdomain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TenantId::new(),
            name: name.into(),
            subdomain: subdomain.into(),
            custom_domain: None,
            contact_email: None,
            is_active: true,
            certificate: CertificateState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_custom_domain(mut self, domain: impl Into<String>) -> Self {
        self.custom_domain = Some(domain.into());
        self
    }

    pub fn with_contact_email(mut self, email: impl Into<String>) -> Self {
        self.contact_email = Some(email.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn dns_status(&self) -> DnsStatus {
        self.certificate.dns_status
    }

    pub fn ssl_status(&self) -> SslStatus {
        self.certificate.ssl_status
    }

    /// Whether the tenant's current custom domain equals `domain`
    pub fn has_custom_domain(&self, domain: &str) -> bool {
        self.custom_domain.as_deref() == Some(domain)
    }
}

/// Errors from normalizing tenant-supplied fields
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("Invalid subdomain: {0:?}")]
    InvalidSubdomain(String),

    #[error("Subdomain longer than {MAX_SUBDOMAIN_LEN} characters")]
    SubdomainTooLong,

    #[error("Invalid custom domain: {0:?}")]
    InvalidCustomDomain(String),

    #[error("Custom domain longer than {MAX_CUSTOM_DOMAIN_LEN} characters")]
    CustomDomainTooLong,
}

/// Lower-case and validate a subdomain label supplied by the CRUD layer
pub fn normalize_subdomain(raw: &str) -> Result<String, FieldError> {
    let label = raw.trim().to_ascii_lowercase();
    if label.len() > MAX_SUBDOMAIN_LEN {
        return Err(FieldError::SubdomainTooLong);
    }
    if !validate_subdomain_label(&label) {
        return Err(FieldError::InvalidSubdomain(raw.to_string()));
    }
    Ok(label)
}

/// Lower-case and validate a custom domain; blank input clears the domain
pub fn normalize_custom_domain(raw: Option<&str>) -> Result<Option<String>, FieldError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    // Surrounding whitespace is rejected by the validator, not stripped
    let domain = raw.to_ascii_lowercase();
    if domain.len() > MAX_CUSTOM_DOMAIN_LEN {
        return Err(FieldError::CustomDomainTooLong);
    }
    // Loopback names pass the validator but are never tenant domains
    if !validate_hostname(&domain) || domain == "localhost" || domain == "127.0.0.1" {
        return Err(FieldError::InvalidCustomDomain(raw.to_string()));
    }
    Ok(Some(domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tenant_defaults() {
        let tenant = Tenant::new("Acme Realty", "acme");
        assert!(tenant.is_active);
        assert!(tenant.custom_domain.is_none());
        assert_eq!(tenant.dns_status(), DnsStatus::Pending);
        assert_eq!(tenant.ssl_status(), SslStatus::None);
    }

    #[test]
    fn test_status_serialization() {
        let tenant = Tenant::new("Acme", "acme").with_custom_domain("acme.test");
        let json = serde_json::to_value(&tenant).unwrap();
        assert_eq!(json["dns_status"], "pending");
        assert_eq!(json["ssl_status"], "none");
        assert_eq!(json["custom_domain"], "acme.test");

        let back: Tenant = serde_json::from_value(json).unwrap();
        assert_eq!(back, tenant);
    }

    #[test]
    fn test_tenant_id_parse() {
        let id = TenantId::new();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<TenantId>().is_err());
    }

    #[test]
    fn test_normalize_subdomain() {
        assert_eq!(normalize_subdomain(" Acme ").unwrap(), "acme");
        assert_eq!(
            normalize_subdomain(&"a".repeat(51)),
            Err(FieldError::SubdomainTooLong)
        );
        assert!(normalize_subdomain("acme.shop").is_err());
        assert!(normalize_subdomain("-acme").is_err());
    }

    #[test]
    fn test_normalize_custom_domain() {
        assert_eq!(
            normalize_custom_domain(Some("WWW.Shop.TEST")).unwrap(),
            Some("www.shop.test".to_string())
        );
        assert_eq!(normalize_custom_domain(Some("  ")).unwrap(), None);
        assert_eq!(normalize_custom_domain(None).unwrap(), None);
        assert!(normalize_custom_domain(Some("shop.test\r\nX-Evil: 1")).is_err());
        for padded in ["shop.test\r\n", "shop.test\n", " shop.test", "shop.test\t"] {
            assert!(normalize_custom_domain(Some(padded)).is_err(), "{:?}", padded);
        }
        assert!(normalize_custom_domain(Some("10.0.0.1")).is_err());
        assert!(normalize_custom_domain(Some("localhost")).is_err());
    }
}
