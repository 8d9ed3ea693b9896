//! Core model for sitehost
//!
//! Hostname validation, the tenant record, host resolution, the certificate
//! state machine and the job types shared by the server and its tests.

mod job;
mod lifecycle;
mod registry;
mod resolver;
mod tenant;
mod validation;

pub use job::{Job, JobKind, ScheduledJob};
pub use lifecycle::{
    transition, truncate_error, LifecycleEvent, StatusUpdate, TransitionError, MAX_ERROR_TEXT,
};
pub use registry::{
    DomainChange, Expected, InMemoryRegistry, RegistryError, TenantRegistry, UpdateOutcome,
};
pub use resolver::{
    normalize_host, RejectReason, ResolutionOutcome, ResolverConfig, TenantResolver,
    DEFAULT_RESERVED_LABELS,
};
pub use tenant::{
    normalize_custom_domain, normalize_subdomain, CertificateState, DnsStatus, FieldError,
    SslStatus, Tenant, TenantId, MAX_CUSTOM_DOMAIN_LEN, MAX_SUBDOMAIN_LEN,
};
pub use validation::{validate_hostname, validate_subdomain_label, MAX_HOSTNAME_LEN, MAX_LABEL_LEN};
