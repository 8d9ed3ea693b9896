//! Control plane: the JSON API the CRUD layer uses to manage tenants
//!
//! Binds to localhost by default. The CRUD layer writes names, subdomains,
//! custom domains and the active flag; certificate status fields are
//! read-only here.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sitehost_core::{
    normalize_subdomain, FieldError, Job, RegistryError, ScheduledJob, SslStatus, Tenant,
    TenantId, TenantRegistry, TenantResolver,
};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::http_plane::json_response;
use crate::queue::{QueueError, TaskQueue};
use crate::scheduler::{DomainScheduler, ScheduleError};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ControlError {
    fn status(&self) -> StatusCode {
        match self {
            ControlError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ControlError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => ControlError::NotFound,
            RegistryError::SubdomainTaken(_) | RegistryError::DomainTaken(_) => {
                ControlError::Conflict(e.to_string())
            }
            RegistryError::Storage(_) => ControlError::Internal(e.to_string()),
        }
    }
}

impl From<FieldError> for ControlError {
    fn from(e: FieldError) -> Self {
        ControlError::BadRequest(e.to_string())
    }
}

impl From<QueueError> for ControlError {
    fn from(e: QueueError) -> Self {
        ControlError::Internal(e.to_string())
    }
}

impl From<ScheduleError> for ControlError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Invalid(e) => e.into(),
            ScheduleError::SystemHost(_) => ControlError::BadRequest(e.to_string()),
            ScheduleError::Registry(e) => e.into(),
            ScheduleError::Queue(e) => e.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateTenant {
    name: String,
    subdomain: String,
    custom_domain: Option<String>,
    contact_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetCustomDomain {
    custom_domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetActive {
    is_active: bool,
}

pub struct ControlPlane {
    registry: Arc<dyn TenantRegistry>,
    resolver: Arc<TenantResolver>,
    scheduler: Arc<DomainScheduler>,
    queue: Arc<dyn TaskQueue>,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        resolver: Arc<TenantResolver>,
        scheduler: Arc<DomainScheduler>,
        queue: Arc<dyn TaskQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            resolver,
            scheduler,
            queue,
        })
    }

    /// Start listening for control plane requests
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Control plane listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let this = this.clone();
                    async move { this.handle_request(req).await }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("Control connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = self.route(req).await;
        let response = match result {
            Ok((status, body)) => json_response(status, &body),
            Err(e) => {
                if matches!(e, ControlError::Internal(_)) {
                    tracing::error!("{} {} failed: {}", method, path, e);
                } else {
                    tracing::debug!("{} {} rejected: {}", method, path, e);
                }
                json_response(e.status(), &serde_json::json!({ "error": e.to_string() }))
            }
        };
        Ok(response)
    }

    async fn route(
        &self,
        req: Request<Incoming>,
    ) -> Result<(StatusCode, serde_json::Value), ControlError> {
        let path = req.uri().path().trim_end_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (req.method().clone(), segments.as_slice()) {
            (Method::GET, ["tenants"]) => Ok((StatusCode::OK, to_json(&self.registry.list()?)?)),
            (Method::POST, ["tenants"]) => {
                let body: CreateTenant = read_json(req).await?;
                let tenant = self.create_tenant(body).await?;
                Ok((StatusCode::CREATED, to_json(&tenant)?))
            }
            (Method::GET, ["tenants", id]) => {
                let tenant = self.registry.get(parse_id(id)?)?;
                Ok((StatusCode::OK, to_json(&tenant)?))
            }
            (Method::PUT, ["tenants", id, "custom-domain"]) => {
                let id = parse_id(id)?;
                let body: SetCustomDomain = read_json(req).await?;
                let change = self
                    .scheduler
                    .set_custom_domain(id, body.custom_domain.as_deref())
                    .await?;
                Ok((StatusCode::OK, to_json(&change.tenant)?))
            }
            (Method::PUT, ["tenants", id, "active"]) => {
                let id = parse_id(id)?;
                let body: SetActive = read_json(req).await?;
                let tenant = self.registry.set_active(id, body.is_active)?;
                tracing::info!("Tenant {} active={}", id, body.is_active);
                Ok((StatusCode::OK, to_json(&tenant)?))
            }
            (Method::POST, ["tenants", id, "renewal"]) => {
                let scheduled = self.renew_tenant(parse_id(id)?).await?;
                Ok((StatusCode::ACCEPTED, to_json(&scheduled)?))
            }
            (Method::POST, ["renewals"]) => {
                let scheduled = self.queue.enqueue(Job::RenewAll, Duration::ZERO).await?;
                Ok((StatusCode::ACCEPTED, to_json(&scheduled)?))
            }
            _ => Err(ControlError::NotFound),
        }
    }

    /// Queue an immediate renewal of a tenant's active certificate
    async fn renew_tenant(&self, id: TenantId) -> Result<ScheduledJob, ControlError> {
        let tenant = self.registry.get(id)?;
        let Some(domain) = tenant.custom_domain.clone() else {
            return Err(ControlError::Conflict(format!("Tenant {} has no custom domain", id)));
        };
        if tenant.ssl_status() != SslStatus::Active {
            return Err(ControlError::Conflict(format!(
                "No active certificate for {} (ssl={})",
                domain,
                tenant.ssl_status()
            )));
        }
        let scheduled = self
            .queue
            .enqueue(Job::Renew { tenant_id: id, domain }, Duration::ZERO)
            .await?;
        Ok(scheduled)
    }

    async fn create_tenant(&self, body: CreateTenant) -> Result<Tenant, ControlError> {
        let name = body.name.trim();
        if name.is_empty() {
            return Err(ControlError::BadRequest("name must not be empty".to_string()));
        }

        let subdomain = normalize_subdomain(&body.subdomain)?;
        let host = format!("{}.{}", subdomain, self.resolver.base_domain());
        if self.resolver.is_system_host(&host) {
            return Err(ControlError::BadRequest(format!(
                "Subdomain {} is reserved",
                subdomain
            )));
        }

        let custom_domain = self.scheduler.check_domain(body.custom_domain.as_deref())?;

        let mut tenant = Tenant::new(name, subdomain);
        if let Some(email) = body.contact_email.filter(|e| !e.trim().is_empty()) {
            tenant = tenant.with_contact_email(email.trim());
        }
        if let Some(domain) = &custom_domain {
            tenant = tenant.with_custom_domain(domain.as_str());
        }

        let tenant = self.registry.insert(tenant)?;
        tracing::info!("Created tenant {} ({})", tenant.id, tenant.subdomain);

        if let Some(domain) = &custom_domain {
            self.scheduler.schedule_checks(tenant.id, domain).await?;
        }
        Ok(tenant)
    }
}

fn parse_id(raw: &str) -> Result<TenantId, ControlError> {
    TenantId::from_str(raw).map_err(|_| ControlError::NotFound)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ControlError> {
    serde_json::to_value(value).map_err(|e| ControlError::Internal(e.to_string()))
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, ControlError> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| ControlError::BadRequest(format!("Failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| ControlError::BadRequest(format!("Invalid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let id = TenantId::new();
        assert_eq!(
            ControlError::from(RegistryError::NotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ControlError::from(RegistryError::DomainTaken("a.test".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ControlError::from(ScheduleError::SystemHost("sites.test".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ControlError::from(FieldError::SubdomainTooLong).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ControlError::from(RegistryError::Storage("disk".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_parse_id() {
        let id = TenantId::new();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
        assert!(matches!(parse_id("nope"), Err(ControlError::NotFound)));
    }
}
