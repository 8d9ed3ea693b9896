//! DNS verification of custom domains
//!
//! A custom domain is verified when its A/AAAA records include the server's
//! address, or when it is a CNAME to the platform's proxy hostname.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{ResolveError, Resolver, TokioResolver};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsCheckError {
    #[error("No DNS records found for {domain}")]
    NotFound { domain: String },

    #[error("{domain} points to {found}, expected {expected}")]
    Mismatch {
        domain: String,
        found: String,
        expected: String,
    },

    #[error("DNS lookup for {domain} timed out")]
    Timeout { domain: String },

    #[error("DNS lookup for {domain} failed: {message}")]
    Lookup { domain: String, message: String },
}

/// Identity a verified domain must resolve to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsTarget {
    pub ip: Option<IpAddr>,
    pub proxy_hostname: Option<String>,
}

impl DnsTarget {
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            proxy_hostname: None,
        }
    }

    pub fn proxy(hostname: impl Into<String>) -> Self {
        Self {
            ip: None,
            proxy_hostname: Some(hostname.into()),
        }
    }

    pub fn matches_ip(&self, addr: &IpAddr) -> bool {
        self.ip.as_ref() == Some(addr)
    }

    pub fn matches_cname(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.');
        self.proxy_hostname
            .as_deref()
            .is_some_and(|proxy| proxy.trim_end_matches('.').eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for DnsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.ip, &self.proxy_hostname) {
            (Some(ip), Some(proxy)) => write!(f, "{} or CNAME {}", ip, proxy),
            (Some(ip), None) => write!(f, "{}", ip),
            (None, Some(proxy)) => write!(f, "CNAME {}", proxy),
            (None, None) => f.write_str("<unconfigured>"),
        }
    }
}

/// Checks that a domain points at this server
#[async_trait]
pub trait DnsVerifier: Send + Sync {
    async fn verify(&self, domain: &str) -> Result<(), DnsCheckError>;
}

/// Verifier backed by hickory's async resolver
pub struct HickoryDnsVerifier {
    resolver: TokioResolver,
    target: DnsTarget,
    timeout: Duration,
}

impl HickoryDnsVerifier {
    /// `nameservers` empty means the resolver's default upstreams
    pub fn new(target: DnsTarget, nameservers: &[SocketAddr], timeout: Duration) -> Self {
        let resolver_config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for addr in nameservers {
                resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 2;
        // Every check must see fresh answers
        opts.cache_size = 0;

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            resolver,
            target,
            // Covers both lookups and their retries
            timeout: timeout * 6,
        }
    }

    pub fn target(&self) -> &DnsTarget {
        &self.target
    }

    async fn check(&self, domain: &str) -> Result<(), DnsCheckError> {
        let mut found: Vec<String> = Vec::new();
        let mut failure: Option<DnsCheckError> = None;

        if self.target.ip.is_some() {
            match self.resolver.lookup_ip(domain).await {
                Ok(lookup) => {
                    for addr in lookup.iter() {
                        if self.target.matches_ip(&addr) {
                            tracing::debug!("{} resolves to {}", domain, addr);
                            return Ok(());
                        }
                        found.push(addr.to_string());
                    }
                }
                Err(e) => failure = classify(domain, &e),
            }
        }

        if self.target.proxy_hostname.is_some() || found.is_empty() {
            match self.resolver.lookup(domain, RecordType::CNAME).await {
                Ok(lookup) => {
                    for rdata in lookup.iter() {
                        if let RData::CNAME(cname) = rdata {
                            let name = cname.0.to_utf8();
                            if self.target.matches_cname(&name) {
                                tracing::debug!("{} is a CNAME to {}", domain, name);
                                return Ok(());
                            }
                            found.push(format!("CNAME {}", name.trim_end_matches('.')));
                        }
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = classify(domain, &e);
                    }
                }
            }
        }

        if !found.is_empty() {
            return Err(DnsCheckError::Mismatch {
                domain: domain.to_string(),
                found: found.join(", "),
                expected: self.target.to_string(),
            });
        }

        Err(failure.unwrap_or_else(|| DnsCheckError::NotFound {
            domain: domain.to_string(),
        }))
    }
}

/// Map a resolver error; `None` means "no records", which is not a fault
fn classify(domain: &str, error: &ResolveError) -> Option<DnsCheckError> {
    classify_message(domain, &error.to_string())
}

fn classify_message(domain: &str, message: &str) -> Option<DnsCheckError> {
    let lowered = message.to_lowercase();
    if lowered.contains("no records found")
        || lowered.contains("nxdomain")
        || lowered.contains("record not found")
    {
        None
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        Some(DnsCheckError::Timeout {
            domain: domain.to_string(),
        })
    } else {
        Some(DnsCheckError::Lookup {
            domain: domain.to_string(),
            message: message.to_string(),
        })
    }
}

#[async_trait]
impl DnsVerifier for HickoryDnsVerifier {
    async fn verify(&self, domain: &str) -> Result<(), DnsCheckError> {
        match tokio::time::timeout(self.timeout, self.check(domain)).await {
            Ok(result) => result,
            Err(_) => Err(DnsCheckError::Timeout {
                domain: domain.to_string(),
            }),
        }
    }
}
