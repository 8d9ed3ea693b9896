//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (SITEHOST_*)
//! 2. Config file (sitehost.toml)
//! 3. Default values (where applicable)

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sitehost_core::DEFAULT_RESERVED_LABELS;

/// Environment variable prefix
const ENV_PREFIX: &str = "SITEHOST";

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the plain HTTP gate
    pub http_port: Option<u16>,

    /// Port for the TLS gate (disabled when unset)
    pub https_port: Option<u16>,

    /// Listen address for the control plane
    pub control_addr: Option<String>,

    /// Platform base domain (e.g., "sites.example.com")
    pub base_domain: Option<String>,

    /// Labels under the base domain that never belong to a tenant
    pub reserved_labels: Option<Vec<String>>,

    /// JSON file holding tenant records
    pub registry_path: Option<String>,

    /// Application that receives accepted requests
    pub upstream: Option<String>,

    pub dns: Option<DnsConfig>,
    pub acme: Option<AcmeConfig>,
    pub schedule: Option<ScheduleConfig>,
    pub notifier: Option<NotifierConfig>,
    pub monitor: Option<MonitorConfig>,
}

/// What a verified custom domain must point at
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DnsConfig {
    /// Server's public IP (for A records)
    pub server_ip: Option<String>,

    /// Canonical proxy hostname (for CNAME records)
    pub proxy_hostname: Option<String>,

    /// Nameservers to query instead of the system resolver
    pub nameservers: Option<Vec<String>>,

    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AcmeConfig {
    pub certbot_path: Option<String>,
    pub webroot: Option<String>,
    pub live_dir: Option<String>,

    /// Default ACME account contact
    pub contact_email: Option<String>,

    pub issue_timeout_secs: Option<u64>,
    pub renew_timeout_secs: Option<u64>,

    /// Command run after certificates change (e.g., ["nginx", "-s", "reload"])
    pub reload_command: Option<Vec<String>>,

    /// Certificate served when no SNI name matches
    pub fallback_cert: Option<String>,
    pub fallback_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ScheduleConfig {
    pub dns_check_offsets_mins: Option<Vec<u64>>,
    pub retry_count: Option<u32>,
    pub retry_backoff_mins: Option<u64>,
    pub renewal_interval_hours: Option<u64>,
    pub pending_sweep_mins: Option<u64>,
    pub workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub invalid_host_threshold: Option<u32>,
    pub window_secs: Option<u64>,
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub http_port: u16,
    pub https_port: Option<u16>,
    pub control_addr: SocketAddr,
    pub base_domain: String,
    pub reserved_labels: Vec<String>,
    pub registry_path: PathBuf,
    pub upstream: Option<String>,
    pub dns: ResolvedDnsConfig,
    pub acme: ResolvedAcmeConfig,
    pub schedule: ResolvedScheduleConfig,
    pub webhook_url: Option<String>,
    pub monitor: ResolvedMonitorConfig,
}

#[derive(Debug, Clone)]
pub struct ResolvedDnsConfig {
    pub server_ip: Option<IpAddr>,
    pub proxy_hostname: Option<String>,
    pub nameservers: Vec<SocketAddr>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedAcmeConfig {
    pub certbot_path: PathBuf,
    pub webroot: PathBuf,
    pub live_dir: PathBuf,
    pub contact_email: String,
    pub issue_timeout: Duration,
    pub renew_timeout: Duration,
    pub reload_command: Option<Vec<String>>,
    pub fallback_cert: Option<PathBuf>,
    pub fallback_key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolvedScheduleConfig {
    pub dns_check_offsets: Vec<Duration>,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub renewal_interval: Duration,
    pub pending_sweep: Duration,
    pub workers: usize,
}

impl Default for ResolvedScheduleConfig {
    fn default() -> Self {
        Self {
            dns_check_offsets: [5, 30, 60, 120].iter().map(|m| mins(*m)).collect(),
            retry_count: 3,
            retry_backoff: mins(5),
            renewal_interval: Duration::from_secs(24 * 3600),
            pending_sweep: mins(30),
            workers: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedMonitorConfig {
    pub invalid_host_threshold: u32,
    pub window: Duration,
}

impl Default for ResolvedMonitorConfig {
    fn default() -> Self {
        Self {
            invalid_host_threshold: 20,
            window: Duration::from_secs(600),
        }
    }
}

fn mins(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// Longest delay a job or timer may be scheduled with
const MAX_SCHEDULE_DELAY_SECS: u64 = 365 * 24 * 3600;

/// Convert `value` units of `unit_secs` seconds, bounded by one year
fn bounded(key: &str, value: u64, unit_secs: u64) -> anyhow::Result<Duration> {
    value
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_SCHEDULE_DELAY_SECS)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("{} = {} is longer than one year", key, value))
}

/// Like [`bounded`] but zero is rejected, for timer periods
fn period(key: &str, value: u64, unit_secs: u64) -> anyhow::Result<Duration> {
    if value == 0 {
        anyhow::bail!("{} must be greater than 0", key);
    }
    bounded(key, value, unit_secs)
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Get environment variable as u16
fn get_env_u16(name: &str) -> Option<u16> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_u64(name: &str) -> Option<u64> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get a comma-separated environment variable as a list
fn get_env_list(name: &str) -> Option<Vec<String>> {
    get_env(name).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Auto-detect public IP address using external services
fn detect_public_ip() -> anyhow::Result<IpAddr> {
    // Try multiple services in case one is down
    let services = [
        "https://api.ipify.org",
        "https://ifconfig.me/ip",
        "https://icanhazip.com",
    ];

    for service in services {
        match ureq::get(service).call() {
            Ok(mut response) => {
                if let Ok(body) = response.body_mut().read_to_string() {
                    if let Ok(ip) = body.trim().parse::<IpAddr>() {
                        tracing::info!("Detected public IP: {}", ip);
                        return Ok(ip);
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Failed to get IP from {}: {}", service, e);
            }
        }
    }

    anyhow::bail!(
        "Could not auto-detect server IP. Set SITEHOST_SERVER_IP or dns.server_ip in config"
    )
}

/// Parse a nameserver as `ip` or `ip:port`
fn parse_nameserver(raw: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = raw
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid nameserver address: {}", raw))?;
    Ok(SocketAddr::new(ip, 53))
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        // HTTP port: ENV > config > default 8080
        let http_port = get_env_u16("HTTP_PORT").or(self.http_port).unwrap_or(8080);

        // HTTPS port: ENV > config > disabled
        let https_port = get_env_u16("HTTPS_PORT").or(self.https_port);

        // Control plane: ENV > config > default 127.0.0.1:9090
        let control_addr = get_env("CONTROL_ADDR")
            .or(self.control_addr)
            .unwrap_or_else(|| "127.0.0.1:9090".to_string());
        let control_addr: SocketAddr = control_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid control_addr {}: {}", control_addr, e))?;

        // Base domain: ENV > config > required
        let base_domain = get_env("BASE_DOMAIN")
            .or(self.base_domain)
            .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Base domain required. Set SITEHOST_BASE_DOMAIN or base_domain in config"
                )
            })?;
        if !sitehost_core::validate_hostname(&base_domain) {
            anyhow::bail!("Base domain is not a valid hostname: {}", base_domain);
        }

        let reserved_labels = get_env_list("RESERVED_LABELS")
            .or(self.reserved_labels)
            .unwrap_or_else(|| {
                DEFAULT_RESERVED_LABELS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        let registry_path = get_env("REGISTRY_PATH")
            .or(self.registry_path)
            .unwrap_or_else(|| "tenants.json".to_string())
            .into();

        let upstream = get_env("UPSTREAM")
            .or(self.upstream)
            .map(|u| u.trim_end_matches('/').to_string());

        let dns = Self::resolve_dns(self.dns.unwrap_or_default())?;
        let acme = Self::resolve_acme(self.acme.unwrap_or_default())?;
        let schedule = Self::resolve_schedule(self.schedule.unwrap_or_default())?;

        let webhook_url =
            get_env("WEBHOOK_URL").or(self.notifier.and_then(|n| n.webhook_url));

        let monitor_config = self.monitor.unwrap_or_default();
        let defaults = ResolvedMonitorConfig::default();
        let monitor = ResolvedMonitorConfig {
            invalid_host_threshold: get_env("INVALID_HOST_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .or(monitor_config.invalid_host_threshold)
                .unwrap_or(defaults.invalid_host_threshold),
            window: get_env_u64("MONITOR_WINDOW_SECS")
                .or(monitor_config.window_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
        };

        Ok(ResolvedServerConfig {
            http_port,
            https_port,
            control_addr,
            base_domain,
            reserved_labels,
            registry_path,
            upstream,
            dns,
            acme,
            schedule,
            webhook_url,
            monitor,
        })
    }

    fn resolve_dns(config: DnsConfig) -> anyhow::Result<ResolvedDnsConfig> {
        let proxy_hostname = get_env("PROXY_HOSTNAME")
            .or(config.proxy_hostname)
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase());

        // Server IP: ENV > config > auto-detect (only when no proxy hostname)
        let server_ip = match get_env("SERVER_IP").or(config.server_ip) {
            Some(ip) => Some(
                ip.trim()
                    .parse::<IpAddr>()
                    .map_err(|e| anyhow::anyhow!("Invalid server IP {}: {}", ip, e))?,
            ),
            None if proxy_hostname.is_none() => {
                tracing::info!("Server IP not configured, auto-detecting...");
                Some(detect_public_ip()?)
            }
            None => None,
        };

        let nameservers = get_env_list("NAMESERVERS")
            .or(config.nameservers)
            .unwrap_or_default()
            .iter()
            .map(|ns| parse_nameserver(ns))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let timeout = get_env_u64("DNS_TIMEOUT_SECS")
            .or(config.timeout_secs)
            .unwrap_or(5);

        Ok(ResolvedDnsConfig {
            server_ip,
            proxy_hostname,
            nameservers,
            timeout: Duration::from_secs(timeout),
        })
    }

    fn resolve_acme(config: AcmeConfig) -> anyhow::Result<ResolvedAcmeConfig> {
        let contact_email = get_env("ACME_EMAIL")
            .or(config.contact_email)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "ACME contact email required. Set SITEHOST_ACME_EMAIL or acme.contact_email in config"
                )
            })?;

        let reload_command = get_env("RELOAD_COMMAND")
            .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .or(config.reload_command)
            .filter(|argv| !argv.is_empty());

        let fallback_cert = get_env("FALLBACK_CERT").or(config.fallback_cert);
        let fallback_key = get_env("FALLBACK_KEY").or(config.fallback_key);
        if fallback_cert.is_some() != fallback_key.is_some() {
            anyhow::bail!("acme.fallback_cert and acme.fallback_key must be set together");
        }

        Ok(ResolvedAcmeConfig {
            certbot_path: get_env("CERTBOT_PATH")
                .or(config.certbot_path)
                .unwrap_or_else(|| "certbot".to_string())
                .into(),
            webroot: get_env("ACME_WEBROOT")
                .or(config.webroot)
                .unwrap_or_else(|| "/var/www/certbot".to_string())
                .into(),
            live_dir: get_env("ACME_LIVE_DIR")
                .or(config.live_dir)
                .unwrap_or_else(|| "/etc/letsencrypt/live".to_string())
                .into(),
            contact_email,
            issue_timeout: Duration::from_secs(
                get_env_u64("ISSUE_TIMEOUT_SECS")
                    .or(config.issue_timeout_secs)
                    .unwrap_or(120),
            ),
            renew_timeout: Duration::from_secs(
                get_env_u64("RENEW_TIMEOUT_SECS")
                    .or(config.renew_timeout_secs)
                    .unwrap_or(600),
            ),
            reload_command,
            fallback_cert: fallback_cert.map(PathBuf::from),
            fallback_key: fallback_key.map(PathBuf::from),
        })
    }

    fn resolve_schedule(config: ScheduleConfig) -> anyhow::Result<ResolvedScheduleConfig> {
        let defaults = ResolvedScheduleConfig::default();

        let dns_check_offsets = match get_env_list("DNS_CHECK_OFFSETS_MINS") {
            Some(list) => list
                .iter()
                .map(|m| {
                    m.parse::<u64>()
                        .map_err(|_| anyhow::anyhow!("Invalid DNS check offset: {}", m))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => config
                .dns_check_offsets_mins
                .unwrap_or_else(|| vec![5, 30, 60, 120]),
        };
        if dns_check_offsets.is_empty() {
            anyhow::bail!("schedule.dns_check_offsets_mins must not be empty");
        }

        let retry_count = get_env("RETRY_COUNT")
            .and_then(|v| v.parse().ok())
            .or(config.retry_count)
            .unwrap_or(defaults.retry_count);
        if retry_count == 0 {
            anyhow::bail!("schedule.retry_count must be at least 1");
        }

        let workers = get_env("WORKERS")
            .and_then(|v| v.parse().ok())
            .or(config.workers)
            .unwrap_or(defaults.workers)
            .max(1);

        let dns_check_offsets = dns_check_offsets
            .into_iter()
            .map(|m| bounded("schedule.dns_check_offsets_mins", m, 60))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let retry_backoff = match get_env_u64("RETRY_BACKOFF_MINS").or(config.retry_backoff_mins) {
            Some(m) => bounded("schedule.retry_backoff_mins", m, 60)?,
            None => defaults.retry_backoff,
        };
        let renewal_interval =
            match get_env_u64("RENEWAL_INTERVAL_HOURS").or(config.renewal_interval_hours) {
                Some(h) => period("schedule.renewal_interval_hours", h, 3600)?,
                None => defaults.renewal_interval,
            };
        let pending_sweep = match get_env_u64("PENDING_SWEEP_MINS").or(config.pending_sweep_mins) {
            Some(m) => period("schedule.pending_sweep_mins", m, 60)?,
            None => defaults.pending_sweep,
        };

        Ok(ResolvedScheduleConfig {
            dns_check_offsets,
            retry_count,
            retry_backoff,
            renewal_interval,
            pending_sweep,
            workers,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        let config = Self::load(path);
        config.resolve()
    }
}
