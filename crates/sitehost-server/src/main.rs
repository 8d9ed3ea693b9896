use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sitehost_common::{load_certified_key, CertificateStore};
use sitehost_core::{Job, ResolutionOutcome, ResolverConfig, TenantRegistry, TenantResolver};
use sitehost_server::{
    run_periodic, CertbotClient, CertificateWorker, CommandReloader, ControlPlane,
    DnsTarget, DnsVerifier, DomainScheduler, FrontendReloader, HickoryDnsVerifier, HttpGate,
    JobHandler, JsonFileRegistry, LogNotifier, MemoryQueue, Notifier, RejectionMonitor, ReloadChain,
    ResolvedServerConfig, ServerConfig, StoreReloader, TaskQueue, WebhookNotifier,
    WorkerSettings,
};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

/// Tenant host gate and certificate lifecycle server
#[derive(Parser, Debug)]
#[command(name = "sitehost-server")]
#[command(about = "Multi-tenant host resolution with automated TLS certificates")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sitehost.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gate, the control plane and the certificate worker (default)
    Serve,
    /// List tenants with their certificate status
    List,
    /// Check DNS and certificate state for a domain
    Check {
        #[arg(long)]
        domain: String,
    },
    /// Renew every due certificate now
    RenewAll,
    /// Renew the certificate of one tenant custom domain now
    Renew {
        #[arg(long)]
        domain: String,
    },
    /// Delete the certificate for a domain
    Delete {
        #[arg(long)]
        domain: String,
    },
    /// Show how a Host header would be resolved
    Resolve { host: String },
}

/// Everything the certificate worker needs
struct Lifecycle {
    registry: Arc<JsonFileRegistry>,
    resolver: Arc<TenantResolver>,
    notifier: Arc<dyn Notifier>,
    store: Arc<CertificateStore>,
    reloader: Arc<dyn FrontendReloader>,
    dns: Arc<dyn DnsVerifier>,
    acme: Arc<CertbotClient>,
}

impl Lifecycle {
    fn build(config: &ResolvedServerConfig) -> Result<Self> {
        let registry = Arc::new(
            JsonFileRegistry::open(&config.registry_path).with_context(|| {
                format!("Failed to open registry {}", config.registry_path.display())
            })?,
        );

        let resolver = Arc::new(TenantResolver::new(
            registry.clone(),
            resolver_config(config),
        ));

        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };

        let store = Arc::new(CertificateStore::new(&config.acme.live_dir));
        if let (Some(cert), Some(key)) = (&config.acme.fallback_cert, &config.acme.fallback_key) {
            let fallback =
                load_certified_key(cert, key).context("Failed to load fallback certificate")?;
            store.set_fallback(fallback);
        }
        match store.reload() {
            Ok(count) => tracing::info!("Loaded {} certificate name(s)", count),
            Err(e) => tracing::warn!("Failed to load certificates: {}", e),
        }

        let mut reloaders: Vec<Arc<dyn FrontendReloader>> =
            vec![Arc::new(StoreReloader::new(store.clone()))];
        if let Some(argv) = &config.acme.reload_command {
            reloaders.push(Arc::new(CommandReloader::new(argv.clone())));
        }
        let reloader: Arc<dyn FrontendReloader> = Arc::new(ReloadChain::new(reloaders));

        let target = DnsTarget {
            ip: config.dns.server_ip,
            proxy_hostname: config.dns.proxy_hostname.clone(),
        };
        tracing::info!("Custom domains must resolve to {}", target);
        let dns: Arc<dyn DnsVerifier> = Arc::new(HickoryDnsVerifier::new(
            target,
            &config.dns.nameservers,
            config.dns.timeout,
        ));

        let acme = Arc::new(CertbotClient::new(&config.acme));

        Ok(Self {
            registry,
            resolver,
            notifier,
            store,
            reloader,
            dns,
            acme,
        })
    }

    fn worker(&self, config: &ResolvedServerConfig, queue: Arc<dyn TaskQueue>) -> CertificateWorker {
        CertificateWorker::new(
            self.registry.clone(),
            queue,
            self.dns.clone(),
            self.acme.clone(),
            self.notifier.clone(),
            self.reloader.clone(),
            WorkerSettings {
                base_domain: config.base_domain.clone(),
                default_contact_email: config.acme.contact_email.clone(),
                retry_count: config.schedule.retry_count,
                retry_backoff: config.schedule.retry_backoff,
            },
        )
    }
}

/// The server's own IP is a system host alongside the platform names
fn resolver_config(config: &ResolvedServerConfig) -> ResolverConfig {
    let mut resolver_config = ResolverConfig::new(config.base_domain.clone());
    resolver_config.reserved_labels = config.reserved_labels.clone();
    if let Some(ip) = config.dns.server_ip {
        resolver_config.extra_system_hosts.push(ip.to_string());
    }
    resolver_config
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sitehost_server=info".parse()?)
                .add_directive("sitehost_core=info".parse()?)
                .add_directive("sitehost_common=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::List => list(&config),
        Command::Check { domain } => check(&config, &domain).await,
        Command::RenewAll => renew_all(&config).await,
        Command::Renew { domain } => renew(&config, &domain).await,
        Command::Delete { domain } => delete(&config, &domain).await,
        Command::Resolve { host } => resolve(&config, &host),
    }
}

async fn serve(config: ResolvedServerConfig) -> Result<()> {
    tracing::info!("Base domain: {}", config.base_domain);
    tracing::info!("Registry: {}", config.registry_path.display());

    let lifecycle = Lifecycle::build(&config)?;

    let (queue, dispatcher) = MemoryQueue::new(config.schedule.workers);
    let queue: Arc<dyn TaskQueue> = Arc::new(queue);
    let worker = Arc::new(lifecycle.worker(&config, queue.clone()));

    let scheduler = Arc::new(DomainScheduler::new(
        lifecycle.registry.clone(),
        lifecycle.resolver.clone(),
        queue.clone(),
        config.schedule.dns_check_offsets.clone(),
    ));

    let monitor = Arc::new(RejectionMonitor::new(
        lifecycle.notifier.clone(),
        config.monitor.invalid_host_threshold,
        config.monitor.window,
    ));

    // Pick up domains and issuance left unfinished by a previous run
    if let Err(e) = worker.sweep_pending().await {
        tracing::warn!("Initial pending sweep failed: {}", e);
    }
    if let Err(e) = worker.resume_interrupted().await {
        tracing::warn!("Resuming interrupted issuance failed: {}", e);
    }

    let gate = HttpGate::new(
        lifecycle.resolver.clone(),
        monitor.clone(),
        config.acme.webroot.clone(),
        config.upstream.clone(),
    );
    let control_plane = ControlPlane::new(
        lifecycle.registry.clone(),
        lifecycle.resolver.clone(),
        scheduler,
        queue.clone(),
    );

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let https = match config.https_port {
        Some(port) => {
            let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
            let acceptor = TlsAcceptor::from(Arc::new(lifecycle.store.server_config()));
            Some((addr, acceptor))
        }
        None => {
            tracing::info!("HTTPS gate: disabled");
            None
        }
    };

    let https_gate = {
        let gate = gate.clone();
        async move {
            match https {
                Some((addr, acceptor)) => gate.run(addr, Some(acceptor)).await,
                None => std::future::pending().await,
            }
        }
    };

    let prune = {
        let monitor = monitor.clone();
        let period = config.monitor.window;
        async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                monitor.prune();
            }
        }
    };

    tokio::select! {
        result = gate.run(http_addr, None) => {
            tracing::error!("HTTP gate stopped: {:?}", result);
        }
        result = https_gate => {
            tracing::error!("HTTPS gate stopped: {:?}", result);
        }
        result = control_plane.run(config.control_addr) => {
            tracing::error!("Control plane stopped: {:?}", result);
        }
        _ = dispatcher.run(worker) => {
            tracing::error!("Job dispatcher stopped");
        }
        _ = run_periodic(
            queue.clone(),
            config.schedule.renewal_interval,
            config.schedule.pending_sweep,
        ) => {
            tracing::error!("Periodic scheduler stopped");
        }
        _ = prune => {}
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn list(config: &ResolvedServerConfig) -> Result<()> {
    let registry = JsonFileRegistry::open(&config.registry_path)?;
    let tenants = registry.list()?;
    if tenants.is_empty() {
        println!("No tenants");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<32}  {:<8}  {:<10}  {}",
        "ID", "SUBDOMAIN", "CUSTOM DOMAIN", "DNS", "SSL", "ACTIVE"
    );
    for tenant in tenants {
        println!(
            "{:<36}  {:<20}  {:<32}  {:<8}  {:<10}  {}",
            tenant.id.to_string(),
            tenant.subdomain,
            tenant.custom_domain.as_deref().unwrap_or("-"),
            tenant.dns_status().as_str(),
            tenant.ssl_status().as_str(),
            if tenant.is_active { "yes" } else { "no" }
        );
        if let Some(error) = &tenant.certificate.dns_error {
            println!("    dns error: {}", error);
        }
        if let Some(error) = &tenant.certificate.ssl_error {
            println!("    ssl error: {}", error);
        }
    }
    Ok(())
}

async fn check(config: &ResolvedServerConfig, domain: &str) -> Result<()> {
    let domain = sitehost_core::normalize_custom_domain(Some(domain))?
        .ok_or_else(|| anyhow::anyhow!("Domain required"))?;
    let lifecycle = Lifecycle::build(config)?;

    match lifecycle.dns.verify(&domain).await {
        Ok(()) => println!("DNS: {} points at this server", domain),
        Err(e) => println!("DNS: {}", e),
    }

    let info = lifecycle.acme.certificate_info(&domain).await?;
    if info.has_certificate {
        println!(
            "Certificate: present, expires {}",
            info.expiry_date.as_deref().unwrap_or("unknown")
        );
    } else {
        println!("Certificate: none");
    }
    Ok(())
}

async fn renew_all(config: &ResolvedServerConfig) -> Result<()> {
    let lifecycle = Lifecycle::build(config)?;
    let (queue, _dispatcher) = MemoryQueue::new(1);
    let worker = lifecycle.worker(config, Arc::new(queue));

    let report = worker.renew_all().await?;
    println!(
        "{} renewed, {} failed",
        report.renewed_count(),
        report.failed_count()
    );
    for name in &report.failed {
        println!("  failed: {}", name);
    }
    Ok(())
}

async fn renew(config: &ResolvedServerConfig, domain: &str) -> Result<()> {
    let domain = sitehost_core::normalize_custom_domain(Some(domain))?
        .ok_or_else(|| anyhow::anyhow!("Domain required"))?;
    let lifecycle = Lifecycle::build(config)?;
    let tenant = lifecycle
        .registry
        .find_by_custom_domain(&domain, false)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No tenant uses {}", domain))?;

    let (queue, _dispatcher) = MemoryQueue::new(1);
    let worker = lifecycle.worker(config, Arc::new(queue));
    worker
        .handle(Job::Renew {
            tenant_id: tenant.id,
            domain: domain.clone(),
        })
        .await?;

    let tenant = lifecycle.registry.get(tenant.id)?;
    println!("{}: ssl={}", domain, tenant.ssl_status());
    if let Some(error) = &tenant.certificate.ssl_error {
        println!("  error: {}", error);
    }
    Ok(())
}

async fn delete(config: &ResolvedServerConfig, domain: &str) -> Result<()> {
    let lifecycle = Lifecycle::build(config)?;
    let output = lifecycle.acme.delete(domain).await?;
    println!("{}", output.trim());
    lifecycle.reloader.reload().await?;
    Ok(())
}

fn resolve(config: &ResolvedServerConfig, host: &str) -> Result<()> {
    let registry = Arc::new(JsonFileRegistry::open(&config.registry_path)?);
    let resolver = TenantResolver::new(registry, resolver_config(config));

    match resolver.resolve(host, "cli") {
        ResolutionOutcome::SystemHost => println!("{}: system host", host),
        ResolutionOutcome::TenantHost { tenant } => println!(
            "{}: tenant {} ({}, {})",
            host, tenant.id, tenant.name, tenant.subdomain
        ),
        ResolutionOutcome::Rejected { reason } => println!("{}: rejected ({})", host, reason),
    }
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
