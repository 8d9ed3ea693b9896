//! sitehost server library
//!
//! The request gate, the control plane and the certificate lifecycle
//! machinery. The binary wires these together; the e2e crate drives them
//! directly.

mod acme;
mod config;
mod control_plane;
mod dns;
mod http_plane;
mod monitor;
mod notifier;
mod queue;
mod registry;
mod reload;
mod scheduler;
mod worker;

// Re-export public types
pub use acme::{AcmeClient, AcmeError, CertbotClient, CertificateInfo, RenewReport};
pub use config::{
    ResolvedAcmeConfig, ResolvedDnsConfig, ResolvedMonitorConfig, ResolvedScheduleConfig,
    ResolvedServerConfig, ServerConfig,
};
pub use control_plane::{ControlError, ControlPlane};
pub use dns::{DnsCheckError, DnsTarget, DnsVerifier, HickoryDnsVerifier};
pub use http_plane::{HttpGate, HOST_KIND_HEADER, TENANT_HEADER};
pub use monitor::RejectionMonitor;
pub use notifier::{LogNotifier, Notifier, WebhookNotifier};
pub use queue::{Dispatcher, JobHandler, MemoryQueue, QueueError, RecordingQueue, TaskQueue};
pub use registry::JsonFileRegistry;
pub use reload::{CommandReloader, FrontendReloader, ReloadChain, ReloadError, StoreReloader};
pub use scheduler::{run_periodic, DomainScheduler, ScheduleError};
pub use worker::{CertificateWorker, WorkerSettings};
