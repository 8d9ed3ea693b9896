//! Reloading whatever serves certificates after they change

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sitehost_common::{CertificateStore, TlsError};
use thiserror::Error;
use tokio::process::Command;

const RELOAD_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Failed to run reload command {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Reload command failed: {0}")]
    Command(String),

    #[error("Reload command timed out")]
    Timeout,

    #[error("Reload task panicked")]
    Join,
}

#[async_trait]
pub trait FrontendReloader: Send + Sync {
    async fn reload(&self) -> Result<(), ReloadError>;
}

/// Rescans the in-process SNI certificate store
pub struct StoreReloader {
    store: Arc<CertificateStore>,
}

impl StoreReloader {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FrontendReloader for StoreReloader {
    async fn reload(&self) -> Result<(), ReloadError> {
        let store = self.store.clone();
        let count = tokio::task::spawn_blocking(move || store.reload())
            .await
            .map_err(|_| ReloadError::Join)??;
        tracing::info!("Certificate store reloaded ({} certificates)", count);
        Ok(())
    }
}

/// Runs an external command such as `nginx -s reload`
pub struct CommandReloader {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandReloader {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: RELOAD_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FrontendReloader for CommandReloader {
    async fn reload(&self) -> Result<(), ReloadError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ReloadError::Command("empty reload command".to_string()));
        };

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ReloadError::Spawn {
                    program: program.clone(),
                    source,
                })
            }
            Err(_) => return Err(ReloadError::Timeout),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReloadError::Command(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        tracing::info!("Front end reloaded with {}", self.argv.join(" "));
        Ok(())
    }
}

/// Runs several reloaders in order, continuing past failures
pub struct ReloadChain {
    reloaders: Vec<Arc<dyn FrontendReloader>>,
}

impl ReloadChain {
    pub fn new(reloaders: Vec<Arc<dyn FrontendReloader>>) -> Self {
        Self { reloaders }
    }
}

#[async_trait]
impl FrontendReloader for ReloadChain {
    async fn reload(&self) -> Result<(), ReloadError> {
        let mut first_error = None;
        for reloader in &self.reloaders {
            if let Err(e) = reloader.reload().await {
                tracing::warn!("Reload step failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
