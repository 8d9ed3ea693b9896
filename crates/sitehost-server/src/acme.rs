//! ACME certificate issuance through the certbot CLI
//!
//! Every certbot run is a bounded subprocess: it is killed when its timeout
//! elapses and the timeout is reported as a retryable failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sitehost_common::FULLCHAIN_FILE;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ResolvedAcmeConfig;

const INFO_TIMEOUT: Duration = Duration::from_secs(30);
const DELETE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Refusing to request a certificate for invalid domain {0:?}")]
    InvalidDomain(String),

    #[error("Invalid ACME contact email {0:?}")]
    InvalidEmail(String),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("certbot timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("certbot failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a bulk renewal, keyed by live-directory name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewReport {
    pub renewed: Vec<String>,
    pub failed: Vec<String>,
}

impl RenewReport {
    pub fn renewed_count(&self) -> usize {
        self.renewed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renewed.is_empty() && self.failed.is_empty()
    }
}

/// Details reported by `certbot certificates`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub domain: String,
    pub has_certificate: bool,
    pub expiry_date: Option<String>,
}

/// External ACME client
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Obtain a certificate for `domain` and `www.<domain>`
    async fn issue(&self, domain: &str, contact_email: &str) -> Result<String, AcmeError>;

    /// Renew one certificate; "not yet due" counts as success
    async fn renew(&self, domain: &str) -> Result<String, AcmeError>;

    /// Renew every certificate that is due
    async fn renew_all(&self) -> Result<RenewReport, AcmeError>;
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// certbot driven in webroot mode
pub struct CertbotClient {
    /// Program followed by any leading arguments
    command: Vec<String>,
    webroot: PathBuf,
    live_dir: PathBuf,
    issue_timeout: Duration,
    renew_timeout: Duration,
}

impl CertbotClient {
    pub fn new(config: &ResolvedAcmeConfig) -> Self {
        Self {
            command: vec![config.certbot_path.to_string_lossy().into_owned()],
            webroot: config.webroot.clone(),
            live_dir: config.live_dir.clone(),
            issue_timeout: config.issue_timeout,
            renew_timeout: config.renew_timeout,
        }
    }

    /// Run certbot through a wrapper, e.g. `["sudo", "certbot"]`
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.command = command;
        }
        self
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Whether a certificate for `domain` is already on disk
    pub fn has_certificate(&self, domain: &str) -> bool {
        self.live_dir.join(domain).join(FULLCHAIN_FILE).exists()
    }

    pub async fn certificate_info(&self, domain: &str) -> Result<CertificateInfo, AcmeError> {
        check_domain(domain)?;
        let output = self
            .run(&["certificates", "-d", domain], INFO_TIMEOUT)
            .await?;
        if !output.success {
            return Err(AcmeError::Failed(output.message()));
        }

        Ok(CertificateInfo {
            domain: domain.to_string(),
            has_certificate: self.has_certificate(domain),
            expiry_date: parse_expiry_date(&output.stdout),
        })
    }

    /// Delete a certificate; a missing certificate is not an error
    pub async fn delete(&self, domain: &str) -> Result<String, AcmeError> {
        check_domain(domain)?;
        if !self.has_certificate(domain) {
            return Ok(format!("No certificate for {}", domain));
        }

        tracing::info!("Deleting certificate for {}", domain);
        let output = self
            .run(
                &["delete", "--cert-name", domain, "--non-interactive"],
                DELETE_TIMEOUT,
            )
            .await?;
        if output.success {
            Ok(format!("Certificate for {} deleted", domain))
        } else {
            Err(AcmeError::Failed(output.message()))
        }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput, AcmeError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| AcmeError::Failed("certbot command is empty".to_string()))?;

        tracing::debug!("Running {} {:?}", program, args);

        let child = Command::new(program)
            .args(leading)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(AcmeError::Spawn {
                    program: program.clone(),
                    source,
                })
            }
            Err(_) => return Err(AcmeError::Timeout(timeout)),
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl AcmeClient for CertbotClient {
    async fn issue(&self, domain: &str, contact_email: &str) -> Result<String, AcmeError> {
        check_domain(domain)?;
        check_email(contact_email)?;

        if self.has_certificate(domain) {
            tracing::info!("Certificate already exists for {}", domain);
            return Ok(format!("Certificate already exists for {}", domain));
        }

        tokio::fs::create_dir_all(&self.webroot).await?;
        let webroot = self.webroot.to_string_lossy();

        let www_alias = format!("www.{}", domain);
        let mut args = vec!["certonly", "--webroot", "-w", &*webroot, "-d", domain];
        if !domain.starts_with("www.") {
            args.extend(["-d", www_alias.as_str()]);
        }
        args.extend([
            "--non-interactive",
            "--agree-tos",
            "--email",
            contact_email,
        ]);

        tracing::info!("Requesting certificate for {}", domain);
        let output = self.run(&args, self.issue_timeout).await?;

        if output.success {
            tracing::info!("Certificate issued for {}", domain);
            Ok(format!("Certificate issued for {}", domain))
        } else {
            let message = output.message();
            tracing::error!("certbot failed for {}: {}", domain, message);
            Err(AcmeError::Failed(message))
        }
    }

    async fn renew(&self, domain: &str) -> Result<String, AcmeError> {
        check_domain(domain)?;
        if !self.has_certificate(domain) {
            return Err(AcmeError::Failed(format!(
                "{} has no certificate to renew",
                domain
            )));
        }

        tracing::info!("Renewing certificate for {}", domain);
        let output = self
            .run(&["renew", "--cert-name", domain], self.issue_timeout)
            .await?;

        if output.stdout.contains("not yet due for renewal") {
            tracing::info!("Certificate for {} is not yet due for renewal", domain);
            return Ok("Certificate not yet due for renewal".to_string());
        }
        if output.success {
            Ok(format!("Certificate renewed for {}", domain))
        } else {
            Err(AcmeError::Failed(output.message()))
        }
    }

    async fn renew_all(&self) -> Result<RenewReport, AcmeError> {
        tracing::info!("Renewing all due certificates");
        let output = self.run(&["renew"], self.renew_timeout).await?;
        let report = parse_renew_output(&output.stdout);

        // certbot exits non-zero when any single renewal fails
        if !output.success && report.is_empty() {
            return Err(AcmeError::Failed(output.message()));
        }

        tracing::info!(
            "Renewal finished: {} renewed, {} failed",
            report.renewed_count(),
            report.failed_count()
        );
        Ok(report)
    }
}

/// Reject anything that is not a plain hostname before it reaches argv
fn check_domain(domain: &str) -> Result<(), AcmeError> {
    if domain == "localhost"
        || domain == "127.0.0.1"
        || !sitehost_core::validate_hostname(domain)
    {
        return Err(AcmeError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

fn check_email(email: &str) -> Result<(), AcmeError> {
    let valid = !email.starts_with('-')
        && email.contains('@')
        && !email.chars().any(|c| c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(AcmeError::InvalidEmail(email.to_string()))
    }
}

/// Collect the `(success)` / `(failure)` lines of `certbot renew`
fn parse_renew_output(stdout: &str) -> RenewReport {
    let mut report = RenewReport::default();

    for line in stdout.lines() {
        let line = line.trim();
        let (path, renewed) = if let Some(path) = line.strip_suffix("(success)") {
            (path, true)
        } else if let Some(path) = line.strip_suffix("(failure)") {
            (path, false)
        } else {
            continue;
        };

        let Some(name) = Path::new(path.trim())
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
        else {
            continue;
        };

        let bucket = if renewed {
            &mut report.renewed
        } else {
            &mut report.failed
        };
        if !bucket.iter().any(|n| n == name) {
            bucket.push(name.to_string());
        }
    }

    report
}

fn parse_expiry_date(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.split_once("Expiry Date:"))
        .map(|(_, rest)| rest.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENEW_OUTPUT: &str = "\
Saving debug log to /var/log/letsencrypt/letsencrypt.log

Processing /etc/letsencrypt/renewal/shop.test.conf
Renewing an existing certificate for shop.test and www.shop.test

Processing /etc/letsencrypt/renewal/blog.test.conf
Failed to renew certificate blog.test with error: Some challenges have failed.

Processing /etc/letsencrypt/renewal/docs.test.conf
Certificate not yet due for renewal

The following renewals succeeded:
  /etc/letsencrypt/live/shop.test/fullchain.pem (success)

The following renewals failed:
  /etc/letsencrypt/live/blog.test/fullchain.pem (failure)
";

    #[test]
    fn test_parse_renew_output() {
        let report = parse_renew_output(RENEW_OUTPUT);
        assert_eq!(report.renewed, vec!["shop.test"]);
        assert_eq!(report.failed, vec!["blog.test"]);
        assert_eq!(report.renewed_count(), 1);
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn test_parse_renew_output_nothing_due() {
        let report = parse_renew_output("Certificate not yet due for renewal\nNo renewals were attempted.\n");
        assert!(report.is_empty());
    }

    #[test]
    fn test_parse_expiry_date() {
        let out = "  Certificate Name: shop.test\n    Expiry Date: 2026-12-01 10:00:00+00:00 (VALID: 45 days)\n";
        assert_eq!(
            parse_expiry_date(out).as_deref(),
            Some("2026-12-01 10:00:00+00:00 (VALID: 45 days)")
        );
        assert_eq!(parse_expiry_date("No certificates found."), None);
    }

    #[test]
    fn test_check_domain() {
        assert!(check_domain("shop.test").is_ok());
        assert!(check_domain("localhost").is_err());
        assert!(check_domain("shop.test --dry-run").is_err());
        assert!(check_domain("-d evil.test").is_err());
        assert!(check_email("ops@sites.test").is_ok());
        assert!(check_email("--staging").is_err());
        assert!(check_email("ops @sites.test").is_err());
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;

        /// Client that runs `sh -c <script>` in place of certbot; the script
        /// sees certbot's arguments as "$@"
        fn client(tmp: &Path, script: &str, timeout: Duration) -> CertbotClient {
            let config = ResolvedAcmeConfig {
                certbot_path: "certbot".into(),
                webroot: tmp.join("webroot"),
                live_dir: tmp.join("live"),
                contact_email: "ops@sites.test".into(),
                issue_timeout: timeout,
                renew_timeout: timeout,
                reload_command: None,
                fallback_cert: None,
                fallback_key: None,
            };
            CertbotClient::new(&config).with_command(vec![
                "/bin/sh".into(),
                "-c".into(),
                script.into(),
                "certbot".into(),
            ])
        }

        #[tokio::test]
        async fn test_issue_passes_arguments() {
            let tmp = tempfile::tempdir().unwrap();
            let args_file = tmp.path().join("args");
            let script = format!("echo \"$@\" > {}", args_file.display());
            let client = client(tmp.path(), &script, Duration::from_secs(10));

            client.issue("shop.test", "owner@shop.test").await.unwrap();

            let args = std::fs::read_to_string(&args_file).unwrap();
            assert!(args.starts_with("certonly --webroot -w"));
            assert!(args.contains("-d shop.test -d www.shop.test"));
            assert!(args.contains("--non-interactive --agree-tos --email owner@shop.test"));
            assert!(tmp.path().join("webroot").is_dir());
        }

        #[tokio::test]
        async fn test_issue_skips_existing_certificate() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = tmp.path().join("live").join("shop.test");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(FULLCHAIN_FILE), "cert").unwrap();

            let client = client(tmp.path(), "exit 1", Duration::from_secs(10));
            let message = client.issue("shop.test", "ops@sites.test").await.unwrap();
            assert!(message.contains("already exists"));
        }

        #[tokio::test]
        async fn test_issue_failure_reports_stderr() {
            let tmp = tempfile::tempdir().unwrap();
            let client = client(
                tmp.path(),
                "echo 'Challenge failed for domain shop.test' >&2; exit 1",
                Duration::from_secs(10),
            );
            let err = client.issue("shop.test", "ops@sites.test").await.unwrap_err();
            match err {
                AcmeError::Failed(message) => {
                    assert_eq!(message, "Challenge failed for domain shop.test")
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_timeout_kills_certbot() {
            let tmp = tempfile::tempdir().unwrap();
            let client = client(tmp.path(), "sleep 5", Duration::from_millis(200));
            let err = client.issue("shop.test", "ops@sites.test").await.unwrap_err();
            assert!(matches!(err, AcmeError::Timeout(_)));
        }

        #[tokio::test]
        async fn test_missing_binary_is_spawn_error() {
            let tmp = tempfile::tempdir().unwrap();
            let client = client(tmp.path(), "", Duration::from_secs(1))
                .with_command(vec!["/nonexistent/certbot".into()]);
            let err = client.issue("shop.test", "ops@sites.test").await.unwrap_err();
            assert!(matches!(err, AcmeError::Spawn { .. }));
        }

        #[tokio::test]
        async fn test_renew_all_with_partial_failure() {
            let tmp = tempfile::tempdir().unwrap();
            let script = format!("cat <<'EOF'\n{}EOF\nexit 1", RENEW_OUTPUT);
            let client = client(tmp.path(), &script, Duration::from_secs(10));

            let report = client.renew_all().await.unwrap();
            assert_eq!(report.renewed, vec!["shop.test"]);
            assert_eq!(report.failed, vec!["blog.test"]);
        }

        #[tokio::test]
        async fn test_renew_all_tool_failure() {
            let tmp = tempfile::tempdir().unwrap();
            let client = client(
                tmp.path(),
                "echo 'Another instance of Certbot is already running.' >&2; exit 1",
                Duration::from_secs(10),
            );
            assert!(matches!(
                client.renew_all().await,
                Err(AcmeError::Failed(_))
            ));
        }

        #[tokio::test]
        async fn test_renew_not_yet_due_is_success() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = tmp.path().join("live").join("shop.test");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(FULLCHAIN_FILE), "cert").unwrap();

            let client = client(
                tmp.path(),
                "echo 'Certificate not yet due for renewal'",
                Duration::from_secs(10),
            );
            assert!(client.renew("shop.test").await.is_ok());
        }
    }
}
