//! Paging on rejections that need an operator
//!
//! Ambiguous tenant configuration pages once per host per window. Invalid
//! hosts page once per remote address when a window's count reaches the
//! threshold. Everything else is left to the request log.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sitehost_core::RejectReason;
use tokio::time::Instant;

use crate::notifier::Notifier;

struct Window {
    started: Instant,
    count: u32,
    paged: bool,
}

pub struct RejectionMonitor {
    notifier: Arc<dyn Notifier>,
    threshold: u32,
    window: Duration,
    ambiguous: DashMap<String, Instant>,
    invalid: DashMap<IpAddr, Window>,
}

impl RejectionMonitor {
    pub fn new(notifier: Arc<dyn Notifier>, threshold: u32, window: Duration) -> Self {
        Self {
            notifier,
            threshold: threshold.max(1),
            window,
            ambiguous: DashMap::new(),
            invalid: DashMap::new(),
        }
    }

    /// Record a rejection; returns whether it paged
    pub fn record(&self, host: &str, remote: IpAddr, reason: RejectReason) -> bool {
        match reason {
            RejectReason::AmbiguousConfiguration => self.record_ambiguous(host),
            RejectReason::InvalidHost => self.record_invalid(host, remote),
            RejectReason::UnregisteredDomain | RejectReason::RegistryUnavailable => false,
        }
    }

    fn record_ambiguous(&self, host: &str) -> bool {
        let now = Instant::now();
        let mut due = false;
        self.ambiguous
            .entry(host.to_string())
            .and_modify(|last| {
                if now.duration_since(*last) >= self.window {
                    *last = now;
                    due = true;
                }
            })
            .or_insert_with(|| {
                due = true;
                now
            });

        if due {
            self.page(
                &format!("Ambiguous tenant configuration for {}", host),
                format!(
                    "More than one active tenant claims {}. Requests for it are rejected until the registry is fixed.",
                    host
                ),
            );
        }
        due
    }

    fn record_invalid(&self, host: &str, remote: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.invalid.entry(remote).or_insert_with(|| Window {
            started: now,
            count: 0,
            paged: false,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
            entry.paged = false;
        }
        entry.count += 1;

        if entry.count < self.threshold || entry.paged {
            return false;
        }
        entry.paged = true;
        let count = entry.count;
        drop(entry);

        self.page(
            &format!("Repeated invalid hosts from {}", remote),
            format!(
                "{} requests with invalid Host headers from {} within {}s (latest: {:?})",
                count,
                remote,
                self.window.as_secs(),
                host
            ),
        );
        true
    }

    fn page(&self, subject: &str, body: String) {
        tracing::error!(page = true, "{}", subject);
        let notifier = self.notifier.clone();
        let subject = subject.to_string();
        tokio::spawn(async move {
            notifier.notify(&subject, &body).await;
        });
    }

    /// Forget windows that ended; called periodically
    pub fn prune(&self) {
        let now = Instant::now();
        self.invalid
            .retain(|_, w| now.duration_since(w.started) < self.window);
        self.ambiguous
            .retain(|_, last| now.duration_since(*last) < self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LogNotifier;

    fn monitor(threshold: u32) -> RejectionMonitor {
        RejectionMonitor::new(Arc::new(LogNotifier), threshold, Duration::from_secs(600))
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_pages_once_per_window() {
        let m = monitor(20);
        let remote = addr("198.51.100.1");
        assert!(m.record("dup.test", remote, RejectReason::AmbiguousConfiguration));
        assert!(!m.record("dup.test", remote, RejectReason::AmbiguousConfiguration));
        assert!(m.record("other.test", remote, RejectReason::AmbiguousConfiguration));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(m.record("dup.test", remote, RejectReason::AmbiguousConfiguration));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_hosts_page_at_threshold() {
        let m = monitor(3);
        let remote = addr("198.51.100.1");
        assert!(!m.record("a\r\n", remote, RejectReason::InvalidHost));
        assert!(!m.record("a\r\n", remote, RejectReason::InvalidHost));
        assert!(m.record("a\r\n", remote, RejectReason::InvalidHost));
        assert!(!m.record("a\r\n", remote, RejectReason::InvalidHost));

        // Counted per remote address
        assert!(!m.record("a\r\n", addr("198.51.100.2"), RejectReason::InvalidHost));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(!m.record("a\r\n", remote, RejectReason::InvalidHost));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_never_pages() {
        let m = monitor(1);
        assert!(!m.record(
            "unknown.test",
            addr("198.51.100.1"),
            RejectReason::UnregisteredDomain
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune() {
        let m = monitor(5);
        m.record("x", addr("198.51.100.1"), RejectReason::InvalidHost);
        m.record("dup.test", addr("198.51.100.1"), RejectReason::AmbiguousConfiguration);
        tokio::time::advance(Duration::from_secs(601)).await;
        m.prune();
        assert!(m.invalid.is_empty());
        assert!(m.ambiguous.is_empty());
    }
}
