//! Recording notifier and reloader

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sitehost_server::{FrontendReloader, Notifier, ReloadError};

/// Keeps every notification for assertions
#[derive(Default)]
pub struct RecordingNotifier {
    messages: RwLock<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All `(subject, body)` pairs sent so far
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.read().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.messages.read().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages
            .read()
            .iter()
            .filter(|(s, _)| s.contains(needle))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        tracing::debug!("Notification: {}", subject);
        self.messages
            .write()
            .push((subject.to_string(), body.to_string()));
    }
}

/// Counts front-end reloads
#[derive(Default)]
pub struct CountingReloader {
    reloads: AtomicUsize,
}

impl CountingReloader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrontendReloader for CountingReloader {
    async fn reload(&self) -> Result<(), ReloadError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
