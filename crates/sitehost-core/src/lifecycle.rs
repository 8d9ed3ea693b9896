//! Certificate state machine
//!
//! `dns_status` / `ssl_status` and their error texts only change through
//! [`transition`]. Callers read a tenant snapshot, compute the update here and
//! write it back with a single conditional registry write.

use std::fmt;

use thiserror::Error;

use crate::tenant::{CertificateState, DnsStatus, SslStatus};

/// Maximum stored length of `dns_error` / `ssl_error`
pub const MAX_ERROR_TEXT: usize = 500;

/// Events that drive the status pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The custom domain was set, changed or cleared
    DomainChanged { domain: Option<String> },
    /// The domain resolves to this server
    DnsVerified,
    /// The domain does not resolve (or resolves elsewhere)
    DnsFailed { message: String },
    /// An issuance attempt is about to run
    IssuanceStarted,
    IssuanceSucceeded,
    /// An issuance attempt failed
    IssuanceFailed { message: String },
    /// A scheduled renewal of an active certificate failed
    RenewalFailed { message: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::DomainChanged { .. } => "domain_changed",
            LifecycleEvent::DnsVerified => "dns_verified",
            LifecycleEvent::DnsFailed { .. } => "dns_failed",
            LifecycleEvent::IssuanceStarted => "issuance_started",
            LifecycleEvent::IssuanceSucceeded => "issuance_succeeded",
            LifecycleEvent::IssuanceFailed { .. } => "issuance_failed",
            LifecycleEvent::RenewalFailed { .. } => "renewal_failed",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Partial write of the status pair
///
/// `None` leaves a field untouched; `Some(None)` clears an error text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub dns_status: Option<DnsStatus>,
    pub dns_error: Option<Option<String>>,
    pub ssl_status: Option<SslStatus>,
    pub ssl_error: Option<Option<String>>,
}

impl StatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.dns_status.is_none()
            && self.dns_error.is_none()
            && self.ssl_status.is_none()
            && self.ssl_error.is_none()
    }

    /// Apply this update to a state in place
    pub fn apply_to(&self, state: &mut CertificateState) {
        if let Some(status) = self.dns_status {
            state.dns_status = status;
        }
        if let Some(error) = &self.dns_error {
            state.dns_error = error.clone();
        }
        if let Some(status) = self.ssl_status {
            state.ssl_status = status;
        }
        if let Some(error) = &self.ssl_error {
            state.ssl_error = error.clone();
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{event} is not valid while dns_status={dns_status} ssl_status={ssl_status}")]
pub struct TransitionError {
    pub event: &'static str,
    pub dns_status: DnsStatus,
    pub ssl_status: SslStatus,
}

/// Compute the status update for `event` applied to `state`
pub fn transition(
    state: &CertificateState,
    event: &LifecycleEvent,
) -> Result<StatusUpdate, TransitionError> {
    let invalid = || TransitionError {
        event: event.name(),
        dns_status: state.dns_status,
        ssl_status: state.ssl_status,
    };

    match event {
        LifecycleEvent::DomainChanged { .. } => Ok(reset()),

        LifecycleEvent::DnsVerified => {
            if state.dns_status == DnsStatus::Ok {
                return Err(invalid());
            }
            let mut update = StatusUpdate {
                dns_status: Some(DnsStatus::Ok),
                dns_error: Some(None),
                ..Default::default()
            };
            if matches!(state.ssl_status, SslStatus::None | SslStatus::Error) {
                update.ssl_status = Some(SslStatus::Generating);
                update.ssl_error = Some(None);
            }
            Ok(update)
        }

        LifecycleEvent::DnsFailed { message } => Ok(StatusUpdate {
            dns_status: Some(DnsStatus::Error),
            dns_error: Some(Some(truncate_error(message))),
            ..Default::default()
        }),

        LifecycleEvent::IssuanceStarted => match state.ssl_status {
            SslStatus::Generating => Ok(StatusUpdate::default()),
            SslStatus::None | SslStatus::Error if state.dns_status == DnsStatus::Ok => {
                Ok(StatusUpdate {
                    ssl_status: Some(SslStatus::Generating),
                    ..Default::default()
                })
            }
            _ => Err(invalid()),
        },

        LifecycleEvent::IssuanceSucceeded => match state.ssl_status {
            SslStatus::Generating => Ok(StatusUpdate {
                ssl_status: Some(SslStatus::Active),
                ssl_error: Some(None),
                ..Default::default()
            }),
            _ => Err(invalid()),
        },

        LifecycleEvent::IssuanceFailed { message } => match state.ssl_status {
            SslStatus::Generating => Ok(StatusUpdate {
                ssl_status: Some(SslStatus::Error),
                ssl_error: Some(Some(truncate_error(message))),
                ..Default::default()
            }),
            _ => Err(invalid()),
        },

        LifecycleEvent::RenewalFailed { message } => match state.ssl_status {
            SslStatus::Active => Ok(StatusUpdate {
                ssl_status: Some(SslStatus::Error),
                ssl_error: Some(Some(truncate_error(message))),
                ..Default::default()
            }),
            _ => Err(invalid()),
        },
    }
}

/// Status written whenever the custom domain value changes
fn reset() -> StatusUpdate {
    StatusUpdate {
        dns_status: Some(DnsStatus::Pending),
        dns_error: Some(None),
        ssl_status: Some(SslStatus::None),
        ssl_error: Some(None),
    }
}

/// Truncate an error text to [`MAX_ERROR_TEXT`] characters
pub fn truncate_error(message: &str) -> String {
    let message = message.trim();
    match message.char_indices().nth(MAX_ERROR_TEXT) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
