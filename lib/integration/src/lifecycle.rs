//! Integration state machine and the refresh-due decision.
//!
//! ```text
//!   pending ──bootstrap ok──▶ connected ◀──refresh ok── error
//!      │                          │                      ▲
//!      └────────── failure ───────┴──────── failure ─────┘
//!   any ──revoke──▶ disconnected ──reconnect──▶ pending
//! ```
//!
//! `error` is not terminal: the health sweep keeps retrying it.
//! `disconnected` is left only through an explicit reconnect.

use crate::credential::CredentialKind;
use crate::integration::IntegrationStatus;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Points removed from the health score per failed operation.
pub const HEALTH_PENALTY: u8 = 10;

/// Default lead time, in minutes, before expiry at which a token is refreshed.
pub const DEFAULT_REFRESH_THRESHOLD_MINUTES: i64 = 60;

/// Something that happened to an integration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    BootstrapSucceeded,
    RefreshSucceeded,
    /// Bootstrap, refresh or decryption failed.
    OperationFailed { message: String },
    /// The user disconnected.
    Revoked,
    /// A credential was saved again for this integration.
    Reconnected,
}

impl StatusEvent {
    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BootstrapSucceeded => "bootstrap_succeeded",
            Self::RefreshSucceeded => "refresh_succeeded",
            Self::OperationFailed { .. } => "operation_failed",
            Self::Revoked => "revoked",
            Self::Reconnected => "reconnected",
        }
    }
}

/// A status change caused by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: IntegrationStatus,
    pub to: IntegrationStatus,
}

impl StatusChange {
    /// Returns true when the status actually moved.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }
}

/// An event that is not allowed in the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: IntegrationStatus,
    pub event: &'static str,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot apply {} to a {} integration", self.event, self.from)
    }
}

impl std::error::Error for TransitionError {}

/// Computes the status an event leads to.
///
/// # Errors
///
/// Returns an error for events that are not allowed from `from`.
pub fn transition(
    from: IntegrationStatus,
    event: &StatusEvent,
) -> Result<StatusChange, TransitionError> {
    use IntegrationStatus::{Connected, Disconnected, Error, Pending};

    let to = match (from, event) {
        (Pending | Connected | Error, StatusEvent::BootstrapSucceeded) => Connected,
        (Connected | Error, StatusEvent::RefreshSucceeded) => Connected,
        (Pending | Connected | Error, StatusEvent::OperationFailed { .. }) => Error,
        (_, StatusEvent::Revoked) => Disconnected,
        (_, StatusEvent::Reconnected) => Pending,
        _ => {
            return Err(TransitionError {
                from,
                event: event.name(),
            });
        }
    };
    Ok(StatusChange { from, to })
}

/// Decides whether a credential's access token should be refreshed now.
///
/// Only OAuth credentials with a known expiry qualify; they are due once
/// the remaining lifetime is at most `threshold`.
#[must_use]
pub fn refresh_due(
    kind: CredentialKind,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    match (kind, expires_at) {
        (CredentialKind::Oauth, Some(expires_at)) => expires_at - now <= threshold,
        _ => false,
    }
}
