//! Integration records.
//!
//! An integration is the logical connection between a user and a provider
//! (optionally scoped to a workspace), independent of which credential is
//! currently backing it.

use crate::credential::AdditionalData;
use crate::lifecycle::{StatusChange, StatusEvent, TransitionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{IntegrationId, UserId, WorkspaceId};

/// Highest (and initial) health score.
pub const MAX_HEALTH: u8 = 100;

/// Connection status of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    /// Created, waiting for bootstrap.
    Pending,
    /// Bootstrap or the last refresh succeeded.
    Connected,
    /// The last operation failed; retried by the health sweep.
    Error,
    /// Explicitly revoked by the user.
    Disconnected,
}

impl IntegrationStatus {
    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "connected" => Some(Self::Connected),
            "error" => Some(Self::Error),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An integration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub user_id: UserId,
    pub workspace_id: Option<WorkspaceId>,
    /// Provider key, e.g. `slack`.
    pub provider: String,
    pub provider_name: String,
    pub status: IntegrationStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    /// 0..=100.
    pub health_score: u8,
    pub error_message: Option<String>,
    pub metadata: AdditionalData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    /// Creates a new pending integration.
    #[must_use]
    pub fn new(
        user_id: UserId,
        workspace_id: Option<WorkspaceId>,
        provider: impl Into<String>,
        provider_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: IntegrationId::new(),
            user_id,
            workspace_id,
            provider: provider.into(),
            provider_name: provider_name.into(),
            status: IntegrationStatus::Pending,
            last_sync_at: None,
            next_sync_at: None,
            health_score: MAX_HEALTH,
            error_message: None,
            metadata: AdditionalData::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a lifecycle event, returning the status change it caused.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is not allowed in the current status;
    /// the record is left untouched in that case.
    pub fn apply(
        &mut self,
        event: &StatusEvent,
        now: DateTime<Utc>,
    ) -> Result<StatusChange, TransitionError> {
        let change = crate::lifecycle::transition(self.status, event)?;
        match event {
            StatusEvent::BootstrapSucceeded | StatusEvent::RefreshSucceeded => {
                self.health_score = MAX_HEALTH;
                self.error_message = None;
                self.last_sync_at = Some(now);
            }
            StatusEvent::OperationFailed { message } => {
                self.health_score =
                    self.health_score.saturating_sub(crate::lifecycle::HEALTH_PENALTY);
                self.error_message = Some(message.clone());
            }
            StatusEvent::Revoked => {
                self.next_sync_at = None;
            }
            StatusEvent::Reconnected => {
                if change.from == IntegrationStatus::Disconnected {
                    self.health_score = MAX_HEALTH;
                }
                self.error_message = None;
            }
        }
        self.status = change.to;
        self.updated_at = now;
        Ok(change)
    }

    /// Shallow-merges provider metadata; incoming keys win.
    pub fn merge_metadata(&mut self, incoming: AdditionalData) {
        for (key, value) in incoming {
            self.metadata.insert(key, value);
        }
    }

    /// Returns true if the health sweep should look at this integration.
    #[must_use]
    pub fn is_sweepable(&self) -> bool {
        matches!(
            self.status,
            IntegrationStatus::Connected | IntegrationStatus::Error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn integration() -> Integration {
        Integration::new(UserId::new(), None, "slack", "Slack")
    }

    fn failed(message: &str) -> StatusEvent {
        StatusEvent::OperationFailed {
            message: message.to_string(),
        }
    }

    #[test]
    fn new_integration_is_pending_and_healthy() {
        let i = integration();
        assert_eq!(i.status, IntegrationStatus::Pending);
        assert_eq!(i.health_score, 100);
        assert!(!i.is_sweepable());
    }

    #[test]
    fn failures_decrement_health_and_floor_at_zero() {
        let mut i = integration();
        let now = Utc::now();
        i.apply(&failed("boom"), now).expect("pending -> error");
        assert_eq!(i.health_score, 90);
        for _ in 0..20 {
            i.apply(&failed("again"), now).expect("error -> error");
        }
        assert_eq!(i.health_score, 0);
        assert_eq!(i.error_message.as_deref(), Some("again"));
    }

    #[test]
    fn single_success_resets_health_to_exactly_100() {
        let mut i = integration();
        let now = Utc::now();
        for _ in 0..3 {
            i.apply(&failed("x"), now).expect("fail");
        }
        assert_eq!(i.health_score, 70);
        let change = i.apply(&StatusEvent::RefreshSucceeded, now).expect("recover");
        assert_eq!(change.from, IntegrationStatus::Error);
        assert_eq!(i.status, IntegrationStatus::Connected);
        assert_eq!(i.health_score, 100);
        assert!(i.error_message.is_none());
        assert_eq!(i.last_sync_at, Some(now));
    }

    #[test]
    fn rejected_transition_leaves_record_untouched() {
        let mut i = integration();
        let now = Utc::now();
        i.apply(&StatusEvent::Revoked, now).expect("revoke");
        let before = i.updated_at;
        assert!(i.apply(&failed("late"), Utc::now()).is_err());
        assert_eq!(i.status, IntegrationStatus::Disconnected);
        assert_eq!(i.health_score, 100);
        assert_eq!(i.updated_at, before);
    }

    #[test]
    fn reconnect_after_disconnect_starts_fresh() {
        let mut i = integration();
        let now = Utc::now();
        i.apply(&failed("x"), now).expect("fail");
        i.apply(&StatusEvent::Revoked, now).expect("revoke");
        i.apply(&StatusEvent::Reconnected, now).expect("reconnect");
        assert_eq!(i.status, IntegrationStatus::Pending);
        assert_eq!(i.health_score, 100);
    }

    #[test]
    fn metadata_merge_is_shallow_and_new_keys_win() {
        let mut i = integration();
        i.metadata.insert("team".into(), json!("old"));
        i.metadata.insert("kept".into(), json!(1));
        let mut incoming = AdditionalData::new();
        incoming.insert("team".into(), json!({"id": "T1"}));
        incoming.insert("bot".into(), json!("B1"));
        i.merge_metadata(incoming);
        assert_eq!(i.metadata["team"], json!({"id": "T1"}));
        assert_eq!(i.metadata["kept"], json!(1));
        assert_eq!(i.metadata["bot"], json!("B1"));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            IntegrationStatus::Pending,
            IntegrationStatus::Connected,
            IntegrationStatus::Error,
            IntegrationStatus::Disconnected,
        ] {
            assert_eq!(IntegrationStatus::parse(s.as_str()), Some(s));
        }
    }
}
