//! In-process lifecycle notifications.
//!
//! Delivery is best-effort: the audit log is the durable record, these
//! events only exist so UI collaborators can react without polling.

use crate::integration::IntegrationStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_core::{IntegrationId, SyncJobId, UserId};
use tokio::sync::broadcast;

/// Something observable happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    CredentialSaved {
        user_id: UserId,
        platform: String,
        integration_id: IntegrationId,
        job_id: SyncJobId,
    },
    BootstrapCompleted {
        integration_id: IntegrationId,
        job_id: SyncJobId,
    },
    BootstrapFailed {
        integration_id: IntegrationId,
        job_id: SyncJobId,
        error: String,
    },
    Refreshed {
        integration_id: IntegrationId,
        expires_at: Option<DateTime<Utc>>,
    },
    RefreshFailed {
        integration_id: IntegrationId,
        error: String,
    },
    Disconnected {
        user_id: UserId,
        platform: String,
        integration_id: Option<IntegrationId>,
    },
    StatusChanged {
        integration_id: IntegrationId,
        from: IntegrationStatus,
        to: IntegrationStatus,
    },
    IntegrationDeleted {
        integration_id: IntegrationId,
    },
}

/// Broadcast channel for [`LifecycleEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("lifecycle event dropped: no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let integration_id = IntegrationId::new();
        bus.publish(LifecycleEvent::IntegrationDeleted { integration_id });
        assert_eq!(
            rx.recv().await.expect("event"),
            LifecycleEvent::IntegrationDeleted { integration_id }
        );
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::default().publish(LifecycleEvent::IntegrationDeleted {
            integration_id: IntegrationId::new(),
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = LifecycleEvent::StatusChanged {
            integration_id: IntegrationId::new(),
            from: IntegrationStatus::Pending,
            to: IntegrationStatus::Connected,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "status_changed");
        assert_eq!(value["to"], "connected");
    }
}
