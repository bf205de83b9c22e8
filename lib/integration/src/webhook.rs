//! Webhook registrations and inbound event ingestion.
//!
//! The ingestor's contract ends at durable, attributed storage: events are
//! persisted with `processed = false` and never dispatched here.

use crate::error::LifecycleError;
use crate::provider::ProviderRegistry;
use crate::store::Datastore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_core::{IntegrationId, WebhookEventId, WebhookRegistrationId};
use tracing::instrument;

/// A webhook registered with a provider for one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: WebhookRegistrationId,
    pub integration_id: IntegrationId,
    /// Provider key, used to scope webhook id lookups.
    pub provider: String,
    pub webhook_url: String,
    /// Id the provider assigned to the webhook.
    pub webhook_id: String,
    /// Signing secret, encrypted like credential secrets.
    #[serde(skip)]
    pub webhook_secret: Option<String>,
    pub active: bool,
    pub event_types: Vec<String>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookRegistration {
    /// Creates an active registration.
    #[must_use]
    pub fn new(
        integration_id: IntegrationId,
        provider: impl Into<String>,
        webhook_url: impl Into<String>,
        webhook_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WebhookRegistrationId::new(),
            integration_id,
            provider: provider.into(),
            webhook_url: webhook_url.into(),
            webhook_id: webhook_id.into(),
            webhook_secret: None,
            active: true,
            event_types: Vec::new(),
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored inbound webhook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub provider: String,
    /// Webhook id read from the delivery, when the header was present.
    pub webhook_id: Option<String>,
    /// Owning integration; `None` for unattributed events.
    pub integration_id: Option<IntegrationId>,
    pub headers: BTreeMap<String, String>,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Returns true when the event was matched to an integration.
    #[must_use]
    pub fn is_attributed(&self) -> bool {
        self.integration_id.is_some()
    }
}

/// A raw delivery as received from a provider.
#[derive(Debug, Clone, Default)]
pub struct RawWebhook {
    /// Header names are matched case-insensitively.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl RawWebhook {
    /// Creates a delivery, lower-casing header names.
    #[must_use]
    pub fn new(headers: impl IntoIterator<Item = (String, String)>, body: Vec<u8>) -> Self {
        Self {
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
            body,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// JSON body, or the lossy text wrapped as `{"raw": ...}`.
    fn payload(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|_| {
            serde_json::json!({ "raw": String::from_utf8_lossy(&self.body) })
        })
    }
}

/// What happened to an ingested delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub event_id: WebhookEventId,
    pub integration_id: Option<IntegrationId>,
    pub attributed: bool,
}

/// Persists inbound webhook deliveries, attributing them to integrations
/// through their registration.
#[derive(Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn Datastore>,
    registry: Arc<ProviderRegistry>,
}

impl WebhookIngestor {
    #[must_use]
    pub fn new(store: Arc<dyn Datastore>, registry: Arc<ProviderRegistry>) -> Self {
        Self { store, registry }
    }

    /// Stores a delivery for `provider`.
    ///
    /// # Errors
    ///
    /// Fails for unregistered providers and datastore errors. Deliveries
    /// that match no registration are stored, not rejected.
    #[instrument(skip(self, delivery), fields(body_len = delivery.body.len()))]
    pub async fn ingest(
        &self,
        provider: &str,
        delivery: RawWebhook,
    ) -> Result<IngestReceipt, LifecycleError> {
        let plugin = self.registry.resolve(provider)?;
        let key = plugin.key();
        let webhook_id = plugin
            .config()
            .webhook_id_header
            .and_then(|header| delivery.header(header))
            .map(ToString::to_string);

        let registration = match &webhook_id {
            Some(id) => self.store.find_webhook_registration(key.as_str(), id).await?,
            None => None,
        };
        let now = Utc::now();
        if let Some(registration) = &registration {
            self.store
                .mark_webhook_triggered(registration.id, now)
                .await?;
        }

        let event = WebhookEvent {
            id: WebhookEventId::new(),
            provider: key.as_str().to_string(),
            payload: delivery.payload(),
            webhook_id,
            integration_id: registration.as_ref().map(|r| r.integration_id),
            headers: delivery.headers,
            processed: false,
            received_at: now,
        };
        self.store.insert_webhook_event(&event).await?;

        if event.is_attributed() {
            tracing::info!(event_id = %event.id, integration_id = ?event.integration_id, "webhook event stored");
        } else {
            tracing::warn!(event_id = %event.id, webhook_id = ?event.webhook_id, "unattributed webhook event stored");
        }

        Ok(IngestReceipt {
            event_id: event.id,
            integration_id: event.integration_id,
            attributed: event.is_attributed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKey;
    use crate::store::MemoryStore;
    use crate::testing::FakeProvider;

    fn ingestor(store: Arc<MemoryStore>) -> WebhookIngestor {
        let registry = ProviderRegistry::new().with(Arc::new(
            FakeProvider::new(ProviderKey::Github).with_webhook_header("x-github-hook-id"),
        ));
        WebhookIngestor::new(store, Arc::new(registry))
    }

    fn delivery(hook_id: Option<&str>, body: &str) -> RawWebhook {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(id) = hook_id {
            headers.push(("X-GitHub-Hook-ID".to_string(), id.to_string()));
        }
        RawWebhook::new(headers, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn event_is_attributed_through_registration() {
        let store = Arc::new(MemoryStore::new());
        let integration_id = IntegrationId::new();
        store
            .upsert_webhook_registration(&WebhookRegistration::new(
                integration_id,
                "github",
                "https://tether.example/webhooks/github",
                "4242",
            ))
            .await
            .expect("register");

        let receipt = ingestor(store.clone())
            .ingest("github", delivery(Some("4242"), r#"{"action":"opened"}"#))
            .await
            .expect("ingest");

        assert!(receipt.attributed);
        assert_eq!(receipt.integration_id, Some(integration_id));
        let events = store.webhook_events().await;
        assert_eq!(events.len(), 1);
        assert!(!events[0].processed);
        assert_eq!(events[0].payload["action"], "opened");
        assert!(events[0].headers.contains_key("x-github-hook-id"));

        let registration = store
            .find_webhook_registration("github", "4242")
            .await
            .expect("find")
            .expect("exists");
        assert!(registration.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn unknown_webhook_id_is_stored_unattributed() {
        let store = Arc::new(MemoryStore::new());
        let receipt = ingestor(store.clone())
            .ingest("github", delivery(Some("9999"), "{}"))
            .await
            .expect("ingest");
        assert!(!receipt.attributed);
        assert_eq!(store.webhook_events().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_header_is_stored_unattributed() {
        let store = Arc::new(MemoryStore::new());
        let receipt = ingestor(store.clone())
            .ingest("github", delivery(None, "{}"))
            .await
            .expect("ingest");
        assert!(!receipt.attributed);
        assert_eq!(store.webhook_events().await[0].webhook_id, None);
    }

    #[tokio::test]
    async fn non_json_body_is_kept_raw() {
        let store = Arc::new(MemoryStore::new());
        ingestor(store.clone())
            .ingest("github", delivery(None, "payload=a%3Db"))
            .await
            .expect("ingest");
        assert_eq!(
            store.webhook_events().await[0].payload,
            serde_json::json!({"raw": "payload=a%3Db"})
        );
    }

    #[tokio::test]
    async fn unregistered_provider_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = ingestor(store.clone())
            .ingest("myspace", delivery(None, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ProviderNotFound(_)));
        assert!(store.webhook_events().await.is_empty());
    }
}
