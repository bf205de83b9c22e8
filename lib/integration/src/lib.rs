//! Credential lifecycle management for tether integrations.
//!
//! This crate provides:
//!
//! - **Cipher**: AES-256-GCM encryption of secrets at rest
//! - **Providers**: the plugin contract, built-in providers and their registry
//! - **Datastore**: the persistence contract and an in-memory implementation
//! - **Lifecycle manager**: save, read, refresh, revoke and delete operations
//!   over the integration state machine
//! - **Bootstrap**: the job queue, orchestrator and worker
//! - **Webhooks**: attribution and storage of inbound provider events
//! - **OAuth**: the authorization-code connect flow

pub mod audit;
pub mod bootstrap;
pub mod cipher;
pub mod credential;
pub mod error;
pub mod events;
pub mod integration;
pub mod job;
pub mod lifecycle;
pub mod manager;
pub mod oauth;
pub mod provider;
pub mod settings;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod webhook;

pub use audit::{IntegrationLog, LogAction, LogLevel, LogStatus};
pub use bootstrap::{BootstrapRun, BootstrapTask, BootstrapWorker, ChannelQueue, JobQueue};
pub use cipher::Cipher;
pub use credential::{Credential, CredentialKind, CredentialStatus, Secrets};
pub use error::{
    CipherError, LifecycleError, ProviderError, ProviderNotFound, QueueClosed, StoreError,
};
pub use events::{EventBus, LifecycleEvent};
pub use integration::{Integration, IntegrationStatus};
pub use job::{ABANDONED_JOB, JobStatus, SUPERSEDED_JOB, SyncJob};
pub use manager::{
    DisconnectReport, IntegrationView, Lifecycle, OpenCredential, RefreshResult, SaveCredential,
    SaveReceipt,
};
pub use oauth::{AuthorizationStart, OAuthState};
pub use provider::{Provider, ProviderKey, ProviderRegistry};
pub use settings::{ClientCredentialSet, LifecycleSettings};
pub use store::{Datastore, MemoryStore};
pub use webhook::{IngestReceipt, RawWebhook, WebhookIngestor};
