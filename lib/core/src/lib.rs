//! Core domain types and utilities for tether.
//!
//! This crate provides the identifier types and the shared error alias
//! used by the credential lifecycle crates and the server.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    CredentialId, IntegrationId, IntegrationLogId, ParseIdError, SyncJobId, UserId,
    WebhookEventId, WebhookRegistrationId, WorkspaceId,
};
