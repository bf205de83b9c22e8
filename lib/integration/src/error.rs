//! Error types for the integration crate.
//!
//! Lower layers report narrow errors:
//! - `CipherError`: encryption and decryption of secrets at rest
//! - `ProviderError`: failures surfaced by a provider plugin call
//! - `ProviderNotFound`: a provider key with no registered plugin
//! - `StoreError`: datastore failures
//! - `QueueClosed`: the bootstrap queue was shut down
//!
//! `LifecycleError` is what operation boundaries hand back to callers.

use crate::lifecycle::TransitionError;
use crate::provider::ProviderKey;
use std::fmt;

/// Errors from the secret cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// The configured key is unusable.
    InvalidKey { reason: String },
    /// Encryption failed.
    EncryptionFailed { reason: String },
    /// Ciphertext was malformed, truncated, or produced with another key.
    DecryptionFailed { reason: String },
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey { reason } => write!(f, "invalid encryption key: {reason}"),
            Self::EncryptionFailed { reason } => write!(f, "encryption failed: {reason}"),
            Self::DecryptionFailed { reason } => write!(f, "decryption failed: {reason}"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Errors surfaced by provider plugin calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The HTTP request could not be completed.
    RequestFailed { reason: String },
    /// The provider answered and refused the request.
    Rejected { status: Option<u16>, reason: String },
    /// The call outlived its timeout.
    Timeout { seconds: u64 },
    /// The provider does not support this operation.
    Unsupported { operation: &'static str },
    /// No OAuth client id/secret is configured for the provider.
    MissingClientCredentials { provider: ProviderKey },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFailed { reason } => write!(f, "provider request failed: {reason}"),
            Self::Rejected {
                status: Some(status),
                reason,
            } => write!(f, "provider rejected request ({status}): {reason}"),
            Self::Rejected {
                status: None,
                reason,
            } => write!(f, "provider rejected request: {reason}"),
            Self::Timeout { seconds } => write!(f, "provider call timed out after {seconds}s"),
            Self::Unsupported { operation } => {
                write!(f, "provider does not support {operation}")
            }
            Self::MissingClientCredentials { provider } => {
                write!(f, "no OAuth client credentials configured for {provider}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        let reason = if e.is_timeout() {
            "request timed out".to_string()
        } else {
            e.to_string()
        };
        Self::RequestFailed { reason }
    }
}

/// A provider key that has no registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderNotFound {
    /// The key as it was requested.
    pub key: String,
}

impl fmt::Display for ProviderNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider not found: {}", self.key)
    }
}

impl std::error::Error for ProviderNotFound {}

/// The bootstrap queue no longer accepts tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bootstrap queue is closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Errors from the datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend failed to execute a query.
    Backend { details: String },
    /// A stored value could not be decoded.
    Corrupt { details: String },
    /// A uniqueness or referential rule was violated.
    Conflict { details: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { details } => write!(f, "datastore error: {details}"),
            Self::Corrupt { details } => write!(f, "corrupt datastore row: {details}"),
            Self::Conflict { details } => write!(f, "datastore conflict: {details}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors returned by lifecycle operations.
///
/// These never carry secrets or ciphertext and are safe to show to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// A credential, integration or job does not exist.
    NotFound { entity: &'static str, id: String },
    /// Stored secrets could not be decrypted.
    Decryption(CipherError),
    /// A provider call failed.
    Provider(ProviderError),
    /// The provider key is not registered.
    ProviderNotFound(ProviderNotFound),
    /// The datastore failed.
    Store(StoreError),
    /// The operation is not allowed in the current state.
    InvalidState { reason: String },
    /// An OAuth state token was unknown, reused or expired.
    OAuthState { reason: String },
}

impl LifecycleError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns true for the not-found case.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Decryption(e) => write!(f, "{e}"),
            Self::Provider(e) => write!(f, "{e}"),
            Self::ProviderNotFound(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::InvalidState { reason } => write!(f, "invalid state: {reason}"),
            Self::OAuthState { reason } => write!(f, "invalid OAuth state: {reason}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<CipherError> for LifecycleError {
    fn from(e: CipherError) -> Self {
        Self::Decryption(e)
    }
}

impl From<ProviderError> for LifecycleError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<ProviderNotFound> for LifecycleError {
    fn from(e: ProviderNotFound) -> Self {
        Self::ProviderNotFound(e)
    }
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TransitionError> for LifecycleError {
    fn from(e: TransitionError) -> Self {
        Self::InvalidState {
            reason: e.to_string(),
        }
    }
}
