//! Stored credentials.
//!
//! A credential holds the secret material backing one (user, platform)
//! connection. Secret fields are only ever held encrypted on the
//! [`Credential`] row; plaintext lives in [`Secrets`] for the duration of
//! a provider call.

use crate::cipher::Cipher;
use crate::error::CipherError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{CredentialId, IntegrationId, UserId};
use ulid::Ulid;

/// Free-form provider data stored with a credential or integration.
pub type AdditionalData = serde_json::Map<String, serde_json::Value>;

/// How a credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// OAuth 2.0 access/refresh tokens.
    Oauth,
    /// A static API key (and optional secret).
    ApiKey,
    /// Anything pasted in by hand.
    Manual,
}

impl CredentialKind {
    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oauth => "oauth",
            Self::ApiKey => "api_key",
            Self::Manual => "manual",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oauth" => Some(Self::Oauth),
            "api_key" => Some(Self::ApiKey),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Status recorded on the credential row itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Connected,
    Disconnected,
    Error,
    Pending,
}

impl CredentialStatus {
    /// Returns the stored string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Pending => "pending",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "error" => Some(Self::Error),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Plaintext secret fields.
///
/// `Debug` is redacted so secrets never reach logs through `{:?}`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Secrets {
    /// Secrets consisting of a single OAuth access token.
    #[must_use]
    pub fn access_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Adds a refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Secrets consisting of an API key and optional secret.
    #[must_use]
    pub fn api_key(key: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            api_secret: secret,
            ..Self::default()
        }
    }

    /// Returns true when no field carries a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [
            &self.access_token,
            &self.refresh_token,
            &self.api_key,
            &self.api_secret,
        ]
        .iter()
        .all(|field| field.as_deref().is_none_or(str::is_empty))
    }

    /// Encrypts each present field independently.
    pub fn encrypt(&self, cipher: &Cipher) -> Result<EncryptedSecrets, CipherError> {
        Ok(EncryptedSecrets {
            access_token: cipher.encrypt_opt(self.access_token.as_deref())?,
            refresh_token: cipher.encrypt_opt(self.refresh_token.as_deref())?,
            api_key: cipher.encrypt_opt(self.api_key.as_deref())?,
            api_secret: cipher.encrypt_opt(self.api_secret.as_deref())?,
        })
    }
}

/// Encrypted secret columns as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecrets {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl EncryptedSecrets {
    /// Decrypts every present field.
    ///
    /// # Errors
    ///
    /// Fails on the first field that does not decrypt.
    pub fn decrypt(&self, cipher: &Cipher) -> Result<Secrets, CipherError> {
        Ok(Secrets {
            access_token: cipher.decrypt_opt(self.access_token.as_deref())?,
            refresh_token: cipher.decrypt_opt(self.refresh_token.as_deref())?,
            api_key: cipher.decrypt_opt(self.api_key.as_deref())?,
            api_secret: cipher.decrypt_opt(self.api_secret.as_deref())?,
        })
    }
}

/// A stored credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub user_id: UserId,
    /// Provider key, e.g. `gmail`.
    pub platform: String,
    pub platform_name: String,
    pub kind: CredentialKind,
    #[serde(skip)]
    pub secrets: EncryptedSecrets,
    pub additional_data: AdditionalData,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
    pub active: bool,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Integration currently backed by this credential, if any.
    pub integration_id: Option<IntegrationId>,
    /// Holder of the refresh/deactivate lease.
    #[serde(skip)]
    pub lease_owner: Option<Ulid>,
    #[serde(skip)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Creates a new active credential.
    #[must_use]
    pub fn new(
        user_id: UserId,
        platform: impl Into<String>,
        platform_name: impl Into<String>,
        kind: CredentialKind,
        secrets: EncryptedSecrets,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CredentialId::new(),
            user_id,
            platform: platform.into(),
            platform_name: platform_name.into(),
            kind,
            secrets,
            additional_data: AdditionalData::new(),
            scopes: Vec::new(),
            expires_at: None,
            last_refreshed_at: None,
            status: CredentialStatus::Connected,
            active: true,
            usage_count: 0,
            last_used_at: None,
            integration_id: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks whether the access token should be refreshed now.
    ///
    /// Only OAuth credentials with a known expiry are ever due.
    #[must_use]
    pub fn refresh_due(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        crate::lifecycle::refresh_due(self.kind, self.expires_at, now, threshold)
    }

    /// Returns true when a refresh token is stored.
    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.secrets
            .refresh_token
            .as_deref()
            .is_some_and(|v| !v.is_empty())
    }

    /// Returns true if a live lease is held by someone.
    #[must_use]
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|until| until > now)
    }

    /// Records a read: bumps the usage counter and last-used timestamp.
    pub fn mark_used(&mut self, now: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used_at = Some(now);
    }

    /// Logically deletes the credential.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.status = CredentialStatus::Disconnected;
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::from_key_bytes(&[3u8; 32]).expect("key")
    }

    #[test]
    fn kind_and_status_round_trip_through_strings() {
        for kind in [CredentialKind::Oauth, CredentialKind::ApiKey, CredentialKind::Manual] {
            assert_eq!(CredentialKind::parse(kind.as_str()), Some(kind));
        }
        for status in [
            CredentialStatus::Connected,
            CredentialStatus::Disconnected,
            CredentialStatus::Error,
            CredentialStatus::Pending,
        ] {
            assert_eq!(CredentialStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CredentialKind::parse("password"), None);
    }

    #[test]
    fn absent_secrets_are_not_encrypted() {
        let enc = Secrets::access_token("tok1").encrypt(&cipher()).expect("encrypt");
        assert!(enc.access_token.is_some());
        assert!(enc.refresh_token.is_none());
        assert!(enc.api_key.is_none());
        assert!(enc.api_secret.is_none());
    }

    #[test]
    fn secrets_survive_encryption() {
        let c = cipher();
        let secrets = Secrets::access_token("tok1").with_refresh_token("ref1");
        let back = secrets.encrypt(&c).expect("encrypt").decrypt(&c).expect("decrypt");
        assert_eq!(back, secrets);
    }

    #[test]
    fn debug_output_is_redacted() {
        let rendered = format!("{:?}", Secrets::access_token("super-secret"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn empty_secrets_detection() {
        assert!(Secrets::default().is_empty());
        assert!(Secrets::access_token("").is_empty());
        assert!(!Secrets::api_key("k", None).is_empty());
    }

    #[test]
    fn mark_used_bumps_counter() {
        let mut cred = Credential::new(
            UserId::new(),
            "slack",
            "Slack",
            CredentialKind::Oauth,
            EncryptedSecrets::default(),
        );
        let now = Utc::now();
        cred.mark_used(now);
        cred.mark_used(now);
        assert_eq!(cred.usage_count, 2);
        assert_eq!(cred.last_used_at, Some(now));
    }

    #[test]
    fn deactivate_clears_lease() {
        let mut cred = Credential::new(
            UserId::new(),
            "slack",
            "Slack",
            CredentialKind::Oauth,
            EncryptedSecrets::default(),
        );
        let now = Utc::now();
        cred.lease_owner = Some(Ulid::new());
        cred.lease_expires_at = Some(now + Duration::minutes(2));
        assert!(cred.is_leased(now));
        cred.deactivate(now);
        assert!(!cred.active);
        assert_eq!(cred.status, CredentialStatus::Disconnected);
        assert!(!cred.is_leased(now));
    }
}
