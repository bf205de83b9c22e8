//! Append-only integration audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{IntegrationLogId, UserId};

/// What was being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    CredentialSaved,
    Bootstrap,
    BootstrapRetry,
    TokenRefresh,
    Revoke,
    Disconnect,
    HealthCheck,
    StatusChange,
    IntegrationDeleted,
}

impl LogAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialSaved => "credential_saved",
            Self::Bootstrap => "bootstrap",
            Self::BootstrapRetry => "bootstrap_retry",
            Self::TokenRefresh => "token_refresh",
            Self::Revoke => "revoke",
            Self::Disconnect => "disconnect",
            Self::HealthCheck => "health_check",
            Self::StatusChange => "status_change",
            Self::IntegrationDeleted => "integration_deleted",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential_saved" => Some(Self::CredentialSaved),
            "bootstrap" => Some(Self::Bootstrap),
            "bootstrap_retry" => Some(Self::BootstrapRetry),
            "token_refresh" => Some(Self::TokenRefresh),
            "revoke" => Some(Self::Revoke),
            "disconnect" => Some(Self::Disconnect),
            "health_check" => Some(Self::HealthCheck),
            "status_change" => Some(Self::StatusChange),
            "integration_deleted" => Some(Self::IntegrationDeleted),
            _ => None,
        }
    }
}

/// Outcome of the logged action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failure,
    Skipped,
}

impl LogStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One audit record. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationLog {
    pub id: IntegrationLogId,
    pub user_id: UserId,
    pub platform: String,
    pub action: LogAction,
    pub status: LogStatus,
    pub level: LogLevel,
    pub message: String,
    pub error_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl IntegrationLog {
    fn new(
        user_id: UserId,
        platform: &str,
        action: LogAction,
        status: LogStatus,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: IntegrationLogId::new(),
            user_id,
            platform: platform.to_string(),
            action,
            status,
            level,
            message: message.into(),
            error_details: None,
            created_at: Utc::now(),
        }
    }

    /// A successful action.
    #[must_use]
    pub fn success(
        user_id: UserId,
        platform: &str,
        action: LogAction,
        message: impl Into<String>,
    ) -> Self {
        Self::new(user_id, platform, action, LogStatus::Success, LogLevel::Info, message)
    }

    /// A failed action, with the error text kept as structured details.
    #[must_use]
    pub fn failure(
        user_id: UserId,
        platform: &str,
        action: LogAction,
        message: impl Into<String>,
        error: &impl std::fmt::Display,
    ) -> Self {
        let mut log = Self::new(user_id, platform, action, LogStatus::Failure, LogLevel::Error, message);
        log.error_details = Some(serde_json::json!({ "error": error.to_string() }));
        log
    }

    /// An action that was deliberately not performed.
    #[must_use]
    pub fn skipped(
        user_id: UserId,
        platform: &str,
        action: LogAction,
        message: impl Into<String>,
    ) -> Self {
        Self::new(user_id, platform, action, LogStatus::Skipped, LogLevel::Warn, message)
    }

    /// Downgrades or upgrades the level.
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error_details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_records_error_text() {
        let log = IntegrationLog::failure(
            UserId::new(),
            "gmail",
            LogAction::TokenRefresh,
            "refresh failed",
            &"invalid_grant",
        );
        assert_eq!(log.status, LogStatus::Failure);
        assert_eq!(log.level, LogLevel::Error);
        assert_eq!(
            log.error_details,
            Some(serde_json::json!({"error": "invalid_grant"}))
        );
    }

    #[test]
    fn warn_level_failure() {
        let log = IntegrationLog::failure(
            UserId::new(),
            "slack",
            LogAction::Revoke,
            "provider revoke failed",
            &"timeout",
        )
        .with_level(LogLevel::Warn);
        assert_eq!(log.level, LogLevel::Warn);
        assert_eq!(log.action.as_str(), "revoke");
    }

    #[test]
    fn stored_strings_parse_back() {
        for action in [LogAction::TokenRefresh, LogAction::IntegrationDeleted] {
            assert_eq!(LogAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(LogStatus::parse("skipped"), Some(LogStatus::Skipped));
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("debug"), None);
    }
}
