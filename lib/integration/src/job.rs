//! Sync jobs: tracked bootstrap attempts.
//!
//! A job moves `pending → running → completed | failed` exactly once.
//! Terminal jobs are never re-run; a retry is a new job.

use crate::credential::AdditionalData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{IntegrationId, SyncJobId};

/// Error recorded on a running job whose attempt never finished.
pub const ABANDONED_JOB: &str = "abandoned: bootstrap did not finish";

/// Error recorded on a job triggered while another bootstrap was running.
pub const SUPERSEDED_JOB: &str = "superseded: bootstrap already running";

/// Kind of work a job tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Bootstrap,
}

impl JobType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        (s == "bootstrap").then_some(Self::Bootstrap)
    }
}

/// Status of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true for `completed` and `failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A sync job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: SyncJobId,
    pub integration_id: IntegrationId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_summary: AdditionalData,
}

impl SyncJob {
    /// Creates a pending bootstrap job.
    #[must_use]
    pub fn bootstrap(integration_id: IntegrationId) -> Self {
        Self {
            id: SyncJobId::new(),
            integration_id,
            job_type: JobType::Bootstrap,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            result_summary: AdditionalData::new(),
        }
    }

    /// Marks the job as running.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
    }

    /// Marks the job as completed with a summary.
    pub fn complete(&mut self, summary: AdditionalData, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result_summary = summary;
        self.completed_at = Some(now);
    }

    /// Marks the job as failed.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_job_lifecycle() {
        let mut job = SyncJob::bootstrap(IntegrationId::new());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.status.is_terminal());

        let now = Utc::now();
        job.start(now);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.started_at, Some(now));

        job.fail("provider said no", now);
        assert!(job.status.is_terminal());
        assert_eq!(job.error_message.as_deref(), Some("provider said no"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn strings_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobType::parse("bootstrap"), Some(JobType::Bootstrap));
        assert_eq!(JobType::parse("sync"), None);
    }
}
