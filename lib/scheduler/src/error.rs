//! Error types for the scheduler crate.

use std::fmt;
use tether_integration::StoreError;

/// Errors that abort a whole sweep.
///
/// Failures of individual integrations never end up here; they are
/// recorded on the integration and counted in the sweep report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The sweep candidates could not be listed.
    ListFailed(StoreError),
    /// Scheduler settings are unusable.
    InvalidSettings { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListFailed(e) => write!(f, "could not list integrations to sweep: {e}"),
            Self::InvalidSettings { reason } => write!(f, "invalid scheduler settings: {reason}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        Self::ListFailed(e)
    }
}
