//! Scheduler tunables.

use crate::error::SchedulerError;
use serde::Deserialize;
use std::time::Duration;

/// Deserialized from the `SCHEDULER__*` environment section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Time between sweeps.
    pub interval_secs: u64,
    /// Most integrations looked at per sweep.
    pub batch_size: usize,
    /// Most provider calls in flight during a sweep.
    pub max_concurrency: usize,
    /// A sweep stops starting and awaiting checks after this long.
    pub sweep_deadline_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            batch_size: 100,
            max_concurrency: 10,
            sweep_deadline_secs: 900,
        }
    }
}

impl SchedulerSettings {
    /// Rejects zero values that would stall or disable sweeps.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidSettings`] naming the offending field.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let zero = [
            ("interval_secs", self.interval_secs == 0),
            ("batch_size", self.batch_size == 0),
            ("max_concurrency", self.max_concurrency == 0),
            ("sweep_deadline_secs", self.sweep_deadline_secs == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(SchedulerError::InvalidSettings {
                reason: format!("{field} must be positive"),
            }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn sweep_deadline(&self) -> Duration {
        Duration::from_secs(self.sweep_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = SchedulerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.interval(), Duration::from_secs(3600));
        assert_eq!(settings.batch_size, 100);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let settings = SchedulerSettings {
            max_concurrency: 0,
            ..SchedulerSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(SchedulerError::InvalidSettings {
                reason: "max_concurrency must be positive".to_string()
            })
        );
    }

    #[test]
    fn partial_input_keeps_defaults() {
        let settings: SchedulerSettings =
            serde_json::from_value(serde_json::json!({"batch_size": 5})).expect("settings");
        assert_eq!(settings.batch_size, 5);
        assert_eq!(settings.max_concurrency, 10);
    }
}
