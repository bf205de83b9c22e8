//! Health and refresh scheduling for integrations.
//!
//! This crate provides:
//!
//! - **Sweep**: one bounded, concurrent health check over the integrations
//!   that need watching, refreshing tokens that are about to expire
//! - **Scheduler**: the interval loop that runs a sweep until shutdown

pub mod error;
pub mod settings;
pub mod sweep;

pub use error::SchedulerError;
pub use settings::SchedulerSettings;
pub use sweep::{HealthSweeper, Scheduler, SweepReport};
