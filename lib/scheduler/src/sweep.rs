//! The health sweep and the loop that runs it.

use crate::error::SchedulerError;
use crate::settings::SchedulerSettings;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use tether_integration::{Integration, Lifecycle, RefreshResult};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::instrument;

/// Aggregate result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Integrations whose check finished.
    pub checked: usize,
    pub refreshed: usize,
    /// Checks that failed; the failure is recorded on the integration.
    pub errored: usize,
    /// Due refreshes that did not happen: no refresh token, lease held
    /// elsewhere, or the credential changed mid-refresh.
    pub skipped: usize,
    /// The sweep deadline cut off outstanding checks.
    pub timed_out: bool,
}

enum Checked {
    Refreshed,
    Untouched,
    Skipped,
    Errored,
}

impl SweepReport {
    fn record(&mut self, checked: Checked) {
        self.checked += 1;
        match checked {
            Checked::Refreshed => self.refreshed += 1,
            Checked::Skipped => self.skipped += 1,
            Checked::Errored => self.errored += 1,
            Checked::Untouched => {}
        }
    }
}

/// Runs health sweeps over the integrations that need watching.
#[derive(Debug, Clone)]
pub struct HealthSweeper {
    lifecycle: Lifecycle,
    settings: SchedulerSettings,
}

impl HealthSweeper {
    #[must_use]
    pub fn new(lifecycle: Lifecycle, settings: SchedulerSettings) -> Self {
        Self {
            lifecycle,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Checks every `connected` or `error` integration, oldest-updated
    /// first and at most `batch_size` of them.
    ///
    /// Checks run concurrently up to `max_concurrency`. A failing or
    /// panicking check is counted and the batch continues. Checks still
    /// outstanding at the sweep deadline are dropped.
    ///
    /// # Errors
    ///
    /// Only when the candidates cannot be listed.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, SchedulerError> {
        let integrations = self
            .lifecycle
            .store()
            .list_for_sweep(self.settings.batch_size)
            .await?;
        let total = integrations.len();
        tracing::info!(total, "health sweep started");

        let deadline = time::sleep(self.settings.sweep_deadline());
        let mut checks = std::pin::pin!(
            futures::stream::iter(integrations)
                .map(|integration| self.check(integration))
                .buffer_unordered(self.settings.max_concurrency.max(1))
                .take_until(deadline)
        );

        let mut report = SweepReport::default();
        while let Some(checked) = checks.next().await {
            report.record(checked);
        }
        report.timed_out = report.checked < total;

        if report.timed_out {
            tracing::warn!(
                checked = report.checked,
                total,
                "health sweep hit its deadline"
            );
        }
        tracing::info!(
            checked = report.checked,
            refreshed = report.refreshed,
            errored = report.errored,
            skipped = report.skipped,
            "health sweep finished"
        );
        Ok(report)
    }

    async fn check(&self, integration: Integration) -> Checked {
        let id = integration.id;
        let result = AssertUnwindSafe(self.lifecycle.check_integration(&integration))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(RefreshResult::Refreshed { .. })) => Checked::Refreshed,
            Ok(Ok(RefreshResult::NotDue)) => Checked::Untouched,
            Ok(Ok(
                RefreshResult::NoRefreshToken | RefreshResult::Busy | RefreshResult::Stale,
            )) => Checked::Skipped,
            Ok(Ok(RefreshResult::Failed { error })) => {
                tracing::debug!(integration_id = %id, %error, "integration check failed");
                Checked::Errored
            }
            Ok(Err(e)) => {
                tracing::error!(integration_id = %id, error = %e, "integration check errored");
                Checked::Errored
            }
            Err(_) => {
                tracing::error!(integration_id = %id, "integration check panicked");
                Checked::Errored
            }
        }
    }
}

/// Runs a sweep every interval until shutdown.
#[derive(Debug)]
pub struct Scheduler {
    sweeper: HealthSweeper,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    #[must_use]
    pub fn new(sweeper: HealthSweeper, shutdown: watch::Receiver<bool>) -> Self {
        Self { sweeper, shutdown }
    }

    /// Loops until shutdown is signalled. The first sweep runs one interval
    /// after start.
    pub async fn run(mut self) {
        let mut timer = time::interval(self.sweeper.settings.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.sweeper.sweep().await {
                        tracing::error!(error = %e, "health sweep failed");
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tether_core::UserId;
    use tether_integration::testing::{FakeRefresh, Harness};
    use tether_integration::{Datastore, IntegrationStatus};

    fn expiring() -> Option<chrono::DateTime<Utc>> {
        Some(Utc::now() + Duration::minutes(5))
    }

    fn sweeper(h: &Harness, settings: SchedulerSettings) -> HealthSweeper {
        HealthSweeper::new(h.lifecycle.clone(), settings)
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let h = Harness::new();
        let mut receipts = Vec::new();
        for refresh in ["r1", "r2", "r3"] {
            receipts.push(h.connect(UserId::new(), "tok", Some(refresh), expiring()).await);
        }
        h.provider
            .set_refresh_for("r2", FakeRefresh::Fail("invalid_grant".to_string()));

        let report = sweeper(&h, SchedulerSettings::default())
            .sweep()
            .await
            .expect("sweep");
        assert_eq!(report.checked, 3);
        assert_eq!(report.errored, 1);
        assert_eq!(report.refreshed, 2);
        assert!(!report.timed_out);

        assert_eq!(
            h.integration(receipts[1].integration_id).await.status,
            IntegrationStatus::Error
        );
        assert_eq!(
            h.integration(receipts[0].integration_id).await.status,
            IntegrationStatus::Connected
        );
    }

    #[tokio::test]
    async fn undecryptable_refresh_token_errors_and_batch_continues() {
        let h = Harness::new();
        let broken_user = UserId::new();
        let broken = h.connect(broken_user, "tok", Some("r1"), expiring()).await;
        let healthy = h.connect(UserId::new(), "tok", Some("r2"), expiring()).await;
        h.corrupt_refresh_token(broken_user).await;

        let report = sweeper(&h, SchedulerSettings::default())
            .sweep()
            .await
            .expect("sweep");
        assert_eq!(report.checked, 2);
        assert_eq!(report.errored, 1);
        assert_eq!(report.refreshed, 1);

        let integration = h.integration(broken.integration_id).await;
        assert_eq!(integration.status, IntegrationStatus::Error);
        assert!(integration
            .error_message
            .is_some_and(|m| m.starts_with("decryption failed: ")));
        assert_eq!(
            h.integration(healthy.integration_id).await.status,
            IntegrationStatus::Connected
        );
        // Only the healthy credential reached the provider.
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_with_new_expiry() {
        let h = Harness::new();
        let user = UserId::new();
        h.connect(user, "tok", Some("r1"), expiring()).await;
        h.provider.set_refresh(FakeRefresh::Succeed {
            expires_in: Duration::hours(2),
        });

        let report = sweeper(&h, SchedulerSettings::default())
            .sweep()
            .await
            .expect("sweep");
        assert_eq!(report.refreshed, 1);

        let credential = h
            .store
            .find_active_credential(user, "slack")
            .await
            .expect("find")
            .expect("active");
        let expires_at = credential.expires_at.expect("expiry");
        assert!(expires_at > Utc::now() + Duration::hours(1));
        let secrets = credential.secrets.decrypt(h.cipher()).expect("decrypt");
        assert_eq!(secrets.access_token.as_deref(), Some("fresh-r1"));
    }

    #[tokio::test]
    async fn panicking_check_is_counted_as_error() {
        let h = Harness::new();
        h.connect(UserId::new(), "tok", Some("r1"), expiring()).await;
        h.connect(UserId::new(), "tok", Some("boom"), expiring()).await;
        h.provider.set_refresh_for("boom", FakeRefresh::Panic);

        let report = sweeper(&h, SchedulerSettings::default())
            .sweep()
            .await
            .expect("sweep");
        assert_eq!(report.checked, 2);
        assert_eq!(report.errored, 1);
        assert_eq!(report.refreshed, 1);
    }

    #[tokio::test]
    async fn tokens_not_due_are_untouched() {
        let h = Harness::new();
        h.connect(
            UserId::new(),
            "tok",
            Some("r1"),
            Some(Utc::now() + Duration::hours(3)),
        )
        .await;
        h.connect(UserId::new(), "tok", None, None).await;

        let report = sweeper(&h, SchedulerSettings::default())
            .sweep()
            .await
            .expect("sweep");
        assert_eq!(
            report,
            SweepReport {
                checked: 2,
                ..SweepReport::default()
            }
        );
        assert_eq!(h.provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn due_without_refresh_token_is_skipped() {
        let h = Harness::new();
        h.connect(UserId::new(), "tok", None, expiring()).await;

        let report = sweeper(&h, SchedulerSettings::default())
            .sweep()
            .await
            .expect("sweep");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errored, 0);
    }

    #[tokio::test]
    async fn pending_integrations_are_not_swept() {
        let h = Harness::new();
        h.lifecycle
            .save_credential(h.oauth_request(UserId::new(), "tok", Some("r1"), expiring()))
            .await
            .expect("save");

        let report = sweeper(&h, SchedulerSettings::default())
            .sweep()
            .await
            .expect("sweep");
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn batch_size_bounds_the_sweep() {
        let h = Harness::new();
        for _ in 0..3 {
            h.connect(UserId::new(), "tok", Some("r"), expiring()).await;
        }
        let settings = SchedulerSettings {
            batch_size: 2,
            ..SchedulerSettings::default()
        };
        let report = sweeper(&h, settings).sweep().await.expect("sweep");
        assert_eq!(report.checked, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_off_hanging_checks() {
        let h = Harness::new();
        h.connect(UserId::new(), "tok", Some("r1"), expiring()).await;
        h.provider.set_refresh(FakeRefresh::Hang);
        let settings = SchedulerSettings {
            sweep_deadline_secs: 1,
            ..SchedulerSettings::default()
        };

        let report = sweeper(&h, settings).sweep().await.expect("sweep");
        assert!(report.timed_out);
        assert_eq!(report.checked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_stops_on_shutdown() {
        let h = Harness::new();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            Scheduler::new(sweeper(&h, SchedulerSettings::default()), rx).run(),
        );
        tx.send(true).expect("signal");
        time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("stops")
            .expect("task");
    }
}
