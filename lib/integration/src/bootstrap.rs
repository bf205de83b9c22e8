//! Bootstrap orchestration.
//!
//! Saving a credential ends once a bootstrap job row exists and its id is
//! queued. The job row is the durable handoff record: a worker that starts
//! after a crash fails every job left `running` and picks up every job
//! still `pending`.
//!
//! A running job older than [`LifecycleSettings::bootstrap_stale_after`]
//! no longer blocks new bootstraps for its integration.
//!
//! [`LifecycleSettings::bootstrap_stale_after`]: crate::settings::LifecycleSettings::bootstrap_stale_after

use crate::audit::{IntegrationLog, LogAction};
use crate::error::{LifecycleError, QueueClosed};
use crate::events::LifecycleEvent;
use crate::integration::Integration;
use crate::job::{ABANDONED_JOB, JobStatus, SUPERSEDED_JOB, SyncJob};
use crate::lifecycle::StatusEvent;
use crate::manager::{Lifecycle, Transition};
use crate::provider::{BootstrapOutcome, BootstrapRequest, ProviderHints};
use crate::store::JobStart;
use crate::webhook::WebhookRegistration;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use tether_core::{IntegrationId, SyncJobId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::instrument;

/// Running and pending jobs picked up when a worker starts.
const REQUEUE_LIMIT: usize = 1000;

/// A queued bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapTask {
    pub job_id: SyncJobId,
    pub integration_id: IntegrationId,
}

/// Hands bootstrap tasks to a worker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, task: BootstrapTask) -> Result<(), QueueClosed>;
}

/// In-process queue backed by a bounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<BootstrapTask>,
}

impl ChannelQueue {
    /// Creates the queue and the receiver a [`BootstrapWorker`] drains.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BootstrapTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, task: BootstrapTask) -> Result<(), QueueClosed> {
        self.tx.send(task).await.map_err(|_| QueueClosed)
    }
}

/// What [`Lifecycle::run_bootstrap`] did with a job.
#[derive(Debug, Clone)]
pub enum BootstrapRun {
    Completed(SyncJob),
    Failed(SyncJob),
    /// The job was already picked up, or it was closed as superseded
    /// because another bootstrap for the integration is running.
    Skipped,
}

enum Attempt {
    Succeeded {
        outcome: BootstrapOutcome,
        webhook: Option<WebhookRegistration>,
    },
    Failed(String),
}

impl Lifecycle {
    /// Runs one bootstrap job to completion.
    ///
    /// Provider, decryption and lookup failures end with the job `failed`
    /// and the integration in `error`; they are not retried.
    ///
    /// # Errors
    ///
    /// Datastore failures.
    #[instrument(skip(self))]
    pub async fn run_bootstrap(&self, job_id: SyncJobId) -> Result<BootstrapRun, LifecycleError> {
        let now = Utc::now();
        let stale_before = now - self.settings.bootstrap_stale_after();
        let job = match self.store.start_job(job_id, now, stale_before).await? {
            JobStart::Started(job) => job,
            JobStart::AlreadyRunning => {
                let closed = self
                    .store
                    .fail_pending_job(job_id, SUPERSEDED_JOB, now)
                    .await?;
                tracing::info!(closed, "bootstrap already running for integration");
                return Ok(BootstrapRun::Skipped);
            }
            JobStart::NotPending => {
                tracing::debug!("job is not pending");
                return Ok(BootstrapRun::Skipped);
            }
        };

        let Some(integration) = self.store.find_integration(job.integration_id).await? else {
            return self.finish_failed(job, None, "integration not found").await;
        };

        match self.attempt(&integration).await {
            Ok(Attempt::Succeeded { outcome, webhook }) => {
                self.finish_succeeded(job, &integration, outcome, webhook)
                    .await
            }
            Ok(Attempt::Failed(message)) => {
                self.finish_failed(job, Some(&integration), &message).await
            }
            Err(e) => {
                let mut failed = job;
                failed.fail(e.to_string(), Utc::now());
                if let Err(finish) = self.store.finish_job(&failed).await {
                    tracing::error!(error = %finish, "could not mark bootstrap job failed");
                }
                Err(e)
            }
        }
    }

    async fn attempt(&self, integration: &Integration) -> Result<Attempt, LifecycleError> {
        let Some(credential) = self
            .store
            .find_active_credential(integration.user_id, &integration.provider)
            .await?
        else {
            return Ok(Attempt::Failed(
                "no active credential for integration".to_string(),
            ));
        };
        let secrets = match credential.secrets.decrypt(&self.cipher) {
            Ok(secrets) => secrets,
            Err(e) => return Ok(Attempt::Failed(e.to_string())),
        };
        let provider = match self.registry.resolve(&integration.provider) {
            Ok(provider) => provider,
            Err(e) => return Ok(Attempt::Failed(e.to_string())),
        };
        let config = provider.config();

        let request = BootstrapRequest {
            user_id: integration.user_id,
            integration_id: integration.id,
            access_token: secrets.access_token,
            refresh_token: secrets.refresh_token,
            api_key: secrets.api_key,
            api_secret: secrets.api_secret,
            hints: ProviderHints::from_additional_data(&credential.additional_data),
            webhook_url: config
                .supports_webhooks
                .then(|| self.settings.webhook_url(config.key)),
        };
        let outcome = match self.call_provider(provider.bootstrap(request)).await {
            Ok(outcome) => outcome,
            Err(e) => return Ok(Attempt::Failed(e.to_string())),
        };
        if !outcome.success {
            return Ok(Attempt::Failed(
                outcome
                    .error
                    .unwrap_or_else(|| "bootstrap failed".to_string()),
            ));
        }

        let webhook = match &outcome.webhook {
            Some(grant) => {
                let mut registration = WebhookRegistration::new(
                    integration.id,
                    config.key.as_str(),
                    &grant.webhook_url,
                    &grant.webhook_id,
                );
                registration.event_types.clone_from(&grant.event_types);
                registration.webhook_secret =
                    match self.cipher.encrypt_opt(grant.webhook_secret.as_deref()) {
                        Ok(secret) => secret,
                        Err(e) => return Ok(Attempt::Failed(e.to_string())),
                    };
                Some(registration)
            }
            None => None,
        };
        Ok(Attempt::Succeeded { outcome, webhook })
    }

    async fn finish_succeeded(
        &self,
        mut job: SyncJob,
        integration: &Integration,
        outcome: BootstrapOutcome,
        webhook: Option<WebhookRegistration>,
    ) -> Result<BootstrapRun, LifecycleError> {
        if let Some(registration) = &webhook {
            self.store.upsert_webhook_registration(registration).await?;
        }

        let interval = self.settings.sync_interval();
        let metadata = outcome.metadata.clone();
        let transition = self
            .transition_integration(integration.id, &StatusEvent::BootstrapSucceeded, |i| {
                i.merge_metadata(metadata.clone());
                i.next_sync_at = i.last_sync_at.map(|at| at + interval);
            })
            .await;
        let connected = match transition {
            Ok(Transition::Applied(connected)) => connected,
            Ok(Transition::Rejected(e)) => {
                return self.finish_failed(job, None, &e.to_string()).await;
            }
            Err(e) if e.is_not_found() => {
                return self.finish_failed(job, None, "integration not found").await;
            }
            Err(e) => return Err(e),
        };

        let summary = json!({
            "provider": connected.provider,
            "initial_sync_completed": outcome.initial_sync_completed,
            "webhook_registered": webhook.is_some(),
            "metadata_keys": connected.metadata.len(),
        });
        let summary = match summary {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        job.complete(summary, Utc::now());
        self.store.finish_job(&job).await?;

        tracing::info!(
            integration_id = %connected.id,
            job_id = %job.id,
            health_score = connected.health_score,
            "bootstrap completed"
        );
        self.audit(IntegrationLog::success(
            connected.user_id,
            &connected.provider,
            LogAction::Bootstrap,
            "bootstrap completed",
        ))
        .await;
        self.events.publish(LifecycleEvent::BootstrapCompleted {
            integration_id: connected.id,
            job_id: job.id,
        });
        Ok(BootstrapRun::Completed(job))
    }

    /// Fails a job left `running` by an attempt that never finished, and
    /// puts its integration in `error`. Jobs in any other state are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Datastore failures.
    #[instrument(skip(self))]
    pub async fn abandon_job(
        &self,
        job_id: SyncJobId,
        reason: &str,
    ) -> Result<BootstrapRun, LifecycleError> {
        let Some(job) = self.store.find_job(job_id).await? else {
            return Ok(BootstrapRun::Skipped);
        };
        if job.status != JobStatus::Running {
            return Ok(BootstrapRun::Skipped);
        }
        let integration = self.store.find_integration(job.integration_id).await?;
        self.finish_failed(job, integration.as_ref(), reason).await
    }

    async fn finish_failed(
        &self,
        mut job: SyncJob,
        integration: Option<&Integration>,
        message: &str,
    ) -> Result<BootstrapRun, LifecycleError> {
        tracing::warn!(job_id = %job.id, error = %message, "bootstrap failed");
        if let Some(integration) = integration {
            self.fail_integration(integration, LogAction::Bootstrap, message)
                .await?;
        }
        job.fail(message, Utc::now());
        self.store.finish_job(&job).await?;
        self.events.publish(LifecycleEvent::BootstrapFailed {
            integration_id: job.integration_id,
            job_id: job.id,
            error: message.to_string(),
        });
        Ok(BootstrapRun::Failed(job))
    }
}

/// Drains the bootstrap queue until shutdown.
pub struct BootstrapWorker {
    lifecycle: Lifecycle,
    rx: mpsc::Receiver<BootstrapTask>,
    shutdown: watch::Receiver<bool>,
}

impl BootstrapWorker {
    #[must_use]
    pub fn new(
        lifecycle: Lifecycle,
        rx: mpsc::Receiver<BootstrapTask>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lifecycle,
            rx,
            shutdown,
        }
    }

    /// Runs until shutdown is signalled or the queue closes, then waits
    /// for in-flight bootstraps.
    pub async fn run(self) {
        let Self {
            lifecycle,
            mut rx,
            mut shutdown,
        } = self;
        let mut tasks = JoinSet::new();

        // Nothing else runs bootstraps against this store, so a running row
        // here belongs to a worker that died.
        match lifecycle.store.running_jobs(REQUEUE_LIMIT).await {
            Ok(jobs) => {
                for job in jobs {
                    tracing::warn!(job_id = %job.id, "failing bootstrap job left running");
                    if let Err(e) = lifecycle.abandon_job(job.id, ABANDONED_JOB).await {
                        tracing::error!(job_id = %job.id, error = %e, "could not fail abandoned job");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "could not load running bootstrap jobs"),
        }

        match lifecycle.store.pending_jobs(REQUEUE_LIMIT).await {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    tracing::info!(count = jobs.len(), "requeueing pending bootstrap jobs");
                }
                for job in jobs {
                    spawn(&mut tasks, &lifecycle, job.id);
                }
            }
            Err(e) => tracing::error!(error = %e, "could not load pending bootstrap jobs"),
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                maybe = rx.recv() => {
                    let Some(task) = maybe else { break };
                    spawn(&mut tasks, &lifecycle, task.job_id);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_joined(joined),
            }
        }

        tracing::info!(in_flight = tasks.len(), "bootstrap worker stopping");
        while let Some(joined) = tasks.join_next().await {
            log_joined(joined);
        }
    }
}

type Joined = Result<(SyncJobId, Result<BootstrapRun, LifecycleError>), tokio::task::JoinError>;

fn spawn(
    tasks: &mut JoinSet<(SyncJobId, Result<BootstrapRun, LifecycleError>)>,
    lifecycle: &Lifecycle,
    job_id: SyncJobId,
) {
    let lifecycle = lifecycle.clone();
    tasks.spawn(async move {
        let run = AssertUnwindSafe(lifecycle.run_bootstrap(job_id))
            .catch_unwind()
            .await;
        let result = match run {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(%job_id, "bootstrap panicked");
                lifecycle.abandon_job(job_id, "bootstrap panicked").await
            }
        };
        (job_id, result)
    });
}

fn log_joined(joined: Joined) {
    match joined {
        Ok((job_id, Ok(run))) => {
            let outcome = match run {
                BootstrapRun::Completed(_) => "completed",
                BootstrapRun::Failed(_) => "failed",
                BootstrapRun::Skipped => "skipped",
            };
            tracing::debug!(%job_id, outcome, "bootstrap finished");
        }
        Ok((job_id, Err(e))) => tracing::error!(%job_id, error = %e, "bootstrap errored"),
        Err(e) => tracing::error!(error = %e, "bootstrap task panicked"),
    }
}
