//! Daemon for processing queued grading jobs.
//!
//! The daemon continuously claims queued grades from storage, bounded by a
//! concurrency limit, and runs the full ensemble plus settlement for each.
//! It is also the target for direct dispatch: the submission flow can hand a
//! specific grade id to [`GradingDaemon::process_one`], and re-delivery of an
//! already-claimed job is a no-op.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::Result;
use crate::settlement;
use crate::storage::Storage;
use crate::types::{DaemonId, GradeId};

use super::ensemble;
use super::job::{Grade, Processing};
use super::provider::GraderClient;

/// Configuration for the daemon loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Maximum number of grades to claim in each iteration
    pub claim_batch_size: usize,

    /// How long to sleep between claim iterations
    #[serde(with = "humantime_serde")]
    pub claim_interval: Duration,

    /// Maximum number of grading jobs processed concurrently
    pub max_concurrent_jobs: usize,

    /// Interval for logging daemon status (jobs in flight).
    /// None disables periodic status logging.
    #[serde(with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 10,
            claim_interval: Duration::from_secs(1),
            max_concurrent_jobs: 4,
            status_log_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Daemon that processes grading jobs end to end.
pub struct GradingDaemon<S, C>
where
    S: Storage,
    C: GraderClient,
{
    daemon_id: DaemonId,
    storage: Arc<S>,
    client: Arc<C>,
    grading: crate::config::GradingSettings,
    config: DaemonConfig,
    permits: Arc<Semaphore>,
    jobs_in_flight: Arc<AtomicUsize>,
}

impl<S, C> GradingDaemon<S, C>
where
    S: Storage + 'static,
    C: GraderClient + 'static,
{
    pub fn new(
        storage: Arc<S>,
        client: Arc<C>,
        grading: crate::config::GradingSettings,
        config: DaemonConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            daemon_id: DaemonId::new_v4(),
            storage,
            client,
            grading,
            config,
            permits,
            jobs_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn daemon_id(&self) -> DaemonId {
        self.daemon_id
    }

    /// Claim and process one specific grade.
    ///
    /// Returns without side effects when the grade is not `Queued`, which
    /// makes duplicate delivery of the same job harmless.
    pub async fn process_one(&self, grade_id: GradeId) -> Result<()> {
        match self.storage.claim(grade_id, self.daemon_id).await? {
            None => {
                tracing::debug!(grade_id = %grade_id, "grade not queued, skipping re-delivery");
                Ok(())
            }
            Some(grade) => self.process(grade).await,
        }
    }

    /// Run the ensemble for a claimed grade and settle the outcome.
    async fn process(&self, grade: Grade<Processing>) -> Result<()> {
        // Resolved per invocation; config changes apply to the next job.
        let config = self.grading.resolve();
        tracing::info!(
            grade_id = %grade.data.id,
            runs = config.runs.len(),
            "running grading ensemble"
        );

        match ensemble::run_ensemble(self.client.as_ref(), &grade.data.essay, &config).await {
            Ok(report) => settlement::settle_success(self.storage.as_ref(), grade, report).await,
            Err(exhausted) => {
                settlement::settle_failure(self.storage.as_ref(), grade, &exhausted).await
            }
        }
    }

    /// Run the daemon loop.
    ///
    /// Continuously claims and processes grades until the task is cancelled.
    #[tracing::instrument(skip(self), fields(daemon_id = %self.daemon_id))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("grading daemon starting main processing loop");

        if let Some(interval) = self.config.status_log_interval {
            let jobs_in_flight = self.jobs_in_flight.clone();
            let daemon_id = self.daemon_id;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    tracing::debug!(
                        daemon_id = %daemon_id,
                        jobs_in_flight = jobs_in_flight.load(Ordering::Relaxed),
                        "daemon status"
                    );
                }
            });
        }

        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished tasks (non-blocking).
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "grading task panicked");
                }
            }

            // Only claim what we have capacity to start right now; anything
            // claimed must run, there is no unclaim transition.
            let capacity = self
                .permits
                .available_permits()
                .min(self.config.claim_batch_size);
            if capacity == 0 {
                tokio::time::sleep(self.config.claim_interval).await;
                continue;
            }

            let claimed = self
                .storage
                .claim_queued(capacity, self.daemon_id)
                .await?;

            if claimed.is_empty() {
                tracing::trace!("no queued grades, sleeping");
                tokio::time::sleep(self.config.claim_interval).await;
                continue;
            }

            tracing::debug!(claimed_count = claimed.len(), "claimed grades from storage");

            for grade in claimed {
                let grade_id = grade.data.id;
                let permit = match self.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()), // Semaphore closed, daemon shutting down.
                };

                let daemon = self.clone();
                let jobs_in_flight = self.jobs_in_flight.clone();
                jobs_in_flight.fetch_add(1, Ordering::Relaxed);

                join_set.spawn(async move {
                    // Permit is held for the duration of this task.
                    let _permit = permit;
                    let _guard = scopeguard::guard((), move |_| {
                        jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    if let Err(error) = daemon.process(grade).await {
                        tracing::error!(grade_id = %grade_id, error = %error, "grading job failed to settle");
                    }
                });
            }
        }
    }
}
