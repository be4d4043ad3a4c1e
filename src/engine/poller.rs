//! Check passes: claim due jobs, poll them and hand finished results to the
//! reconciler.

use super::{backoff_delay, later, SyncEngine};
use crate::error::EngineError;
use crate::model::{BatchJob, JobStatus};
use crate::platform::{PlatformAdapter, PollStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, instrument, warn};

/// What one poll attempt did with its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poller changed the job first.
    Contended,
    InProgress,
    /// The platform failed the job, or it ran out of status checks.
    Failed,
    /// The result was empty or unreadable; the job stays pending.
    Deferred,
    Completed,
}

impl<A: PlatformAdapter> SyncEngine<A> {
    /// One check pass over the platform's due jobs, oldest first.
    #[instrument(skip_all, fields(platform = %self.adapter.platform()))]
    pub async fn check_batch_job_result(&self) -> Result<()> {
        let jobs = self
            .meta
            .due_jobs(
                &self.namespace,
                self.adapter.platform(),
                Utc::now(),
                self.settings.poll_batch_limit,
            )
            .await
            .context("failed to list due jobs")?;
        if jobs.is_empty() {
            debug!("no due jobs");
            return Ok(());
        }
        info!(jobs = jobs.len(), "polling due jobs");

        stream::iter(jobs)
            .for_each_concurrent(self.settings.poll_concurrency, |job| async move {
                let job_id = job.id;
                if let Err(err) = self.poll_job(job).await {
                    self.poll_failed(job_id, &err).await;
                }
            })
            .await;
        Ok(())
    }

    async fn poll_failed(&self, job_id: i64, err: &anyhow::Error) {
        match err.downcast_ref::<EngineError>() {
            Some(violation) if violation.is_contract_violation() => {
                error!(job_id, error = %violation, "contract violation while reconciling");
                self.notifier
                    .notify(&format!(
                        "[{}] job {job_id} could not be reconciled: {violation}",
                        self.adapter.platform()
                    ))
                    .await;
            }
            // Backoff is already in place; the next due pass retries.
            _ => warn!(job_id, ?err, "poll attempt failed; will retry"),
        }
    }

    /// Claim one poll attempt for `job` and act on what the platform reports.
    #[instrument(skip_all, fields(job_id = job.id, operand = %job.operand, action = %job.action))]
    pub async fn poll_job(&self, job: BatchJob) -> Result<PollOutcome> {
        let attempts = job.attempts.saturating_add(1);
        let count = u32::try_from(attempts).unwrap_or(u32::MAX);
        let delay = backoff_delay(self.settings.backoff_base, count, self.settings.max_backoff);
        let Some(job) = self
            .meta
            .claim_poll_attempt(&job, attempts, later(Utc::now(), delay))
            .await?
        else {
            debug!("job changed since it was listed; skipped");
            return Ok(PollOutcome::Contended);
        };

        let platform = self.adapter.platform();
        let threshold = self.settings.stuck_attempt_threshold;
        if count >= threshold {
            warn!(attempts, threshold, "job looks stuck");
            if count == threshold {
                self.notifier
                    .notify(&format!(
                        "[{platform}] job {} ({} {}, account {}) is still pending after {attempts} polls",
                        job.id, job.operand, job.action, job.account_id
                    ))
                    .await;
            }
        }
        if count > self.settings.max_poll_attempts {
            let message = format!("no result after {} status checks", count - 1);
            self.fail_job(&job, &message).await?;
            return Ok(PollOutcome::Failed);
        }

        let Some(account) = self.meta.account(&self.namespace, job.account_id).await? else {
            self.fail_job(&job, "account no longer exists").await?;
            return Ok(PollOutcome::Failed);
        };

        let raw = match job.inline_result.clone() {
            Some(payload) => payload,
            None => {
                let status = self
                    .adapter
                    .poll_status(&account, &job.job_token)
                    .await
                    .context("status poll failed")?;
                self.meta.record_platform_status(job.id, status.raw()).await?;
                match status {
                    PollStatus::InProgress(raw) => {
                        debug!(status = %raw, "job still running");
                        return Ok(PollOutcome::InProgress);
                    }
                    PollStatus::Failed(raw) => {
                        self.fail_job(&job, &format!("platform reported {raw}"))
                            .await?;
                        return Ok(PollOutcome::Failed);
                    }
                    PollStatus::Succeeded(_) => {}
                }
                let fetched = self
                    .adapter
                    .fetch_result(&account, &job.job_token)
                    .await
                    .context("result download failed")?;
                match fetched.filter(|raw| !raw.trim().is_empty()) {
                    Some(raw) => raw,
                    None => {
                        self.defer(&job, "the result payload is empty").await;
                        return Ok(PollOutcome::Deferred);
                    }
                }
            }
        };

        let parsed = match self.adapter.parse_result(&raw, job.operand, job.action) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.defer(&job, &err.to_string()).await;
                return Ok(PollOutcome::Deferred);
            }
        };

        let summary = self.reconcile(&job, &parsed).await?;
        if self.meta.finish_job(&job, JobStatus::Complete, None).await? {
            info!(
                synced = summary.synced,
                errored = summary.errored,
                quarantined = summary.quarantined,
                "job complete"
            );
        } else {
            warn!("job changed during reconciliation; status left untouched");
        }
        Ok(PollOutcome::Completed)
    }

    async fn fail_job(&self, job: &BatchJob, reason: &str) -> Result<()> {
        if !self
            .meta
            .finish_job(job, JobStatus::Failed, Some(reason))
            .await?
        {
            warn!("job changed before it could be failed");
            return Ok(());
        }
        let released = self
            .queue
            .release_job(&self.namespace, job.operand, job.id)
            .await?;
        error!(reason, released, "job failed");
        self.notifier
            .notify(&format!(
                "[{}] job {} ({} {}, account {}) failed: {reason}",
                self.adapter.platform(),
                job.id,
                job.operand,
                job.action,
                job.account_id
            ))
            .await;
        Ok(())
    }

    /// Leave the job pending for the next due pass and tell an operator.
    async fn defer(&self, job: &BatchJob, reason: &str) {
        warn!(reason, "job result unusable; retrying later");
        self.notifier
            .notify(&format!(
                "[{}] job {} ({} {}, account {}) returned no usable result: {reason}",
                self.adapter.platform(),
                job.id,
                job.operand,
                job.action,
                job.account_id
            ))
            .await;
    }
}
