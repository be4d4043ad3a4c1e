//! Schedule passes: discover accounts, chunk their backlog, build and submit.

use super::{chunk_ids, later, SyncEngine};
use crate::error::EngineError;
use crate::model::{
    Account, Action, Correlation, ErrorRecord, JobMetadata, JobStatus, NewBatchJob, Operand,
    PendingEntity,
};
use crate::platform::{
    build_operations, check_operand, BuildContext, BuildOutcome, BulkOperation, OperationSet,
    PlatformAdapter, Submission,
};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Reason recorded for extension adds that expand to no platform operation.
pub const NO_OPERATIONS: &str = "NO_OPERATIONS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Submitted,
    /// The chunk's campaign is gone and its backlog was purged.
    Purged,
    /// Nothing left to submit; resolved locally.
    Skipped,
    /// Upload failed; the account stops for this pass.
    Rejected,
}

fn sorted_unique(mut ids: Vec<i64>) -> Vec<i64> {
    ids.sort_unstable();
    ids.dedup();
    ids
}

impl<A: PlatformAdapter> SyncEngine<A> {
    /// One schedule pass for `(operand, action)` across every eligible account.
    #[instrument(skip_all, fields(platform = %self.adapter.platform(), operand = %operand, action = %action))]
    pub async fn schedule(&self, operand: Operand, action: Action) -> Result<()> {
        let ns = &self.namespace;
        if action == Action::Remove {
            let dropped = self
                .queue
                .drop_unsynced_deletes(ns, operand)
                .await
                .context("failed to resolve deletes of unsynced entities")?;
            if dropped > 0 {
                info!(dropped, "deletes of never-synced entities resolved locally");
            }
        }

        let busy = self
            .meta
            .accounts_with_outstanding_jobs(ns, operand, action)
            .await
            .context("failed to load outstanding jobs")?;
        let accounts: Vec<i64> = self
            .queue
            .accounts_with_pending(ns, operand, action)
            .await
            .context("failed to discover accounts with pending work")?
            .into_iter()
            .filter(|account_id| {
                let free = !busy.contains(account_id);
                if !free {
                    debug!(account_id = *account_id, "job outstanding; account skipped");
                }
                free
            })
            .collect();
        if accounts.is_empty() {
            debug!("nothing to schedule");
            return Ok(());
        }
        info!(accounts = accounts.len(), "scheduling");

        stream::iter(accounts)
            .for_each_concurrent(self.settings.pass_concurrency, |account_id| async move {
                if let Err(err) = self.schedule_account(account_id, operand, action).await {
                    self.account_failed(account_id, operand, action, &err).await;
                }
            })
            .await;
        Ok(())
    }

    async fn account_failed(
        &self,
        account_id: i64,
        operand: Operand,
        action: Action,
        err: &anyhow::Error,
    ) {
        let platform = self.adapter.platform();
        let message = match err.downcast_ref::<EngineError>() {
            Some(violation) if violation.is_contract_violation() => {
                error!(account_id, error = %violation, "contract violation; account aborted");
                format!(
                    "[{platform}] {operand} {action} aborted for account {account_id}: {violation}"
                )
            }
            _ => {
                error!(account_id, ?err, "schedule failed for account");
                format!("[{platform}] {operand} {action} failed for account {account_id}: {err:#}")
            }
        };
        self.notifier.notify(&message).await;
    }

    #[instrument(skip_all, fields(account_id = account_id))]
    async fn schedule_account(
        &self,
        account_id: i64,
        operand: Operand,
        action: Action,
    ) -> Result<()> {
        let ns = &self.namespace;
        let Some(account) = self.meta.account(ns, account_id).await? else {
            warn!("account not found; skipped");
            return Ok(());
        };
        if account.platform != self.adapter.platform() {
            return Ok(());
        }
        if account.remote_account_id.is_none() {
            debug!("account not provisioned; skipped");
            return Ok(());
        }

        let chunk_size = self.adapter.chunk_size(operand).max(1);
        let limit = chunk_size.saturating_mul(self.settings.parallel_job_ceiling);
        let ids = self
            .queue
            .pending_ids(ns, account_id, operand, action, limit)
            .await?;
        let chunks = chunk_ids(&ids, chunk_size);
        debug!(candidates = ids.len(), chunks = chunks.len(), "backlog paginated");

        let mut purged = false;
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.adapter.min_request_interval()).await;
            }
            match self
                .submit_chunk(&account, operand, action, chunk, purged)
                .await?
            {
                ChunkOutcome::Submitted | ChunkOutcome::Skipped => {}
                ChunkOutcome::Purged => purged = true,
                ChunkOutcome::Rejected => break,
            }
        }
        Ok(())
    }

    async fn submit_chunk(
        &self,
        account: &Account,
        operand: Operand,
        action: Action,
        ids: &[i64],
        after_purge: bool,
    ) -> Result<ChunkOutcome> {
        let ns = &self.namespace;
        let entities = self.queue.fetch_pending(ns, operand, ids).await?;
        if entities.is_empty() {
            if after_purge {
                debug!(requested = ids.len(), "chunk emptied by a campaign purge");
                return Ok(ChunkOutcome::Skipped);
            }
            return Err(EngineError::EmptyChunk {
                operand,
                action,
                requested: ids.len(),
            }
            .into());
        }
        check_operand(operand, &entities)?;

        let ctx = self.build_context(account, operand, &entities).await?;
        let set = match build_operations(self.adapter.as_ref(), action, &ctx, &entities)? {
            BuildOutcome::CampaignGone { campaign_id } => {
                let purged = self.queue.purge_campaign(ns, campaign_id).await?;
                info!(campaign_id, purged, "campaign gone; backlog purged");
                return Ok(ChunkOutcome::Purged);
            }
            BuildOutcome::Operations(set) => set,
        };

        let filtering = operand == Operand::Extension && action == Action::Add;
        if set.is_empty() && !filtering {
            return Err(EngineError::EmptyChunk {
                operand,
                action,
                requested: ids.len(),
            }
            .into());
        }
        set.check_parity(operand, action, entities.len())?;
        if set.operations.len() < entities.len() {
            self.discard_unpublishable(operand, action, &entities, &set.entity_ids)
                .await?;
            if set.is_empty() {
                return Ok(ChunkOutcome::Skipped);
            }
        }

        self.submit(account, operand, action, set).await
    }

    async fn submit(
        &self,
        account: &Account,
        operand: Operand,
        action: Action,
        set: OperationSet<A::Operation>,
    ) -> Result<ChunkOutcome> {
        let platform = self.adapter.platform();
        let metadata = JobMetadata {
            entity_ids: set.entity_ids.clone(),
            correlations: set
                .operations
                .iter()
                .map(|op| Correlation {
                    correlation_id: op.correlation_id(),
                    entity_id: op.entity_id(),
                })
                .collect(),
        };
        let mut job = NewBatchJob {
            namespace: self.namespace.clone(),
            platform,
            account_id: account.id,
            operand,
            action,
            job_token: String::new(),
            submission_id: Uuid::new_v4().to_string(),
            status: JobStatus::PendingResult,
            execute_at: Utc::now(),
            metadata,
            inline_result: None,
            last_error: None,
        };

        match self
            .adapter
            .upload_operations(account, operand, action, &set.operations)
            .await
        {
            Ok(submission) => {
                let (job_token, inline_result) = match submission {
                    Submission::Pending { job_token } => (job_token, None),
                    Submission::Completed { job_token, payload } => (job_token, Some(payload)),
                };
                job.job_token = job_token;
                job.inline_result = inline_result;
                job.execute_at = later(Utc::now(), self.settings.submit_delay);
                let job = self.meta.create_job(job).await?;
                self.queue
                    .mark_submitted(&self.namespace, operand, job.id, &set.entity_ids)
                    .await?;
                info!(
                    job_id = job.id,
                    operations = set.operations.len(),
                    inline = job.inline_result.is_some(),
                    "job submitted"
                );
                Ok(ChunkOutcome::Submitted)
            }
            Err(err) => {
                let message = format!("{err:#}");
                job.status = JobStatus::Error;
                job.last_error = Some(message.clone());
                let job = self.meta.create_job(job).await?;
                error!(job_id = job.id, error = %message, "upload failed; remaining chunks deferred");
                self.notifier
                    .notify(&format!(
                        "[{platform}] {operand} {action} upload failed for account {} (job {}): {message}",
                        account.id, job.id
                    ))
                    .await;
                Ok(ChunkOutcome::Rejected)
            }
        }
    }

    /// Campaigns and parent ad group remote ids for a chunk, loaded in bulk.
    async fn build_context(
        &self,
        account: &Account,
        operand: Operand,
        entities: &[PendingEntity],
    ) -> Result<BuildContext> {
        let ns = &self.namespace;
        let campaign_ids = sorted_unique(entities.iter().map(|e| e.campaign_id).collect());
        let campaigns = self.meta.campaigns(ns, &campaign_ids).await?;

        let parents = if operand.has_ad_group_parent() {
            sorted_unique(
                entities
                    .iter()
                    .filter(|e| e.remote_parent_id.is_none())
                    .filter_map(|e| e.parent_id)
                    .collect(),
            )
        } else {
            Vec::new()
        };
        let parent_remote_ids = if parents.is_empty() {
            HashMap::new()
        } else {
            self.queue
                .synced_remote_ids(ns, Operand::AdGroup, &parents)
                .await?
        };

        Ok(BuildContext {
            account: account.clone(),
            campaigns,
            parent_remote_ids,
        })
    }

    /// Dequeue entities the build dropped and leave an error record behind.
    async fn discard_unpublishable(
        &self,
        operand: Operand,
        action: Action,
        entities: &[PendingEntity],
        kept: &[i64],
    ) -> Result<()> {
        let kept: HashSet<i64> = kept.iter().copied().collect();
        let dropped: Vec<&PendingEntity> =
            entities.iter().filter(|e| !kept.contains(&e.id)).collect();
        let ids: Vec<i64> = dropped.iter().map(|e| e.id).collect();
        let records: Vec<ErrorRecord> = dropped
            .iter()
            .map(|e| ErrorRecord {
                operand,
                entity_id: e.id,
                account_id: e.account_id,
                campaign_id: e.campaign_id,
                action,
                code: None,
                reason: Some(NO_OPERATIONS.to_string()),
                raw_message: "entity expands to no platform operation".to_string(),
                message: "The extension has no publishable content.".to_string(),
            })
            .collect();

        let ns = &self.namespace;
        self.queue.discard_pending(ns, operand, action, &ids).await?;
        self.queue.record_errors(ns, &records).await?;
        info!(count = ids.len(), "unpublishable entities dequeued");
        Ok(())
    }
}
