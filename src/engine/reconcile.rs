//! Apply a parsed job result to the queue store.
//!
//! Every step only touches pending rows still bound to the job, so replaying
//! a result is a no-op. Rows the result leaves pending are released for the
//! next schedule pass.

use super::SyncEngine;
use crate::model::{Action, BatchJob, ErrorRecord, Operand};
use crate::platform::{ParsedResult, PlatformAdapter, PlatformError};
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReconcileSummary {
    pub synced: u64,
    pub errored: u64,
    pub quarantined: u64,
}

impl<A: PlatformAdapter> SyncEngine<A> {
    #[instrument(skip_all, fields(job_id = job.id, operand = %job.operand, action = %job.action))]
    pub(crate) async fn reconcile(
        &self,
        job: &BatchJob,
        parsed: &ParsedResult,
    ) -> Result<ReconcileSummary> {
        let index = job.metadata.correlation_index();

        let mut failures: BTreeMap<i64, &PlatformError> = BTreeMap::new();
        for (correlation, error) in &parsed.errors {
            match index.get(correlation.as_str()) {
                Some(&entity_id) => {
                    failures.insert(entity_id, error);
                }
                None => warn!(correlation = %correlation, "error for an operation this job never sent"),
            }
        }

        let mut summary = ReconcileSummary::default();
        match job.action {
            Action::Add => {
                let mut assignments: Vec<(i64, String)> = Vec::with_capacity(parsed.results.len());
                for (correlation, remote_id) in &parsed.results {
                    match index.get(correlation.as_str()) {
                        Some(&entity_id) if !failures.contains_key(&entity_id) => {
                            assignments.push((entity_id, remote_id.clone()));
                        }
                        Some(_) => {}
                        None => {
                            warn!(correlation = %correlation, "result for an operation this job never sent")
                        }
                    }
                }
                assignments.sort_unstable();
                let unanswered = job
                    .metadata
                    .entity_ids
                    .len()
                    .saturating_sub(assignments.len() + failures.len());
                if unanswered > 0 {
                    warn!(unanswered, "entities without a result stay pending");
                }
                summary.synced = self.apply_adds(job, &assignments).await?;
            }
            Action::Update | Action::Remove => {
                let succeeded: Vec<i64> = job
                    .metadata
                    .entity_ids
                    .iter()
                    .copied()
                    .filter(|id| !failures.contains_key(id))
                    .collect();
                summary.synced = self.apply_completions(job, &succeeded).await?;
            }
        }

        if !failures.is_empty() {
            let (errored, quarantined) = self.apply_failures(job, &failures).await?;
            summary.errored = errored;
            summary.quarantined = quarantined;
        }

        let released = self
            .queue
            .release_job(&self.namespace, job.operand, job.id)
            .await?;
        if released > 0 {
            debug!(released, "entities left pending for a later pass");
        }
        Ok(summary)
    }

    async fn apply_adds(&self, job: &BatchJob, assignments: &[(i64, String)]) -> Result<u64> {
        let ns = &self.namespace;
        let operand = job.operand;
        let mut promoted = 0;
        for batch in assignments.chunks(self.settings.flush_batch_size) {
            promoted += self.queue.promote_added(ns, operand, job.id, batch).await?;
            if operand == Operand::AdGroup {
                let children = self.queue.backfill_parent_remote_ids(ns, batch).await?;
                debug!(children, "parent remote ids back-filled");
            }
            let ids: Vec<i64> = batch.iter().map(|(id, _)| *id).collect();
            self.queue.clear_errors(ns, operand, &ids).await?;
        }
        if promoted > 0 {
            info!(promoted, "entities synced");
        }
        Ok(promoted)
    }

    async fn apply_completions(&self, job: &BatchJob, ids: &[i64]) -> Result<u64> {
        let ns = &self.namespace;
        let operand = job.operand;
        let mut completed = 0;
        for batch in ids.chunks(self.settings.flush_batch_size) {
            completed += match job.action {
                Action::Remove => self.queue.complete_deletes(ns, operand, job.id, batch).await?,
                _ => self.queue.complete_updates(ns, operand, job.id, batch).await?,
            };
            self.queue.clear_errors(ns, operand, batch).await?;
        }
        if completed > 0 {
            info!(completed, "pending changes applied");
        }
        Ok(completed)
    }

    /// Classify failures: permanent ones are quarantined with their
    /// dependents, the rest get an error record and stay pending.
    async fn apply_failures(
        &self,
        job: &BatchJob,
        failures: &BTreeMap<i64, &PlatformError>,
    ) -> Result<(u64, u64)> {
        let ns = &self.namespace;
        let ids: Vec<i64> = failures.keys().copied().collect();
        let pending = self.queue.fetch_pending(ns, job.operand, &ids).await?;

        let classifier = self.adapter.classifier();
        let mut permanent = Vec::new();
        let mut records = Vec::new();
        for entity in pending.iter().filter(|e| e.action == job.action) {
            let Some(error) = failures.get(&entity.id) else {
                continue;
            };
            let classification = classifier.classify(error);
            if classification.permanent {
                permanent.push(entity.id);
            } else {
                records.push(ErrorRecord {
                    operand: job.operand,
                    entity_id: entity.id,
                    account_id: entity.account_id,
                    campaign_id: entity.campaign_id,
                    action: job.action,
                    code: error.code,
                    reason: error.reason.clone(),
                    raw_message: error.message.clone(),
                    message: classification.message,
                });
            }
        }

        let mut quarantined = 0;
        for batch in permanent.chunks(self.settings.flush_batch_size) {
            self.queue.quarantine(ns, job.operand, batch).await?;
            quarantined += batch.len() as u64;
        }
        if quarantined > 0 {
            warn!(quarantined, "entities quarantined after permanent errors");
        }

        let mut errored = 0;
        for batch in records.chunks(self.settings.flush_batch_size) {
            self.queue.record_errors(ns, batch).await?;
            errored += batch.len() as u64;
        }
        if errored > 0 {
            let distinct: HashSet<&str> = records.iter().map(|r| r.message.as_str()).collect();
            info!(errored, kinds = distinct.len(), "entity errors recorded");
        }
        Ok((errored, quarantined))
    }
}
