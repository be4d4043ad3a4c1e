//! Store contracts consumed by the engine.
//!
//! The queue store holds pending, synced and error collections per entity
//! kind; the metadata store holds accounts, campaigns and batch jobs. Both
//! take the namespace explicitly on every call.
use crate::model::{
    Account, Action, BatchJob, Campaign, ErrorRecord, JobStatus, Namespace, NewBatchJob, Operand,
    PendingEntity, Platform,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Accounts with at least one entity ready to submit for `action`.
    async fn accounts_with_pending(
        &self,
        ns: &Namespace,
        operand: Operand,
        action: Action,
    ) -> Result<Vec<i64>>;

    /// Ids of entities ready to submit, ascending, at most `limit`.
    async fn pending_ids(
        &self,
        ns: &Namespace,
        account_id: i64,
        operand: Operand,
        action: Action,
        limit: usize,
    ) -> Result<Vec<i64>>;

    /// Fetch pending entities by id. Missing ids are silently absent.
    async fn fetch_pending(
        &self,
        ns: &Namespace,
        operand: Operand,
        ids: &[i64],
    ) -> Result<Vec<PendingEntity>>;

    /// Remote ids of synced entities, keyed by local id.
    async fn synced_remote_ids(
        &self,
        ns: &Namespace,
        operand: Operand,
        ids: &[i64],
    ) -> Result<HashMap<i64, String>>;

    /// Remove pending deletes of entities that never reached the platform.
    /// Rows bound to a running job are left alone.
    async fn drop_unsynced_deletes(&self, ns: &Namespace, operand: Operand) -> Result<u64>;

    /// Bind pending rows to the job they were submitted with. Later changes to
    /// a bound row are held as a follow-up instead of replacing it.
    async fn mark_submitted(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        ids: &[i64],
    ) -> Result<u64>;

    /// Assign remote ids to pending adds of `job_id` and move them into the
    /// synced collection. A held follow-up becomes the row's next pending change.
    async fn promote_added(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        assignments: &[(i64, String)],
    ) -> Result<u64>;

    /// Record freshly assigned ad group remote ids on their pending children.
    async fn backfill_parent_remote_ids(
        &self,
        ns: &Namespace,
        parents: &[(i64, String)],
    ) -> Result<u64>;

    /// Copy submitted update content of `job_id` into the synced collection and
    /// dequeue, keeping any held follow-up queued.
    async fn complete_updates(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        ids: &[i64],
    ) -> Result<u64>;

    /// Drop synced rows of entities removed by `job_id` and dequeue them.
    async fn complete_deletes(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        ids: &[i64],
    ) -> Result<u64>;

    /// Unbind rows still held by `job_id`, folding held follow-ups into them.
    async fn release_job(&self, ns: &Namespace, operand: Operand, job_id: i64) -> Result<u64>;

    /// Dequeue entities that resolve without a platform call.
    async fn discard_pending(
        &self,
        ns: &Namespace,
        operand: Operand,
        action: Action,
        ids: &[i64],
    ) -> Result<u64>;

    /// Drop the pending backlog and error records of a campaign.
    async fn purge_campaign(&self, ns: &Namespace, campaign_id: i64) -> Result<u64>;

    /// Remove entities and their dependents from pending, synced and error collections.
    async fn quarantine(&self, ns: &Namespace, operand: Operand, ids: &[i64]) -> Result<u64>;

    /// Upsert one error record per entity.
    async fn record_errors(&self, ns: &Namespace, records: &[ErrorRecord]) -> Result<u64>;

    async fn clear_errors(&self, ns: &Namespace, operand: Operand, ids: &[i64]) -> Result<u64>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn account(&self, ns: &Namespace, account_id: i64) -> Result<Option<Account>>;

    async fn campaigns(&self, ns: &Namespace, ids: &[i64]) -> Result<HashMap<i64, Campaign>>;

    /// Accounts holding a `PendingResult` job for the operand/action pair.
    async fn accounts_with_outstanding_jobs(
        &self,
        ns: &Namespace,
        operand: Operand,
        action: Action,
    ) -> Result<HashSet<i64>>;

    async fn create_job(&self, job: NewBatchJob) -> Result<BatchJob>;

    /// `PendingResult` jobs due at `now`, oldest `execute_at` first.
    async fn due_jobs(
        &self,
        ns: &Namespace,
        platform: Platform,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BatchJob>>;

    async fn outstanding_jobs(&self, ns: &Namespace) -> Result<Vec<BatchJob>>;

    /// Bump the attempt counter and reschedule. Returns `None` when the job
    /// changed since `job` was read.
    async fn claim_poll_attempt(
        &self,
        job: &BatchJob,
        attempts: i32,
        execute_at: DateTime<Utc>,
    ) -> Result<Option<BatchJob>>;

    async fn record_platform_status(&self, job_id: i64, platform_status: &str) -> Result<()>;

    /// Move a `PendingResult` job to a terminal status. Returns `false` when
    /// the job changed since `job` was read.
    async fn finish_job(
        &self,
        job: &BatchJob,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> Result<bool>;
}
