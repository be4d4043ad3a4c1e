//! `MetadataStore` over SQLite: accounts, campaigns and batch jobs.
//!
//! Job transitions are guarded on `status = 'PendingResult'` and on the
//! `version` column, so a concurrent poller that read a stale row cannot
//! move a job twice.

use super::model::{account_from_row, campaign_from_row, job_from_row, JOB_COLUMNS};
use super::{push_ids, to_millis, SqliteStore, IN_BATCH};
use crate::model::{
    Account, Action, BatchJob, Campaign, JobStatus, Namespace, NewBatchJob, Operand, Platform,
};
use crate::store::MetadataStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::{HashMap, HashSet};
use tracing::instrument;

impl SqliteStore {
    pub async fn job(&self, job_id: i64) -> Result<Option<BatchJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Every job of a namespace, newest first.
    pub async fn jobs(&self, ns: &Namespace, limit: usize) -> Result<Vec<BatchJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE namespace = ? ORDER BY id DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(ns.as_str())
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn account(&self, ns: &Namespace, account_id: i64) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT id, platform, name, remote_account_id FROM accounts \
             WHERE namespace = ? AND id = ?",
        )
        .bind(ns.as_str())
        .bind(account_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn campaigns(&self, ns: &Namespace, ids: &[i64]) -> Result<HashMap<i64, Campaign>> {
        let mut out = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(IN_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT id, account_id, name, remote_campaign_id FROM campaigns WHERE namespace = ",
            );
            qb.push_bind(ns.as_str());
            qb.push(" AND id IN ");
            push_ids(&mut qb, batch);
            for row in qb.build().fetch_all(self.pool()).await? {
                let campaign = campaign_from_row(&row);
                out.insert(campaign.id, campaign);
            }
        }
        Ok(out)
    }

    #[instrument(skip_all, fields(operand = %operand, action = %action))]
    async fn accounts_with_outstanding_jobs(
        &self,
        ns: &Namespace,
        operand: Operand,
        action: Action,
    ) -> Result<HashSet<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT account_id FROM batch_jobs \
             WHERE namespace = ? AND operand = ? AND action = ? AND status = 'PendingResult'",
        )
        .bind(ns.as_str())
        .bind(operand.as_str())
        .bind(action.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip_all, fields(account_id = job.account_id, operand = %job.operand))]
    async fn create_job(&self, job: NewBatchJob) -> Result<BatchJob> {
        let now = to_millis(Utc::now());
        let metadata = serde_json::to_string(&job.metadata)?;
        let id: i64 = sqlx::query(
            "INSERT INTO batch_jobs \
                (namespace, platform, account_id, operand, action, job_token, submission_id, \
                 status, attempts, execute_at, metadata, inline_result, last_error, version, \
                 created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 0, ?, ?) RETURNING id",
        )
        .bind(job.namespace.as_str())
        .bind(job.platform.as_str())
        .bind(job.account_id)
        .bind(job.operand.as_str())
        .bind(job.action.as_str())
        .bind(&job.job_token)
        .bind(&job.submission_id)
        .bind(job.status.as_str())
        .bind(to_millis(job.execute_at))
        .bind(&metadata)
        .bind(job.inline_result.as_deref())
        .bind(job.last_error.as_deref())
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .context("failed to persist batch job")?
        .get("id");
        self.job(id)
            .await?
            .ok_or_else(|| anyhow!("batch job {} vanished after insert", id))
    }

    #[instrument(skip_all, fields(platform = %platform))]
    async fn due_jobs(
        &self,
        ns: &Namespace,
        platform: Platform,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BatchJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs \
             WHERE namespace = ? AND platform = ? AND status = 'PendingResult' AND execute_at <= ? \
             ORDER BY execute_at ASC, id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(ns.as_str())
            .bind(platform.as_str())
            .bind(to_millis(now))
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn outstanding_jobs(&self, ns: &Namespace) -> Result<Vec<BatchJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM batch_jobs \
             WHERE namespace = ? AND status = 'PendingResult' ORDER BY execute_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(ns.as_str())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip_all, fields(job_id = job.id, attempts = attempts))]
    async fn claim_poll_attempt(
        &self,
        job: &BatchJob,
        attempts: i32,
        execute_at: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let res = sqlx::query(
            "UPDATE batch_jobs SET attempts = ?, execute_at = ?, version = version + 1, \
                updated_at = ? \
             WHERE id = ? AND version = ? AND status = 'PendingResult'",
        )
        .bind(attempts)
        .bind(to_millis(execute_at))
        .bind(to_millis(Utc::now()))
        .bind(job.id)
        .bind(job.version)
        .execute(self.pool())
        .await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.job(job.id).await
    }

    async fn record_platform_status(&self, job_id: i64, platform_status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE batch_jobs SET platform_status = ?, updated_at = ? \
             WHERE id = ? AND status = 'PendingResult'",
        )
        .bind(platform_status)
        .bind(to_millis(Utc::now()))
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = job.id, status = %status))]
    async fn finish_job(
        &self,
        job: &BatchJob,
        status: JobStatus,
        last_error: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE batch_jobs SET status = ?, last_error = COALESCE(?, last_error), \
                version = version + 1, updated_at = ? \
             WHERE id = ? AND version = ? AND status = 'PendingResult'",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(to_millis(Utc::now()))
        .bind(job.id)
        .bind(job.version)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }
}
