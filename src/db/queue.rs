//! `QueueStore` over SQLite.
//!
//! Pending rows are joined against their campaign, their own synced row and
//! (for keywords and ads) the parent ad group's synced row, so discovery only
//! returns entities the platform can accept right now. Rows whose campaign is
//! gone are always returned; the engine purges them. Rows bound to a running
//! job are never rediscovered, and reconciliation only settles rows bound to
//! the job being reconciled.

use super::model::pending_from_row;
use super::{push_ids, to_millis, SqliteStore, IN_BATCH};
use crate::model::{Action, ErrorRecord, Namespace, Operand, PendingEntity};
use crate::store::QueueStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use std::collections::HashMap;
use tracing::instrument;

const PENDING_FROM: &str = "FROM pending_entities p \
     LEFT JOIN campaigns c ON c.namespace = p.namespace AND c.id = p.campaign_id \
     LEFT JOIN synced_entities s \
        ON s.namespace = p.namespace AND s.kind = p.kind AND s.entity_id = p.entity_id \
     LEFT JOIN synced_entities ps \
        ON ps.namespace = p.namespace AND ps.kind = 'ad_group' AND ps.entity_id = p.parent_id";

fn readiness(operand: Operand, action: Action) -> &'static str {
    match action {
        Action::Add if operand.has_ad_group_parent() => {
            "(c.id IS NULL OR (c.remote_campaign_id IS NOT NULL \
              AND COALESCE(p.remote_parent_id, ps.remote_id) IS NOT NULL))"
        }
        Action::Add => "(c.id IS NULL OR c.remote_campaign_id IS NOT NULL)",
        Action::Update | Action::Remove => {
            "(c.id IS NULL OR COALESCE(p.remote_id, s.remote_id) IS NOT NULL)"
        }
    }
}

async fn delete_by_parent(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    ns: &Namespace,
    kind: Operand,
    parent_ids: &[i64],
) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE namespace = "));
    qb.push_bind(ns.as_str());
    qb.push(" AND kind = ");
    qb.push_bind(kind.as_str());
    qb.push(" AND parent_id IN ");
    push_ids(&mut qb, parent_ids);
    Ok(qb.build().execute(&mut **tx).await?.rows_affected())
}

async fn delete_by_id(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    ns: &Namespace,
    kind: Operand,
    ids: &[i64],
    action: Option<Action>,
) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE namespace = "));
    qb.push_bind(ns.as_str());
    qb.push(" AND kind = ");
    qb.push_bind(kind.as_str());
    if let Some(action) = action {
        qb.push(" AND action = ");
        qb.push_bind(action.as_str());
    }
    qb.push(" AND entity_id IN ");
    push_ids(&mut qb, ids);
    Ok(qb.build().execute(&mut **tx).await?.rows_affected())
}

/// Dequeue rows of `job_id` the platform accepted. A row holding a follow-up
/// stays queued with the follow-up as its next change.
async fn settle_accepted(
    tx: &mut Transaction<'_, Sqlite>,
    ns: &Namespace,
    kind: Operand,
    job_id: i64,
    ids: &[i64],
) -> Result<u64> {
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM pending_entities WHERE namespace = ");
    qb.push_bind(ns.as_str());
    qb.push(" AND kind = ");
    qb.push_bind(kind.as_str());
    qb.push(" AND job_id = ");
    qb.push_bind(job_id);
    qb.push(" AND follow_up_action IS NULL AND entity_id IN ");
    push_ids(&mut qb, ids);
    let dequeued = qb.build().execute(&mut **tx).await?.rows_affected();

    let mut qb = QueryBuilder::<Sqlite>::new(
        "UPDATE pending_entities SET action = follow_up_action, \
            content = COALESCE(follow_up_content, content), job_id = NULL, \
            follow_up_action = NULL, follow_up_content = NULL, queued_at = ",
    );
    qb.push_bind(to_millis(Utc::now()));
    qb.push(" WHERE namespace = ");
    qb.push_bind(ns.as_str());
    qb.push(" AND kind = ");
    qb.push_bind(kind.as_str());
    qb.push(" AND job_id = ");
    qb.push_bind(job_id);
    qb.push(" AND entity_id IN ");
    push_ids(&mut qb, ids);
    let requeued = qb.build().execute(&mut **tx).await?.rows_affected();
    Ok(dequeued + requeued)
}

#[async_trait]
impl QueueStore for SqliteStore {
    #[instrument(skip_all, fields(operand = %operand, action = %action))]
    async fn accounts_with_pending(
        &self,
        ns: &Namespace,
        operand: Operand,
        action: Action,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT DISTINCT p.account_id {PENDING_FROM} \
             WHERE p.namespace = ? AND p.kind = ? AND p.action = ? AND p.job_id IS NULL AND {} \
             ORDER BY p.account_id",
            readiness(operand, action)
        );
        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(ns.as_str())
            .bind(operand.as_str())
            .bind(action.as_str())
            .fetch_all(self.pool())
            .await?;
        Ok(ids)
    }

    #[instrument(skip_all, fields(account_id = account_id, operand = %operand, action = %action))]
    async fn pending_ids(
        &self,
        ns: &Namespace,
        account_id: i64,
        operand: Operand,
        action: Action,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT p.entity_id {PENDING_FROM} \
             WHERE p.namespace = ? AND p.kind = ? AND p.action = ? AND p.account_id = ? \
               AND p.job_id IS NULL AND {} \
             ORDER BY p.entity_id LIMIT ?",
            readiness(operand, action)
        );
        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(ns.as_str())
            .bind(operand.as_str())
            .bind(action.as_str())
            .bind(account_id)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        Ok(ids)
    }

    #[instrument(skip_all, fields(operand = %operand, count = ids.len()))]
    async fn fetch_pending(
        &self,
        ns: &Namespace,
        operand: Operand,
        ids: &[i64],
    ) -> Result<Vec<PendingEntity>> {
        let mut out = Vec::with_capacity(ids.len());
        for batch in ids.chunks(IN_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT p.entity_id, p.account_id, p.campaign_id, p.parent_id, p.action, p.content, \
                        COALESCE(p.remote_id, s.remote_id) AS remote_id, \
                        COALESCE(p.remote_parent_id, ps.remote_id) AS remote_parent_id \
                 {PENDING_FROM} WHERE p.namespace = "
            ));
            qb.push_bind(ns.as_str());
            qb.push(" AND p.kind = ");
            qb.push_bind(operand.as_str());
            qb.push(" AND p.entity_id IN ");
            push_ids(&mut qb, batch);
            qb.push(" ORDER BY p.entity_id");
            for row in qb.build().fetch_all(self.pool()).await? {
                out.push(pending_from_row(&row)?);
            }
        }
        Ok(out)
    }

    #[instrument(skip_all, fields(operand = %operand, count = ids.len()))]
    async fn synced_remote_ids(
        &self,
        ns: &Namespace,
        operand: Operand,
        ids: &[i64],
    ) -> Result<HashMap<i64, String>> {
        let mut out = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(IN_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT entity_id, remote_id FROM synced_entities WHERE namespace = ",
            );
            qb.push_bind(ns.as_str());
            qb.push(" AND kind = ");
            qb.push_bind(operand.as_str());
            qb.push(" AND entity_id IN ");
            push_ids(&mut qb, batch);
            for row in qb.build().fetch_all(self.pool()).await? {
                out.insert(row.get("entity_id"), row.get("remote_id"));
            }
        }
        Ok(out)
    }

    #[instrument(skip_all, fields(operand = %operand))]
    async fn drop_unsynced_deletes(&self, ns: &Namespace, operand: Operand) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM pending_entities \
             WHERE namespace = ? AND kind = ? AND action = 'remove' AND remote_id IS NULL \
               AND job_id IS NULL \
               AND NOT EXISTS (SELECT 1 FROM synced_entities s \
                   WHERE s.namespace = pending_entities.namespace \
                     AND s.kind = pending_entities.kind \
                     AND s.entity_id = pending_entities.entity_id)",
        )
        .bind(ns.as_str())
        .bind(operand.as_str())
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip_all, fields(operand = %operand, job_id = job_id, count = ids.len()))]
    async fn mark_submitted(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        ids: &[i64],
    ) -> Result<u64> {
        let mut marked = 0;
        let mut tx = self.pool().begin().await?;
        for batch in ids.chunks(IN_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE pending_entities SET job_id = ");
            qb.push_bind(job_id);
            qb.push(" WHERE namespace = ");
            qb.push_bind(ns.as_str());
            qb.push(" AND kind = ");
            qb.push_bind(operand.as_str());
            qb.push(" AND job_id IS NULL AND entity_id IN ");
            push_ids(&mut qb, batch);
            marked += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(marked)
    }

    #[instrument(skip_all, fields(operand = %operand, job_id = job_id, count = assignments.len()))]
    async fn promote_added(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        assignments: &[(i64, String)],
    ) -> Result<u64> {
        let now = to_millis(Utc::now());
        let mut promoted = 0;
        let mut tx = self.pool().begin().await?;
        for (entity_id, remote_id) in assignments {
            sqlx::query(
                "UPDATE pending_entities SET remote_id = ? \
                 WHERE namespace = ? AND kind = ? AND entity_id = ? AND job_id = ? \
                   AND action = 'add'",
            )
            .bind(remote_id)
            .bind(ns.as_str())
            .bind(operand.as_str())
            .bind(entity_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO synced_entities \
                    (namespace, kind, entity_id, account_id, campaign_id, parent_id, content, \
                     remote_id, remote_parent_id, synced_at) \
                 SELECT namespace, kind, entity_id, account_id, campaign_id, parent_id, content, \
                        remote_id, remote_parent_id, ? \
                 FROM pending_entities \
                 WHERE namespace = ? AND kind = ? AND entity_id = ? AND job_id = ? \
                   AND action = 'add' \
                 ON CONFLICT (namespace, kind, entity_id) DO UPDATE SET \
                    content = excluded.content, remote_id = excluded.remote_id, \
                    remote_parent_id = excluded.remote_parent_id, synced_at = excluded.synced_at",
            )
            .bind(now)
            .bind(ns.as_str())
            .bind(operand.as_str())
            .bind(entity_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            promoted += settle_accepted(&mut tx, ns, operand, job_id, &[*entity_id]).await?;
        }
        tx.commit().await?;
        Ok(promoted)
    }

    #[instrument(skip_all, fields(count = parents.len()))]
    async fn backfill_parent_remote_ids(
        &self,
        ns: &Namespace,
        parents: &[(i64, String)],
    ) -> Result<u64> {
        let mut updated = 0;
        let mut tx = self.pool().begin().await?;
        for (parent_id, remote_id) in parents {
            updated += sqlx::query(
                "UPDATE pending_entities SET remote_parent_id = ? \
                 WHERE namespace = ? AND parent_id = ? AND kind IN ('keyword', 'ad')",
            )
            .bind(remote_id)
            .bind(ns.as_str())
            .bind(parent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    #[instrument(skip_all, fields(operand = %operand, job_id = job_id, count = ids.len()))]
    async fn complete_updates(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        ids: &[i64],
    ) -> Result<u64> {
        let now = to_millis(Utc::now());
        let mut completed = 0;
        let mut tx = self.pool().begin().await?;
        for batch in ids.chunks(IN_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "UPDATE synced_entities SET content = ( \
                    SELECT p.content FROM pending_entities p \
                    WHERE p.namespace = synced_entities.namespace AND p.kind = synced_entities.kind \
                      AND p.entity_id = synced_entities.entity_id AND p.action = 'update' \
                      AND p.job_id = ",
            );
            qb.push_bind(job_id);
            qb.push("), synced_at = ");
            qb.push_bind(now);
            qb.push(" WHERE namespace = ");
            qb.push_bind(ns.as_str());
            qb.push(" AND kind = ");
            qb.push_bind(operand.as_str());
            qb.push(" AND entity_id IN ");
            push_ids(&mut qb, batch);
            qb.push(
                " AND EXISTS (SELECT 1 FROM pending_entities p \
                    WHERE p.namespace = synced_entities.namespace AND p.kind = synced_entities.kind \
                      AND p.entity_id = synced_entities.entity_id AND p.action = 'update' \
                      AND p.job_id = ",
            );
            qb.push_bind(job_id);
            qb.push(")");
            qb.build().execute(&mut *tx).await?;
            completed += settle_accepted(&mut tx, ns, operand, job_id, batch).await?;
        }
        tx.commit().await?;
        Ok(completed)
    }

    #[instrument(skip_all, fields(operand = %operand, job_id = job_id, count = ids.len()))]
    async fn complete_deletes(
        &self,
        ns: &Namespace,
        operand: Operand,
        job_id: i64,
        ids: &[i64],
    ) -> Result<u64> {
        let mut completed = 0;
        let mut tx = self.pool().begin().await?;
        for batch in ids.chunks(IN_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "DELETE FROM synced_entities WHERE namespace = ",
            );
            qb.push_bind(ns.as_str());
            qb.push(" AND kind = ");
            qb.push_bind(operand.as_str());
            qb.push(" AND entity_id IN ");
            push_ids(&mut qb, batch);
            qb.push(
                " AND EXISTS (SELECT 1 FROM pending_entities p \
                    WHERE p.namespace = synced_entities.namespace AND p.kind = synced_entities.kind \
                      AND p.entity_id = synced_entities.entity_id AND p.action = 'remove' \
                      AND p.job_id = ",
            );
            qb.push_bind(job_id);
            qb.push(")");
            qb.build().execute(&mut *tx).await?;
            completed += settle_accepted(&mut tx, ns, operand, job_id, batch).await?;
        }
        tx.commit().await?;
        Ok(completed)
    }

    #[instrument(skip_all, fields(operand = %operand, job_id = job_id))]
    async fn release_job(&self, ns: &Namespace, operand: Operand, job_id: i64) -> Result<u64> {
        // A held remove wins; a held update only replaces the content.
        let res = sqlx::query(
            "UPDATE pending_entities SET \
                action = CASE WHEN follow_up_action = 'remove' THEN 'remove' ELSE action END, \
                content = COALESCE(follow_up_content, content), job_id = NULL, \
                follow_up_action = NULL, follow_up_content = NULL \
             WHERE namespace = ? AND kind = ? AND job_id = ?",
        )
        .bind(ns.as_str())
        .bind(operand.as_str())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip_all, fields(operand = %operand, action = %action, count = ids.len()))]
    async fn discard_pending(
        &self,
        ns: &Namespace,
        operand: Operand,
        action: Action,
        ids: &[i64],
    ) -> Result<u64> {
        let mut discarded = 0;
        let mut tx = self.pool().begin().await?;
        for batch in ids.chunks(IN_BATCH) {
            discarded +=
                delete_by_id(&mut tx, "pending_entities", ns, operand, batch, Some(action)).await?;
        }
        tx.commit().await?;
        Ok(discarded)
    }

    #[instrument(skip_all, fields(campaign_id = campaign_id))]
    async fn purge_campaign(&self, ns: &Namespace, campaign_id: i64) -> Result<u64> {
        let mut tx = self.pool().begin().await?;
        let pending = sqlx::query("DELETE FROM pending_entities WHERE namespace = ? AND campaign_id = ?")
            .bind(ns.as_str())
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let errors = sqlx::query("DELETE FROM sync_errors WHERE namespace = ? AND campaign_id = ?")
            .bind(ns.as_str())
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(pending + errors)
    }

    #[instrument(skip_all, fields(operand = %operand, count = ids.len()))]
    async fn quarantine(&self, ns: &Namespace, operand: Operand, ids: &[i64]) -> Result<u64> {
        let mut removed = 0;
        let mut tx = self.pool().begin().await?;
        for batch in ids.chunks(IN_BATCH) {
            for &dependent in operand.dependents() {
                // Error rows carry no parent; resolve children through the entity tables first.
                let mut qb = QueryBuilder::<Sqlite>::new(
                    "DELETE FROM sync_errors WHERE namespace = ",
                );
                qb.push_bind(ns.as_str());
                qb.push(" AND kind = ");
                qb.push_bind(dependent.as_str());
                qb.push(" AND entity_id IN (SELECT entity_id FROM pending_entities WHERE namespace = ");
                qb.push_bind(ns.as_str());
                qb.push(" AND kind = ");
                qb.push_bind(dependent.as_str());
                qb.push(" AND parent_id IN ");
                push_ids(&mut qb, batch);
                qb.push(" UNION SELECT entity_id FROM synced_entities WHERE namespace = ");
                qb.push_bind(ns.as_str());
                qb.push(" AND kind = ");
                qb.push_bind(dependent.as_str());
                qb.push(" AND parent_id IN ");
                push_ids(&mut qb, batch);
                qb.push(")");
                removed += qb.build().execute(&mut *tx).await?.rows_affected();

                removed +=
                    delete_by_parent(&mut tx, "pending_entities", ns, dependent, batch).await?;
                removed +=
                    delete_by_parent(&mut tx, "synced_entities", ns, dependent, batch).await?;
            }
            for table in ["sync_errors", "pending_entities", "synced_entities"] {
                removed += delete_by_id(&mut tx, table, ns, operand, batch, None).await?;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    #[instrument(skip_all, fields(count = records.len()))]
    async fn record_errors(&self, ns: &Namespace, records: &[ErrorRecord]) -> Result<u64> {
        let now = to_millis(Utc::now());
        let mut written = 0;
        let mut tx = self.pool().begin().await?;
        for record in records {
            written += sqlx::query(
                "INSERT INTO sync_errors \
                    (namespace, kind, entity_id, account_id, campaign_id, action, code, reason, \
                     raw_message, message, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (namespace, kind, entity_id) DO UPDATE SET \
                    account_id = excluded.account_id, campaign_id = excluded.campaign_id, \
                    action = excluded.action, code = excluded.code, reason = excluded.reason, \
                    raw_message = excluded.raw_message, message = excluded.message, \
                    recorded_at = excluded.recorded_at",
            )
            .bind(ns.as_str())
            .bind(record.operand.as_str())
            .bind(record.entity_id)
            .bind(record.account_id)
            .bind(record.campaign_id)
            .bind(record.action.as_str())
            .bind(record.code)
            .bind(record.reason.as_deref())
            .bind(&record.raw_message)
            .bind(&record.message)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    #[instrument(skip_all, fields(operand = %operand, count = ids.len()))]
    async fn clear_errors(&self, ns: &Namespace, operand: Operand, ids: &[i64]) -> Result<u64> {
        let mut cleared = 0;
        let mut tx = self.pool().begin().await?;
        for batch in ids.chunks(IN_BATCH) {
            cleared += delete_by_id(&mut tx, "sync_errors", ns, operand, batch, None).await?;
        }
        tx.commit().await?;
        Ok(cleared)
    }
}
