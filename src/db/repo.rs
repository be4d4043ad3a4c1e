//! Upstream-facing helpers: catalog upserts, enqueueing local changes and
//! read-only inspection used by the CLI and tests.

use super::model::{error_from_row, pending_from_row, synced_from_row};
use super::{to_millis, SqliteStore};
use crate::model::{
    Account, Action, Campaign, ErrorRecord, Namespace, Operand, PendingEntity, SyncedEntity,
};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::Row;
use tracing::{debug, instrument};

/// What happened to an enqueue request given the entity's existing pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// Content replaced; the pending action stays as reported.
    Merged(Action),
    /// A pending add/update became a pending remove.
    Superseded,
    /// A pending remove wins over a later add/update.
    Ignored,
    /// The pending row is part of a running job; the change is held and
    /// queued once that job settles.
    FollowUp(Action),
}

/// Resolve an enqueue against an existing pending action.
pub fn resolve_enqueue(existing: Option<Action>, requested: Action) -> EnqueueOutcome {
    match (existing, requested) {
        (None, _) => EnqueueOutcome::Inserted,
        (Some(Action::Remove), Action::Remove) => EnqueueOutcome::Merged(Action::Remove),
        (Some(Action::Remove), _) => EnqueueOutcome::Ignored,
        (Some(_), Action::Remove) => EnqueueOutcome::Superseded,
        // The platform has not seen the add yet, so an update folds into it.
        (Some(Action::Add), _) => EnqueueOutcome::Merged(Action::Add),
        (Some(Action::Update), _) => EnqueueOutcome::Merged(Action::Update),
    }
}

/// Resolve an enqueue against a row bound to a running job. The submitted
/// content stays untouched; at most one follow-up change is held.
pub fn resolve_follow_up(
    in_flight: Action,
    held: Option<Action>,
    requested: Action,
) -> EnqueueOutcome {
    match (in_flight, held, requested) {
        (Action::Remove, _, _) => EnqueueOutcome::Ignored,
        (_, _, Action::Remove) => EnqueueOutcome::FollowUp(Action::Remove),
        (_, Some(Action::Remove), _) => EnqueueOutcome::Ignored,
        // Once the submitted add lands, any further change is an update.
        _ => EnqueueOutcome::FollowUp(Action::Update),
    }
}

/// Pending-row counts per operand and action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogRow {
    pub operand: Operand,
    pub action: Action,
    pub count: i64,
}

impl SqliteStore {
    #[instrument(skip_all, fields(account_id = account.id))]
    pub async fn upsert_account(&self, ns: &Namespace, account: &Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (namespace, id, platform, name, remote_account_id) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (namespace, id) DO UPDATE SET platform = excluded.platform, \
                name = excluded.name, remote_account_id = excluded.remote_account_id",
        )
        .bind(ns.as_str())
        .bind(account.id)
        .bind(account.platform.as_str())
        .bind(&account.name)
        .bind(account.remote_account_id.as_deref())
        .execute(self.pool())
        .await
        .context("failed to persist account")?;
        Ok(())
    }

    #[instrument(skip_all, fields(campaign_id = campaign.id))]
    pub async fn upsert_campaign(&self, ns: &Namespace, campaign: &Campaign) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaigns (namespace, id, account_id, name, remote_campaign_id) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (namespace, id) DO UPDATE SET account_id = excluded.account_id, \
                name = excluded.name, remote_campaign_id = excluded.remote_campaign_id",
        )
        .bind(ns.as_str())
        .bind(campaign.id)
        .bind(campaign.account_id)
        .bind(&campaign.name)
        .bind(campaign.remote_campaign_id.as_deref())
        .execute(self.pool())
        .await
        .context("failed to persist campaign")?;
        Ok(())
    }

    pub async fn delete_campaign(&self, ns: &Namespace, campaign_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM campaigns WHERE namespace = ? AND id = ?")
            .bind(ns.as_str())
            .bind(campaign_id)
            .execute(self.pool())
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Queue a local change. An entity holds at most one pending state; see
    /// [`resolve_enqueue`] for how a second change combines with the first.
    #[instrument(skip_all, fields(entity_id = entity.id, action = %entity.action))]
    pub async fn enqueue(&self, ns: &Namespace, entity: &PendingEntity) -> Result<EnqueueOutcome> {
        entity.content.validate(entity.id)?;
        if entity.parent_id.is_none() && entity.operand().has_ad_group_parent() {
            return Err(anyhow!(
                "{} {}: keywords and ads need a parent ad group",
                entity.operand(),
                entity.id
            ));
        }
        let kind = entity.operand().as_str();
        let content = serde_json::to_string(&entity.content)?;

        let mut tx = self.pool().begin().await?;
        let existing = sqlx::query(
            "SELECT action, job_id, follow_up_action FROM pending_entities \
             WHERE namespace = ? AND kind = ? AND entity_id = ?",
        )
        .bind(ns.as_str())
        .bind(kind)
        .bind(entity.id)
        .fetch_optional(&mut *tx)
        .await?;
        let outcome = match existing {
            None => resolve_enqueue(None, entity.action),
            Some(row) => {
                let action: Action = row.get::<String, _>("action").parse()?;
                let job_id: Option<i64> = row.get("job_id");
                let held = row
                    .get::<Option<String>, _>("follow_up_action")
                    .map(|a| a.parse::<Action>())
                    .transpose()?;
                match job_id {
                    Some(_) => resolve_follow_up(action, held, entity.action),
                    None => resolve_enqueue(Some(action), entity.action),
                }
            }
        };

        match outcome {
            EnqueueOutcome::Inserted => {
                sqlx::query(
                    "INSERT INTO pending_entities \
                        (namespace, kind, entity_id, account_id, campaign_id, parent_id, action, \
                         content, remote_id, remote_parent_id, queued_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(ns.as_str())
                .bind(kind)
                .bind(entity.id)
                .bind(entity.account_id)
                .bind(entity.campaign_id)
                .bind(entity.parent_id)
                .bind(entity.action.as_str())
                .bind(&content)
                .bind(entity.remote_id.as_deref())
                .bind(entity.remote_parent_id.as_deref())
                .bind(to_millis(Utc::now()))
                .execute(&mut *tx)
                .await?;
            }
            EnqueueOutcome::Merged(_) | EnqueueOutcome::Superseded => {
                let action = match outcome {
                    EnqueueOutcome::Merged(kept) => kept,
                    _ => Action::Remove,
                };
                sqlx::query(
                    "UPDATE pending_entities SET action = ?, content = ?, \
                        account_id = ?, campaign_id = ?, parent_id = ?, \
                        remote_id = COALESCE(?, remote_id), \
                        remote_parent_id = COALESCE(?, remote_parent_id), queued_at = ? \
                     WHERE namespace = ? AND kind = ? AND entity_id = ?",
                )
                .bind(action.as_str())
                .bind(&content)
                .bind(entity.account_id)
                .bind(entity.campaign_id)
                .bind(entity.parent_id)
                .bind(entity.remote_id.as_deref())
                .bind(entity.remote_parent_id.as_deref())
                .bind(to_millis(Utc::now()))
                .bind(ns.as_str())
                .bind(kind)
                .bind(entity.id)
                .execute(&mut *tx)
                .await?;
            }
            EnqueueOutcome::FollowUp(action) => {
                sqlx::query(
                    "UPDATE pending_entities SET follow_up_action = ?, follow_up_content = ? \
                     WHERE namespace = ? AND kind = ? AND entity_id = ?",
                )
                .bind(action.as_str())
                .bind(&content)
                .bind(ns.as_str())
                .bind(kind)
                .bind(entity.id)
                .execute(&mut *tx)
                .await?;
                debug!(entity_id = entity.id, follow_up = %action, "entity in flight; change held");
            }
            EnqueueOutcome::Ignored => {
                debug!(entity_id = entity.id, "pending remove wins; change ignored");
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    /// Record an entity as already present on the platform.
    pub async fn insert_synced(&self, ns: &Namespace, entity: &SyncedEntity) -> Result<()> {
        sqlx::query(
            "INSERT INTO synced_entities \
                (namespace, kind, entity_id, account_id, campaign_id, parent_id, content, \
                 remote_id, remote_parent_id, synced_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (namespace, kind, entity_id) DO UPDATE SET \
                content = excluded.content, remote_id = excluded.remote_id, \
                remote_parent_id = excluded.remote_parent_id, synced_at = excluded.synced_at",
        )
        .bind(ns.as_str())
        .bind(entity.operand.as_str())
        .bind(entity.id)
        .bind(entity.account_id)
        .bind(entity.campaign_id)
        .bind(entity.parent_id)
        .bind(serde_json::to_string(&entity.content)?)
        .bind(&entity.remote_id)
        .bind(entity.remote_parent_id.as_deref())
        .bind(to_millis(entity.synced_at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn pending_entity(
        &self,
        ns: &Namespace,
        operand: Operand,
        entity_id: i64,
    ) -> Result<Option<PendingEntity>> {
        let row = sqlx::query(
            "SELECT entity_id, account_id, campaign_id, parent_id, action, content, remote_id, \
                    remote_parent_id \
             FROM pending_entities WHERE namespace = ? AND kind = ? AND entity_id = ?",
        )
        .bind(ns.as_str())
        .bind(operand.as_str())
        .bind(entity_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(pending_from_row).transpose()
    }

    pub async fn synced_entity(
        &self,
        ns: &Namespace,
        operand: Operand,
        entity_id: i64,
    ) -> Result<Option<SyncedEntity>> {
        let row = sqlx::query(
            "SELECT kind, entity_id, account_id, campaign_id, parent_id, content, remote_id, \
                    remote_parent_id, synced_at \
             FROM synced_entities WHERE namespace = ? AND kind = ? AND entity_id = ?",
        )
        .bind(ns.as_str())
        .bind(operand.as_str())
        .bind(entity_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(synced_from_row).transpose()
    }

    pub async fn error_records(&self, ns: &Namespace) -> Result<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT kind, entity_id, account_id, campaign_id, action, code, reason, raw_message, \
                    message \
             FROM sync_errors WHERE namespace = ? ORDER BY kind, entity_id",
        )
        .bind(ns.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(error_from_row).collect()
    }

    pub async fn backlog(&self, ns: &Namespace) -> Result<Vec<BacklogRow>> {
        let rows = sqlx::query(
            "SELECT kind, action, COUNT(*) AS n FROM pending_entities \
             WHERE namespace = ? GROUP BY kind, action ORDER BY kind, action",
        )
        .bind(ns.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let action: String = row.get("action");
                Ok(BacklogRow {
                    operand: kind.parse()?,
                    action: action.parse()?,
                    count: row.get("n"),
                })
            })
            .collect()
    }
}
