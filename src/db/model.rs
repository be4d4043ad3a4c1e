//! Row → domain mapping shared by the repositories.
//!
//! Keep SQL out of here; these helpers only decode columns that the queries
//! in `queue`, `jobs` and `repo` select by name.

use super::from_millis;
use crate::model::{
    Account, BatchJob, Campaign, EntityContent, ErrorRecord, Namespace, PendingEntity,
    SyncedEntity,
};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Column list matching [`job_from_row`].
pub(crate) const JOB_COLUMNS: &str = "id, namespace, platform, account_id, operand, action, \
     job_token, submission_id, status, platform_status, attempts, execute_at, metadata, \
     inline_result, last_error, version, created_at, updated_at";

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

pub(crate) fn parse_content(entity_id: i64, raw: &str) -> Result<EntityContent> {
    serde_json::from_str(raw).with_context(|| format!("entity {entity_id}: invalid content"))
}

pub(crate) fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let platform: String = row.get("platform");
    Ok(Account {
        id: row.get("id"),
        platform: platform.parse()?,
        name: row.get("name"),
        remote_account_id: non_blank(row.get("remote_account_id")),
    })
}

pub(crate) fn campaign_from_row(row: &SqliteRow) -> Campaign {
    Campaign {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        remote_campaign_id: non_blank(row.get("remote_campaign_id")),
    }
}

pub(crate) fn pending_from_row(row: &SqliteRow) -> Result<PendingEntity> {
    let id: i64 = row.get("entity_id");
    let action: String = row.get("action");
    let content: String = row.get("content");
    Ok(PendingEntity {
        id,
        account_id: row.get("account_id"),
        campaign_id: row.get("campaign_id"),
        parent_id: row.get("parent_id"),
        action: action.parse()?,
        content: parse_content(id, &content)?,
        remote_id: non_blank(row.get("remote_id")),
        remote_parent_id: non_blank(row.get("remote_parent_id")),
    })
}

pub(crate) fn synced_from_row(row: &SqliteRow) -> Result<SyncedEntity> {
    let id: i64 = row.get("entity_id");
    let kind: String = row.get("kind");
    let content: String = row.get("content");
    Ok(SyncedEntity {
        id,
        operand: kind.parse()?,
        account_id: row.get("account_id"),
        campaign_id: row.get("campaign_id"),
        parent_id: row.get("parent_id"),
        content: parse_content(id, &content)?,
        remote_id: row.get("remote_id"),
        remote_parent_id: non_blank(row.get("remote_parent_id")),
        synced_at: from_millis(row.get("synced_at")),
    })
}

pub(crate) fn error_from_row(row: &SqliteRow) -> Result<ErrorRecord> {
    let kind: String = row.get("kind");
    let action: String = row.get("action");
    Ok(ErrorRecord {
        operand: kind.parse()?,
        entity_id: row.get("entity_id"),
        account_id: row.get("account_id"),
        campaign_id: row.get("campaign_id"),
        action: action.parse()?,
        code: row.get("code"),
        reason: row.get("reason"),
        raw_message: row.get("raw_message"),
        message: row.get("message"),
    })
}

pub(crate) fn job_from_row(row: &SqliteRow) -> Result<BatchJob> {
    let id: i64 = row.get("id");
    let namespace: String = row.get("namespace");
    let platform: String = row.get("platform");
    let operand: String = row.get("operand");
    let action: String = row.get("action");
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    Ok(BatchJob {
        id,
        namespace: Namespace::new(namespace),
        platform: platform.parse()?,
        account_id: row.get("account_id"),
        operand: operand.parse()?,
        action: action.parse()?,
        job_token: row.get("job_token"),
        submission_id: row.get("submission_id"),
        status: status.parse()?,
        platform_status: row.get("platform_status"),
        attempts: row.get("attempts"),
        execute_at: from_millis(row.get("execute_at")),
        metadata: serde_json::from_str(&metadata)
            .with_context(|| format!("batch job {id}: invalid metadata"))?,
        inline_result: row.get("inline_result"),
        last_error: row.get("last_error"),
        version: row.get("version"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}
