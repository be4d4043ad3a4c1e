#![allow(dead_code)]

use adsync::db::{run_migrations, SqliteStore};
use adsync::engine::{EngineSettings, SyncEngine};
use adsync::error::EngineError;
use adsync::model::{
    Account, Action, AdContent, AdGroupContent, BatchJob, Campaign, EntityContent,
    ExtensionContent, ExtensionKind, KeywordContent, MatchType, Namespace, Operand,
    PendingEntity, Platform, SyncedEntity,
};
use adsync::notify::Notifier;
use adsync::platform::{
    BuildContext, BuildOutcome, BulkOperation, ErrorClassifier, ErrorTable, OperationSet,
    ParsedResult, PlatformAdapter, PollStatus, Submission,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub fn ns() -> Namespace {
    Namespace::new("test")
}

pub async fn setup_store() -> Arc<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

pub async fn seed_account(store: &SqliteStore, id: i64, remote: Option<&str>) {
    store
        .upsert_account(
            &ns(),
            &Account {
                id,
                platform: Platform::Microsoft,
                name: format!("Account {id}"),
                remote_account_id: remote.map(str::to_string),
            },
        )
        .await
        .unwrap();
}

pub async fn seed_campaign(store: &SqliteStore, id: i64, account_id: i64, remote: Option<&str>) {
    store
        .upsert_campaign(
            &ns(),
            &Campaign {
                id,
                account_id,
                name: format!("Campaign {id}"),
                remote_campaign_id: remote.map(str::to_string),
            },
        )
        .await
        .unwrap();
}

fn pending(id: i64, parent_id: Option<i64>, action: Action, content: EntityContent) -> PendingEntity {
    PendingEntity {
        id,
        account_id: 1,
        campaign_id: 10,
        parent_id,
        action,
        content,
        remote_id: None,
        remote_parent_id: None,
    }
}

pub fn ad_group(id: i64, action: Action) -> PendingEntity {
    pending(
        id,
        None,
        action,
        EntityContent::AdGroup(AdGroupContent {
            name: format!("Group {id}"),
            cpc_bid_micros: None,
            paused: false,
        }),
    )
}

pub fn keyword(id: i64, parent: i64, action: Action) -> PendingEntity {
    pending(
        id,
        Some(parent),
        action,
        EntityContent::Keyword(KeywordContent {
            text: format!("keyword {id}"),
            match_type: MatchType::Exact,
            cpc_bid_micros: Some(1_000_000),
            paused: false,
        }),
    )
}

pub fn ad(id: i64, parent: i64, action: Action) -> PendingEntity {
    pending(
        id,
        Some(parent),
        action,
        EntityContent::Ad(AdContent {
            headlines: vec![format!("Headline {id}")],
            descriptions: vec!["Description".into()],
            final_url: "https://example.com".into(),
            paused: false,
        }),
    )
}

pub fn callout(id: i64, text: &str) -> PendingEntity {
    pending(
        id,
        None,
        Action::Add,
        EntityContent::Extension(ExtensionContent {
            kind: ExtensionKind::Callout,
            text: text.into(),
            final_url: None,
        }),
    )
}

pub fn synced(entity: &PendingEntity, remote_id: &str) -> SyncedEntity {
    SyncedEntity {
        id: entity.id,
        operand: entity.operand(),
        account_id: entity.account_id,
        campaign_id: entity.campaign_id,
        parent_id: entity.parent_id,
        content: entity.content.clone(),
        remote_id: remote_id.into(),
        remote_parent_id: None,
        synced_at: Utc::now(),
    }
}

/// Account 1 (provisioned) owning campaign 10 (provisioned).
pub async fn seed_default(store: &SqliteStore) {
    seed_account(store, 1, Some("A-1")).await;
    seed_campaign(store, 10, 1, Some("C-10")).await;
}

pub async fn make_due(store: &SqliteStore) {
    sqlx::query("UPDATE batch_jobs SET execute_at = 0 WHERE status = 'PendingResult'")
        .execute(store.pool())
        .await
        .unwrap();
}

pub async fn all_jobs(store: &SqliteStore) -> Vec<BatchJob> {
    let mut jobs = store.jobs(&ns(), 100).await.unwrap();
    jobs.sort_by_key(|j| j.id);
    jobs
}

pub async fn count(store: &SqliteStore, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(store.pool())
        .await
        .unwrap()
}

/// `ParsedResult` JSON understood by [`FakeAdapter::parse_result`].
pub fn result_json(results: &[(&str, &str)], errors: &[(&str, i64, &str)]) -> String {
    let results: serde_json::Map<String, serde_json::Value> = results
        .iter()
        .map(|(c, r)| (c.to_string(), json!(r)))
        .collect();
    let errors: serde_json::Map<String, serde_json::Value> = errors
        .iter()
        .map(|(c, code, msg)| (c.to_string(), json!({ "code": code, "message": msg })))
        .collect();
    json!({ "results": results, "errors": errors }).to_string()
}

#[derive(Debug, Clone)]
pub struct FakeOperation {
    pub entity_id: i64,
}

impl BulkOperation for FakeOperation {
    fn entity_id(&self) -> i64 {
        self.entity_id
    }

    fn correlation_id(&self) -> String {
        format!("c{}", self.entity_id)
    }
}

/// Scripted adapter. Unscripted uploads return a pending token, unscripted
/// polls succeed and unscripted fetches return nothing.
#[derive(Clone)]
pub struct FakeAdapter {
    pub chunk_size: usize,
    /// Build one operation fewer than entities.
    pub drop_one: bool,
    pub classifier: ErrorClassifier,
    pub uploads: Arc<Mutex<VecDeque<Submission>>>,
    pub fail_on: Arc<Mutex<HashSet<i64>>>,
    pub polls: Arc<Mutex<VecDeque<PollStatus>>>,
    pub results: Arc<Mutex<VecDeque<String>>>,
    pub uploaded: Arc<Mutex<Vec<(Operand, Action, Vec<i64>)>>>,
    pub poll_calls: Arc<Mutex<u32>>,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        let mut table = ErrorTable::default();
        table.messages.insert(1217, "The campaign reference is invalid.".into());
        table.permanent_codes.insert(1217);
        Self {
            chunk_size: 100,
            drop_one: false,
            classifier: ErrorClassifier::new(table),
            uploads: Default::default(),
            fail_on: Default::default(),
            polls: Default::default(),
            results: Default::default(),
            uploaded: Default::default(),
            poll_calls: Default::default(),
        }
    }
}

impl FakeAdapter {
    pub async fn script_result(&self, raw: String) {
        self.results.lock().await.push_back(raw);
    }

    pub async fn script_polls(&self, statuses: Vec<PollStatus>) {
        self.polls.lock().await.extend(statuses);
    }

    pub async fn uploaded(&self) -> Vec<(Operand, Action, Vec<i64>)> {
        self.uploaded.lock().await.clone()
    }

    fn build(
        &self,
        action: Action,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<FakeOperation>, EngineError> {
        if let Some(campaign_id) = ctx.missing_campaign(entities) {
            return Ok(BuildOutcome::CampaignGone { campaign_id });
        }
        let mut ops: Vec<FakeOperation> = entities
            .iter()
            .filter(|e| match (&e.content, action) {
                (EntityContent::Extension(ext), Action::Add) => ext.is_publishable(),
                _ => true,
            })
            .map(|e| FakeOperation { entity_id: e.id })
            .collect();
        if self.drop_one {
            ops.pop();
        }
        Ok(BuildOutcome::Operations(OperationSet::new(ops)))
    }
}

#[async_trait]
impl PlatformAdapter for FakeAdapter {
    type Operation = FakeOperation;

    fn platform(&self) -> Platform {
        Platform::Microsoft
    }

    fn chunk_size(&self, _operand: Operand) -> usize {
        self.chunk_size
    }

    fn min_request_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    fn build_add_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<FakeOperation>, EngineError> {
        self.build(Action::Add, ctx, entities)
    }

    fn build_update_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<FakeOperation>, EngineError> {
        self.build(Action::Update, ctx, entities)
    }

    fn build_delete_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<FakeOperation>, EngineError> {
        self.build(Action::Remove, ctx, entities)
    }

    async fn upload_operations(
        &self,
        _account: &Account,
        operand: Operand,
        action: Action,
        operations: &[FakeOperation],
    ) -> Result<Submission> {
        let ids: Vec<i64> = operations.iter().map(|op| op.entity_id).collect();
        let failing = {
            let fail_on = self.fail_on.lock().await;
            ids.iter().any(|id| fail_on.contains(id))
        };
        let mut uploaded = self.uploaded.lock().await;
        uploaded.push((operand, action, ids));
        if failing {
            return Err(anyhow!("upload rejected: quota exceeded"));
        }
        let token = format!("job-{}", uploaded.len());
        drop(uploaded);
        Ok(self
            .uploads
            .lock()
            .await
            .pop_front()
            .unwrap_or(Submission::Pending { job_token: token }))
    }

    async fn poll_status(&self, _account: &Account, _job_token: &str) -> Result<PollStatus> {
        *self.poll_calls.lock().await += 1;
        Ok(self
            .polls
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| PollStatus::Succeeded("Completed".into())))
    }

    async fn fetch_result(&self, _account: &Account, _job_token: &str) -> Result<Option<String>> {
        Ok(self.results.lock().await.pop_front())
    }

    fn parse_result(
        &self,
        raw: &str,
        _operand: Operand,
        _action: Action,
    ) -> Result<ParsedResult, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::MalformedResult(e.to_string()))
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().await.push(message.to_string());
    }
}

pub fn engine(
    store: &Arc<SqliteStore>,
    adapter: &FakeAdapter,
    notifier: &RecordingNotifier,
    settings: EngineSettings,
) -> SyncEngine<FakeAdapter> {
    SyncEngine::new(
        ns(),
        Arc::new(adapter.clone()),
        store.clone(),
        store.clone(),
        Arc::new(notifier.clone()),
    )
    .with_settings(settings)
}
