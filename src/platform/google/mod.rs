//! Batch-job adapter: adds and updates are queued into a batch job and run
//! asynchronously; removes go through a synchronous partial-failure mutate
//! whose response is kept as the job's inline result.
//!
//! Correlation ids are operation indexes within the submitted chunk.

pub mod errors;
pub mod operations;
pub mod transport;

use crate::config::GoogleConfig;
use crate::error::EngineError;
use crate::model::{Account, Action, EntityContent, Operand, PendingEntity, Platform};
use crate::platform::{
    BuildContext, BuildOutcome, BulkOperation, ErrorClassifier, ErrorTable, OperationSet,
    ParsedResult, PlatformAdapter, PollStatus, Submission,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use operations::{mutate_operation, resource_name, Targets};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
pub use transport::{GoogleTransport, HttpGoogleTransport, LongRunningOperation, ResultsPage};
use uuid::Uuid;

const MUTATE_TOKEN_PREFIX: &str = "mutate:";

pub fn default_chunk_size(operand: Operand) -> usize {
    match operand {
        Operand::AdGroup => 2_000,
        Operand::Keyword => 5_000,
        Operand::Ad => 5_000,
        Operand::Extension => 2_000,
    }
}

/// Split `"{batch job}#{operation}"`.
fn split_token(token: &str) -> Result<(&str, &str)> {
    token
        .split_once('#')
        .ok_or_else(|| anyhow!("malformed batch job token: {token}"))
}

fn customer_id(account: &Account) -> Option<String> {
    account
        .remote_account_id
        .as_deref()
        .map(|id| id.replace('-', ""))
}

#[derive(Debug, Clone)]
pub struct GoogleOperation {
    pub entity_id: i64,
    pub index: usize,
    pub body: Value,
}

impl BulkOperation for GoogleOperation {
    fn entity_id(&self) -> i64 {
        self.entity_id
    }

    fn correlation_id(&self) -> String {
        self.index.to_string()
    }
}

pub struct GoogleAdapter<T> {
    transport: T,
    chunk_sizes: BTreeMap<Operand, usize>,
    min_request_interval: Duration,
    classifier: ErrorClassifier,
}

impl<T: GoogleTransport> GoogleAdapter<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            chunk_sizes: BTreeMap::new(),
            min_request_interval: Duration::from_secs(1),
            classifier: ErrorClassifier::new(errors::DEFAULT_TABLE.clone()),
        }
    }

    pub fn with_chunk_sizes(mut self, overrides: &BTreeMap<Operand, usize>) -> Self {
        self.chunk_sizes = overrides.clone();
        self
    }

    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    pub fn with_error_overrides(mut self, table: Option<&ErrorTable>) -> Self {
        if let Some(table) = table {
            self.classifier =
                ErrorClassifier::new(self.classifier.table().clone().merged_with(table));
        }
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn build(
        &self,
        action: Action,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<GoogleOperation>, EngineError> {
        if let Some(campaign_id) = ctx.missing_campaign(entities) {
            return Ok(BuildOutcome::CampaignGone { campaign_id });
        }
        let Some(cid) = customer_id(&ctx.account) else {
            return match entities.first() {
                Some(e) => Err(EngineError::MissingField {
                    operand: e.operand(),
                    entity_id: e.id,
                    field: "remote_account_id",
                }),
                None => Ok(BuildOutcome::Operations(OperationSet::new(Vec::new()))),
            };
        };

        let mut ops: Vec<GoogleOperation> = Vec::with_capacity(entities.len());
        for entity in entities {
            if let (Action::Add, EntityContent::Extension(ext)) = (action, &entity.content) {
                if !ext.is_publishable() {
                    debug!(entity_id = entity.id, "extension has nothing to publish");
                    continue;
                }
            }
            let targets = Targets {
                customer_id: &cid,
                campaign: ctx
                    .campaign_remote_id(entity)
                    .ok()
                    .map(|id| resource_name(&cid, "campaigns", id)),
                ad_group: ctx
                    .parent_remote_id(entity)
                    .map(|id| resource_name(&cid, "adGroups", id)),
                remote_id: entity.remote_id.as_deref(),
            };
            let body = mutate_operation(action, entity, &targets)?;
            ops.push(GoogleOperation {
                entity_id: entity.id,
                index: ops.len(),
                body,
            });
        }
        Ok(BuildOutcome::Operations(OperationSet::new(ops)))
    }
}

impl GoogleAdapter<HttpGoogleTransport> {
    pub fn from_config(cfg: &GoogleConfig) -> Result<Self> {
        let transport = HttpGoogleTransport::new(
            &cfg.base_url,
            cfg.api_version.clone(),
            cfg.developer_token.clone(),
            cfg.access_token.clone(),
            cfg.login_customer_id.clone(),
        )?;
        Ok(Self::new(transport)
            .with_chunk_sizes(&cfg.chunk_sizes)
            .with_min_request_interval(Duration::from_millis(cfg.min_request_interval_ms))
            .with_error_overrides(cfg.errors.as_ref()))
    }
}

#[async_trait]
impl<T: GoogleTransport> PlatformAdapter for GoogleAdapter<T> {
    type Operation = GoogleOperation;

    fn platform(&self) -> Platform {
        Platform::Google
    }

    fn chunk_size(&self, operand: Operand) -> usize {
        self.chunk_sizes
            .get(&operand)
            .copied()
            .unwrap_or_else(|| default_chunk_size(operand))
    }

    fn min_request_interval(&self) -> Duration {
        self.min_request_interval
    }

    fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    fn build_add_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<GoogleOperation>, EngineError> {
        self.build(Action::Add, ctx, entities)
    }

    fn build_update_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<GoogleOperation>, EngineError> {
        self.build(Action::Update, ctx, entities)
    }

    fn build_delete_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<GoogleOperation>, EngineError> {
        self.build(Action::Remove, ctx, entities)
    }

    async fn upload_operations(
        &self,
        account: &Account,
        operand: Operand,
        action: Action,
        operations: &[GoogleOperation],
    ) -> Result<Submission> {
        let cid = customer_id(account)
            .ok_or_else(|| anyhow!("account {} is not provisioned", account.id))?;
        let bodies: Vec<Value> = operations.iter().map(|op| op.body.clone()).collect();

        if action == Action::Remove {
            let response = self.transport.mutate(&cid, &bodies).await?;
            let job_token = format!("{MUTATE_TOKEN_PREFIX}{}", Uuid::new_v4());
            info!(
                account_id = account.id,
                operand = %operand,
                operations = bodies.len(),
                job_token = %job_token,
                "mutate applied"
            );
            return Ok(Submission::Completed {
                job_token,
                payload: response.to_string(),
            });
        }

        let batch_job = self.transport.create_batch_job(&cid).await?;
        self.transport.add_operations(&batch_job, &bodies).await?;
        let operation = self.transport.run_batch_job(&batch_job).await?;
        info!(
            account_id = account.id,
            operand = %operand,
            action = %action,
            operations = bodies.len(),
            batch_job = %batch_job,
            "batch job started"
        );
        Ok(Submission::Pending {
            job_token: format!("{batch_job}#{operation}"),
        })
    }

    async fn poll_status(&self, _account: &Account, job_token: &str) -> Result<PollStatus> {
        if job_token.starts_with(MUTATE_TOKEN_PREFIX) {
            return Ok(PollStatus::Succeeded("DONE".into()));
        }
        let (_, operation) = split_token(job_token)?;
        let op = self.transport.get_operation(operation).await?;
        if let Some(err) = op.error.as_ref().filter(|e| e.code != 0) {
            return Ok(PollStatus::Failed(format!("{}: {}", err.code, err.message)));
        }
        if op.done {
            return Ok(PollStatus::Succeeded(op.status().unwrap_or("DONE").to_string()));
        }
        Ok(PollStatus::InProgress(
            op.status().unwrap_or("RUNNING").to_string(),
        ))
    }

    async fn fetch_result(&self, _account: &Account, job_token: &str) -> Result<Option<String>> {
        if job_token.starts_with(MUTATE_TOKEN_PREFIX) {
            // Synchronous submissions carry their result inline.
            return Ok(None);
        }
        let (batch_job, _) = split_token(job_token)?;
        let mut results = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .transport
                .list_results(batch_job, page_token.as_deref())
                .await?;
            results.extend(page.results);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        if results.is_empty() {
            return Ok(None);
        }
        Ok(Some(json!({ "results": results }).to_string()))
    }

    fn parse_result(
        &self,
        raw: &str,
        _operand: Operand,
        _action: Action,
    ) -> Result<ParsedResult, EngineError> {
        operations::parse_response(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Campaign, ExtensionContent, ExtensionKind, KeywordContent, MatchType};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default, Clone)]
    struct ScriptedTransport {
        calls: Arc<Mutex<Vec<String>>>,
        pages: Arc<Mutex<VecDeque<ResultsPage>>>,
    }

    #[async_trait]
    impl GoogleTransport for ScriptedTransport {
        async fn create_batch_job(&self, customer_id: &str) -> Result<String> {
            self.calls.lock().await.push(format!("create {customer_id}"));
            Ok(format!("customers/{customer_id}/batchJobs/1"))
        }
        async fn add_operations(&self, batch_job: &str, operations: &[Value]) -> Result<()> {
            self.calls
                .lock()
                .await
                .push(format!("add {batch_job} {}", operations.len()));
            Ok(())
        }
        async fn run_batch_job(&self, batch_job: &str) -> Result<String> {
            self.calls.lock().await.push(format!("run {batch_job}"));
            Ok("customers/123/operations/9".into())
        }
        async fn get_operation(&self, name: &str) -> Result<LongRunningOperation> {
            Ok(LongRunningOperation {
                name: name.into(),
                done: true,
                metadata: Some(json!({ "status": "DONE" })),
                error: None,
            })
        }
        async fn list_results(&self, _: &str, _: Option<&str>) -> Result<ResultsPage> {
            Ok(self.pages.lock().await.pop_front().unwrap_or_default())
        }
        async fn mutate(&self, customer_id: &str, operations: &[Value]) -> Result<Value> {
            self.calls
                .lock()
                .await
                .push(format!("mutate {customer_id} {}", operations.len()));
            Ok(json!({ "mutateOperationResponses": [{}] }))
        }
    }

    fn ctx() -> BuildContext {
        BuildContext {
            account: Account {
                id: 1,
                platform: Platform::Google,
                name: "Main".into(),
                remote_account_id: Some("123-456".into()),
            },
            campaigns: HashMap::from([(
                10,
                Campaign {
                    id: 10,
                    account_id: 1,
                    name: "Spring".into(),
                    remote_campaign_id: Some("77".into()),
                },
            )]),
            parent_remote_ids: HashMap::new(),
        }
    }

    fn keyword(id: i64) -> PendingEntity {
        PendingEntity {
            id,
            account_id: 1,
            campaign_id: 10,
            parent_id: Some(5),
            action: Action::Add,
            content: EntityContent::Keyword(KeywordContent {
                text: format!("kw {id}"),
                match_type: MatchType::Phrase,
                cpc_bid_micros: None,
                paused: false,
            }),
            remote_id: None,
            remote_parent_id: Some("customers/123456/adGroups/55".into()),
        }
    }

    #[test]
    fn correlation_ids_are_operation_indexes() {
        let adapter = GoogleAdapter::new(ScriptedTransport::default());
        let outcome = adapter
            .build_add_operations(&ctx(), &[keyword(7), keyword(8)])
            .unwrap();
        let BuildOutcome::Operations(set) = outcome else {
            panic!("expected operations");
        };
        assert_eq!(set.entity_ids, vec![7, 8]);
        let ids: Vec<String> = set.operations.iter().map(|o| o.correlation_id()).collect();
        assert_eq!(ids, vec!["0", "1"]);
        assert_eq!(
            set.operations[1].body["adGroupCriterionOperation"]["create"]["adGroup"],
            "customers/123456/adGroups/55"
        );
    }

    #[test]
    fn filtered_extensions_do_not_consume_indexes() {
        let adapter = GoogleAdapter::new(ScriptedTransport::default());
        let ext = |id, text: &str| PendingEntity {
            id,
            account_id: 1,
            campaign_id: 10,
            parent_id: None,
            action: Action::Add,
            content: EntityContent::Extension(ExtensionContent {
                kind: ExtensionKind::Callout,
                text: text.into(),
                final_url: None,
            }),
            remote_id: None,
            remote_parent_id: None,
        };
        let outcome = adapter
            .build_add_operations(&ctx(), &[ext(1, ""), ext(2, "Free shipping")])
            .unwrap();
        let BuildOutcome::Operations(set) = outcome else {
            panic!("expected operations");
        };
        assert_eq!(set.entity_ids, vec![2]);
        assert_eq!(set.operations[0].correlation_id(), "0");
        assert_eq!(
            set.operations[0].body["extensionFeedItemOperation"]["create"]["targetedCampaign"],
            "customers/123456/campaigns/77"
        );
    }

    #[tokio::test]
    async fn adds_run_as_batch_jobs_and_removes_mutate_inline() {
        let transport = ScriptedTransport::default();
        let adapter = GoogleAdapter::new(transport.clone());
        let account = ctx().account;
        let BuildOutcome::Operations(set) = adapter
            .build_add_operations(&ctx(), &[keyword(7)])
            .unwrap()
        else {
            panic!("expected operations");
        };

        let submission = adapter
            .upload_operations(&account, Operand::Keyword, Action::Add, &set.operations)
            .await
            .unwrap();
        assert_eq!(
            submission,
            Submission::Pending {
                job_token: "customers/123456/batchJobs/1#customers/123/operations/9".into()
            }
        );
        assert_eq!(
            adapter
                .poll_status(&account, submission.job_token())
                .await
                .unwrap(),
            PollStatus::Succeeded("DONE".into())
        );

        transport.pages.lock().await.push_back(ResultsPage {
            results: vec![json!({
                "operationIndex": "0",
                "mutateOperationResponse": {"adGroupCriterionResult": {"resourceName": "customers/123456/adGroupCriteria/55~1"}}
            })],
            next_page_token: None,
        });
        let raw = adapter
            .fetch_result(&account, submission.job_token())
            .await
            .unwrap()
            .unwrap();
        let parsed = adapter
            .parse_result(&raw, Operand::Keyword, Action::Add)
            .unwrap();
        assert_eq!(parsed.results["0"], "customers/123456/adGroupCriteria/55~1");

        let removal = adapter
            .upload_operations(&account, Operand::Keyword, Action::Remove, &set.operations)
            .await
            .unwrap();
        assert!(matches!(removal, Submission::Completed { .. }));
        assert!(removal.job_token().starts_with(MUTATE_TOKEN_PREFIX));

        let calls = transport.calls.lock().await.clone();
        assert_eq!(
            calls,
            vec![
                "create 123456",
                "add customers/123456/batchJobs/1 1",
                "run customers/123456/batchJobs/1",
                "mutate 123456 1",
            ]
        );
    }
}
