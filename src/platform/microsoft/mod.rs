//! Bulk-file adapter: operations become CSV rows uploaded as one file per
//! chunk, the job is polled by request id and the result file is parsed back
//! by `Client Id`.

pub mod errors;
pub mod rows;
pub mod transport;

use crate::config::MicrosoftConfig;
use crate::error::EngineError;
use crate::model::{Account, Action, EntityContent, Operand, PendingEntity, Platform};
use crate::platform::{
    require_remote_id, BuildContext, BuildOutcome, BulkOperation, ErrorClassifier, ErrorTable,
    OperationSet, ParsedResult, PlatformAdapter, PollStatus, Submission,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rows::BulkRow;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
pub use transport::{HttpMicrosoftTransport, MicrosoftTransport, UploadStatus, UploadUrl};

pub fn default_chunk_size(operand: Operand) -> usize {
    match operand {
        Operand::AdGroup => 2_000,
        Operand::Keyword => 20_000,
        Operand::Ad => 10_000,
        Operand::Extension => 5_000,
    }
}

/// Collapse the service's request status.
pub fn collapse_status(raw: &str) -> PollStatus {
    match raw {
        "Completed" | "CompletedWithErrors" => PollStatus::Succeeded(raw.to_string()),
        "Failed" | "FailedFullSyncRequired" | "Expired" => PollStatus::Failed(raw.to_string()),
        "PendingFileUpload" | "FileUploaded" | "InProgress" => {
            PollStatus::InProgress(raw.to_string())
        }
        other => {
            warn!(status = other, "unknown bulk upload status; treating as in progress");
            PollStatus::InProgress(other.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct MicrosoftOperation {
    pub entity_id: i64,
    pub row: BulkRow,
}

impl BulkOperation for MicrosoftOperation {
    fn entity_id(&self) -> i64 {
        self.entity_id
    }

    fn correlation_id(&self) -> String {
        self.row.client_id.clone()
    }
}

pub struct MicrosoftAdapter<T> {
    transport: T,
    chunk_sizes: BTreeMap<Operand, usize>,
    min_request_interval: Duration,
    classifier: ErrorClassifier,
    /// Result file URLs reported by the last status poll, keyed by request id.
    result_urls: Mutex<HashMap<String, String>>,
}

impl<T: MicrosoftTransport> MicrosoftAdapter<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            chunk_sizes: BTreeMap::new(),
            min_request_interval: Duration::from_secs(1),
            classifier: ErrorClassifier::new(errors::DEFAULT_TABLE.clone()),
            result_urls: Mutex::new(HashMap::new()),
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

    /// Layer configured entries over the built-in error table.
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
    ) -> Result<BuildOutcome<MicrosoftOperation>, EngineError> {
        if let Some(campaign_id) = ctx.missing_campaign(entities) {
            return Ok(BuildOutcome::CampaignGone { campaign_id });
        }
        let mut operations = Vec::with_capacity(entities.len());
        for entity in entities {
            let operand = entity.operand();
            if let (Action::Add, EntityContent::Extension(ext)) = (action, &entity.content) {
                if !ext.is_publishable() {
                    debug!(entity_id = entity.id, "extension has nothing to publish");
                    continue;
                }
            }
            let parent = if operand.has_ad_group_parent() {
                ctx.parent_remote_id(entity).map(str::to_string)
            } else {
                ctx.campaign_remote_id(entity).ok().map(str::to_string)
            };
            let parent = match (action, parent) {
                (_, Some(p)) => p,
                (Action::Add, None) => {
                    return Err(EngineError::MissingField {
                        operand,
                        entity_id: entity.id,
                        field: if operand.has_ad_group_parent() {
                            "remote_parent_id"
                        } else {
                            "remote_campaign_id"
                        },
                    })
                }
                // Updates and removes address the row by its own id.
                (_, None) => String::new(),
            };
            let remote_id = match action {
                Action::Add => None,
                Action::Update | Action::Remove => Some(require_remote_id(entity)?),
            };
            operations.push(MicrosoftOperation {
                entity_id: entity.id,
                row: rows::entity_row(entity.id, action, &entity.content, remote_id, &parent),
            });
        }
        Ok(BuildOutcome::Operations(OperationSet::new(operations)))
    }
}

impl MicrosoftAdapter<HttpMicrosoftTransport> {
    pub fn from_config(cfg: &MicrosoftConfig) -> Result<Self> {
        let transport = HttpMicrosoftTransport::new(
            &cfg.base_url,
            cfg.developer_token.clone(),
            cfg.access_token.clone(),
            cfg.customer_id.clone(),
        )?;
        Ok(Self::new(transport)
            .with_chunk_sizes(&cfg.chunk_sizes)
            .with_min_request_interval(Duration::from_millis(cfg.min_request_interval_ms))
            .with_error_overrides(cfg.errors.as_ref()))
    }
}

fn provisioned_id(account: &Account) -> Result<&str> {
    account
        .remote_account_id
        .as_deref()
        .ok_or_else(|| anyhow!("account {} is not provisioned", account.id))
}

#[async_trait]
impl<T: MicrosoftTransport> PlatformAdapter for MicrosoftAdapter<T> {
    type Operation = MicrosoftOperation;

    fn platform(&self) -> Platform {
        Platform::Microsoft
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
    ) -> Result<BuildOutcome<MicrosoftOperation>, EngineError> {
        self.build(Action::Add, ctx, entities)
    }

    fn build_update_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<MicrosoftOperation>, EngineError> {
        self.build(Action::Update, ctx, entities)
    }

    fn build_delete_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<MicrosoftOperation>, EngineError> {
        self.build(Action::Remove, ctx, entities)
    }

    async fn upload_operations(
        &self,
        account: &Account,
        operand: Operand,
        action: Action,
        operations: &[MicrosoftOperation],
    ) -> Result<Submission> {
        let remote_account = provisioned_id(account)?;
        let rows: Vec<&BulkRow> = operations.iter().map(|op| &op.row).collect();
        let body = rows::write_upload_file(&rows)?;
        let upload = self.transport.get_bulk_upload_url(remote_account).await?;
        self.transport
            .upload_file(&upload.upload_url, remote_account, body)
            .await?;
        info!(
            account_id = account.id,
            operand = %operand,
            action = %action,
            rows = rows.len(),
            request_id = %upload.request_id,
            "bulk file uploaded"
        );
        Ok(Submission::Pending {
            job_token: upload.request_id,
        })
    }

    async fn poll_status(&self, account: &Account, job_token: &str) -> Result<PollStatus> {
        let status = self
            .transport
            .get_bulk_upload_status(provisioned_id(account)?, job_token)
            .await?;
        let collapsed = collapse_status(&status.request_status);
        if let (PollStatus::Succeeded(_), Some(url)) = (&collapsed, status.result_file_url) {
            if !url.trim().is_empty() {
                self.result_urls
                    .lock()
                    .await
                    .insert(job_token.to_string(), url);
            }
        }
        Ok(collapsed)
    }

    async fn fetch_result(&self, account: &Account, job_token: &str) -> Result<Option<String>> {
        let cached = self.result_urls.lock().await.remove(job_token);
        let url = match cached {
            Some(url) => Some(url),
            None => {
                debug!(request_id = %job_token, "no cached result url; asking for status");
                self.transport
                    .get_bulk_upload_status(provisioned_id(account)?, job_token)
                    .await?
                    .result_file_url
                    .filter(|u| !u.trim().is_empty())
            }
        };
        match url {
            Some(url) => Ok(Some(self.transport.download_result_file(&url).await?)),
            None => Ok(None),
        }
    }

    fn parse_result(
        &self,
        raw: &str,
        operand: Operand,
        action: Action,
    ) -> Result<ParsedResult, EngineError> {
        rows::parse_result_file(raw, operand, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AdGroupContent, Campaign, ExtensionContent, ExtensionKind, KeywordContent, MatchType,
    };
    use std::collections::HashMap;

    struct NoTransport;

    #[async_trait]
    impl MicrosoftTransport for NoTransport {
        async fn get_bulk_upload_url(&self, _: &str) -> Result<UploadUrl> {
            Err(anyhow!("offline"))
        }
        async fn upload_file(&self, _: &str, _: &str, _: Vec<u8>) -> Result<()> {
            Err(anyhow!("offline"))
        }
        async fn get_bulk_upload_status(&self, _: &str, _: &str) -> Result<UploadStatus> {
            Err(anyhow!("offline"))
        }
        async fn download_result_file(&self, _: &str) -> Result<String> {
            Err(anyhow!("offline"))
        }
    }

    fn ctx() -> BuildContext {
        BuildContext {
            account: Account {
                id: 1,
                platform: Platform::Microsoft,
                name: "Main".into(),
                remote_account_id: Some("A-1".into()),
            },
            campaigns: HashMap::from([(
                10,
                Campaign {
                    id: 10,
                    account_id: 1,
                    name: "Spring".into(),
                    remote_campaign_id: Some("C-10".into()),
                },
            )]),
            parent_remote_ids: HashMap::from([(5, "G-5".to_string())]),
        }
    }

    fn entity(id: i64, action: Action, content: EntityContent) -> PendingEntity {
        PendingEntity {
            id,
            account_id: 1,
            campaign_id: 10,
            parent_id: None,
            action,
            content,
            remote_id: None,
            remote_parent_id: None,
        }
    }

    fn ops(outcome: BuildOutcome<MicrosoftOperation>) -> OperationSet<MicrosoftOperation> {
        match outcome {
            BuildOutcome::Operations(set) => set,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn status_collapse() {
        assert_eq!(
            collapse_status("CompletedWithErrors"),
            PollStatus::Succeeded("CompletedWithErrors".into())
        );
        assert!(matches!(collapse_status("Expired"), PollStatus::Failed(_)));
        assert!(matches!(
            collapse_status("FileUploaded"),
            PollStatus::InProgress(_)
        ));
        assert_eq!(collapse_status("Mystery").raw(), "Mystery");
    }

    #[test]
    fn keywords_use_parent_ad_group_remote_id() {
        let adapter = MicrosoftAdapter::new(NoTransport);
        let mut kw = entity(
            7,
            Action::Add,
            EntityContent::Keyword(KeywordContent {
                text: "shoes".into(),
                match_type: MatchType::Broad,
                cpc_bid_micros: None,
                paused: false,
            }),
        );
        kw.parent_id = Some(5);
        let set = ops(adapter.build_add_operations(&ctx(), &[kw]).unwrap());
        assert_eq!(set.entity_ids, vec![7]);
        assert_eq!(set.operations[0].row.parent_id, "G-5");
        assert_eq!(set.operations[0].correlation_id(), "7");
    }

    #[test]
    fn missing_campaign_reports_campaign_gone() {
        let adapter = MicrosoftAdapter::new(NoTransport);
        let mut group = entity(
            1,
            Action::Add,
            EntityContent::AdGroup(AdGroupContent {
                name: "Shoes".into(),
                cpc_bid_micros: None,
                paused: false,
            }),
        );
        group.campaign_id = 99;
        match adapter.build_add_operations(&ctx(), &[group]).unwrap() {
            BuildOutcome::CampaignGone { campaign_id } => assert_eq!(campaign_id, 99),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn updates_require_a_remote_id() {
        let adapter = MicrosoftAdapter::new(NoTransport);
        let group = entity(
            1,
            Action::Update,
            EntityContent::AdGroup(AdGroupContent {
                name: "Shoes".into(),
                cpc_bid_micros: None,
                paused: false,
            }),
        );
        let err = adapter.build_update_operations(&ctx(), &[group]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingField {
                field: "remote_id",
                ..
            }
        ));
    }

    #[test]
    fn unpublishable_extensions_are_filtered_on_add_only() {
        let adapter = MicrosoftAdapter::new(NoTransport);
        let blank = EntityContent::Extension(ExtensionContent {
            kind: ExtensionKind::Sitelink,
            text: "Sale".into(),
            final_url: None,
        });
        let set = ops(
            adapter
                .build_add_operations(&ctx(), &[entity(3, Action::Add, blank.clone())])
                .unwrap(),
        );
        assert!(set.is_empty());
        assert!(set.check_parity(Operand::Extension, Action::Add, 1).is_ok());

        let mut removal = entity(3, Action::Remove, blank);
        removal.remote_id = Some("X-3".into());
        let set = ops(adapter.build_delete_operations(&ctx(), &[removal]).unwrap());
        assert_eq!(set.operations[0].row.status, "Deleted");
    }

    #[test]
    fn chunk_size_overrides() {
        let adapter = MicrosoftAdapter::new(NoTransport)
            .with_chunk_sizes(&BTreeMap::from([(Operand::Keyword, 3)]));
        assert_eq!(adapter.chunk_size(Operand::Keyword), 3);
        assert_eq!(adapter.chunk_size(Operand::AdGroup), 2_000);
        assert!(adapter.classifier().is_permanent(Some(1217), None));
    }
}
