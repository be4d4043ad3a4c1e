//! Platform adapter contract.
//!
//! An adapter turns pending entities into the platform's wire operations,
//! submits them, reports job status and parses result payloads back into
//! correlation-keyed successes and failures. The engine never sees vendor
//! types; everything crosses this boundary as [`OperationSet`],
//! [`Submission`], [`PollStatus`] and [`ParsedResult`].

pub mod classifier;
pub mod google;
pub mod microsoft;

use crate::error::EngineError;
use crate::model::{Account, Action, Campaign, Operand, PendingEntity, Platform};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

pub use classifier::{ErrorClassifier, ErrorTable};

/// One wire operation standing for exactly one local entity.
pub trait BulkOperation: Send + Sync + Debug {
    fn entity_id(&self) -> i64;
    /// Key under which the platform reports this operation's outcome.
    fn correlation_id(&self) -> String;
}

/// Operations built for a chunk together with the entity ids they cover.
#[derive(Debug)]
pub struct OperationSet<Op> {
    pub operations: Vec<Op>,
    pub entity_ids: Vec<i64>,
}

impl<Op: BulkOperation> OperationSet<Op> {
    pub fn new(operations: Vec<Op>) -> Self {
        let entity_ids = operations.iter().map(|op| op.entity_id()).collect();
        Self {
            operations,
            entity_ids,
        }
    }

    /// Operations must match the fetched entities one to one. Extension adds
    /// are the only kind allowed to drop unpublishable entities.
    pub fn check_parity(
        &self,
        operand: Operand,
        action: Action,
        entities: usize,
    ) -> Result<(), EngineError> {
        let filtered = operand == Operand::Extension && action == Action::Add;
        let ok = if filtered {
            self.operations.len() <= entities
        } else {
            self.operations.len() == entities
        };
        if ok && self.operations.len() == self.entity_ids.len() {
            return Ok(());
        }
        Err(EngineError::OperationCountMismatch {
            operand,
            action,
            operations: self.operations.len(),
            entities,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[derive(Debug)]
pub enum BuildOutcome<Op> {
    Operations(OperationSet<Op>),
    /// The chunk references a campaign that no longer exists locally.
    CampaignGone { campaign_id: i64 },
}

/// Referential data a build needs, loaded in bulk before the call.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub account: Account,
    pub campaigns: HashMap<i64, Campaign>,
    /// Remote ids of parent ad groups keyed by local id.
    pub parent_remote_ids: HashMap<i64, String>,
}

impl BuildContext {
    /// Resolve the entity's campaign remote id, or report the campaign as gone.
    pub fn campaign_remote_id(&self, entity: &PendingEntity) -> Result<&str, i64> {
        self.campaigns
            .get(&entity.campaign_id)
            .and_then(|c| c.remote_campaign_id.as_deref())
            .ok_or(entity.campaign_id)
    }

    /// First campaign referenced by `entities` that is missing locally.
    pub fn missing_campaign(&self, entities: &[PendingEntity]) -> Option<i64> {
        entities
            .iter()
            .map(|e| e.campaign_id)
            .find(|id| !self.campaigns.contains_key(id))
    }

    pub fn parent_remote_id<'a>(&'a self, entity: &'a PendingEntity) -> Option<&'a str> {
        entity.remote_parent_id.as_deref().or_else(|| {
            entity
                .parent_id
                .and_then(|p| self.parent_remote_ids.get(&p))
                .map(String::as_str)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Asynchronous job to poll.
    Pending { job_token: String },
    /// Synchronous call; the result payload came back with the response.
    Completed { job_token: String, payload: String },
}

impl Submission {
    pub fn job_token(&self) -> &str {
        match self {
            Submission::Pending { job_token } | Submission::Completed { job_token, .. } => {
                job_token
            }
        }
    }
}

/// Platform job status collapsed to what the engine acts on. Each variant
/// carries the raw platform string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    InProgress(String),
    Succeeded(String),
    Failed(String),
}

impl PollStatus {
    pub fn raw(&self) -> &str {
        match self {
            PollStatus::InProgress(s) | PollStatus::Succeeded(s) | PollStatus::Failed(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    pub message: String,
}

/// Outcome of one job keyed by correlation id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResult {
    /// Correlation id → remote id.
    #[serde(default)]
    pub results: HashMap<String, String>,
    #[serde(default)]
    pub errors: HashMap<String, PlatformError>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    type Operation: BulkOperation;

    fn platform(&self) -> Platform;

    /// Maximum operations per submitted job.
    fn chunk_size(&self, operand: Operand) -> usize;

    /// Pause between consecutive uploads for one account.
    fn min_request_interval(&self) -> Duration;

    fn classifier(&self) -> &ErrorClassifier;

    fn build_add_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<Self::Operation>, EngineError>;

    fn build_update_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<Self::Operation>, EngineError>;

    fn build_delete_operations(
        &self,
        ctx: &BuildContext,
        entities: &[PendingEntity],
    ) -> Result<BuildOutcome<Self::Operation>, EngineError>;

    async fn upload_operations(
        &self,
        account: &Account,
        operand: Operand,
        action: Action,
        operations: &[Self::Operation],
    ) -> Result<Submission>;

    async fn poll_status(&self, account: &Account, job_token: &str) -> Result<PollStatus>;

    /// Raw result payload, or `None` when the platform has nothing to hand out yet.
    async fn fetch_result(&self, account: &Account, job_token: &str) -> Result<Option<String>>;

    fn parse_result(
        &self,
        raw: &str,
        operand: Operand,
        action: Action,
    ) -> Result<ParsedResult, EngineError>;
}

/// Dispatch to the adapter's build for `action`.
pub fn build_operations<A: PlatformAdapter + ?Sized>(
    adapter: &A,
    action: Action,
    ctx: &BuildContext,
    entities: &[PendingEntity],
) -> Result<BuildOutcome<A::Operation>, EngineError> {
    match action {
        Action::Add => adapter.build_add_operations(ctx, entities),
        Action::Update => adapter.build_update_operations(ctx, entities),
        Action::Remove => adapter.build_delete_operations(ctx, entities),
    }
}

/// Ensure every entity of a build is of `operand` and carries the right content.
pub(crate) fn check_operand(operand: Operand, entities: &[PendingEntity]) -> Result<(), EngineError> {
    match entities.iter().find(|e| e.operand() != operand) {
        Some(e) => Err(EngineError::ContentMismatch {
            operand,
            entity_id: e.id,
        }),
        None => Ok(()),
    }
}

/// Remote id an update or remove must target.
pub(crate) fn require_remote_id<'a>(
    entity: &'a PendingEntity,
) -> Result<&'a str, EngineError> {
    entity
        .remote_id
        .as_deref()
        .ok_or(EngineError::MissingField {
            operand: entity.operand(),
            entity_id: entity.id,
            field: "remote_id",
        })
}
