use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Logical store namespace (brand / template context). Passed explicitly to
/// every store call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Microsoft,
    Google,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Microsoft => "microsoft",
            Platform::Google => "google",
        }
    }
}

impl FromStr for Platform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "microsoft" => Ok(Platform::Microsoft),
            "google" => Ok(Platform::Google),
            other => Err(EngineError::UnknownPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity kind being synchronized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    AdGroup,
    Keyword,
    Ad,
    Extension,
}

impl Operand {
    /// Parents before children.
    pub const ALL: [Operand; 4] = [
        Operand::AdGroup,
        Operand::Keyword,
        Operand::Ad,
        Operand::Extension,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operand::AdGroup => "ad_group",
            Operand::Keyword => "keyword",
            Operand::Ad => "ad",
            Operand::Extension => "extension",
        }
    }

    /// Kinds that cannot outlive an entity of this kind.
    pub fn dependents(&self) -> &'static [Operand] {
        match self {
            Operand::AdGroup => &[Operand::Keyword, Operand::Ad],
            _ => &[],
        }
    }

    /// Whether the entity hangs off an ad group rather than directly off the campaign.
    pub fn has_ad_group_parent(&self) -> bool {
        matches!(self, Operand::Keyword | Operand::Ad)
    }
}

impl FromStr for Operand {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ad_group" | "adgroup" => Ok(Operand::AdGroup),
            "keyword" => Ok(Operand::Keyword),
            "ad" => Ok(Operand::Ad),
            "extension" => Ok(Operand::Extension),
            other => Err(EngineError::UnknownOperand(other.to_string())),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation requested against the platform. `Remove` is the pending-delete state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Add,
    Update,
    Remove,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Add, Action::Update, Action::Remove];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Remove => "remove",
        }
    }
}

impl FromStr for Action {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Action::Add),
            "update" => Ok(Action::Update),
            "remove" | "delete" => Ok(Action::Remove),
            other => Err(EngineError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    PendingResult,
    Complete,
    Error,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PendingResult => "PendingResult",
            JobStatus::Complete => "Complete",
            JobStatus::Error => "Error",
            JobStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::PendingResult)
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PendingResult" => Ok(JobStatus::PendingResult),
            "Complete" => Ok(JobStatus::Complete),
            "Error" => Ok(JobStatus::Error),
            "Failed" => Ok(JobStatus::Failed),
            other => Err(EngineError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Phrase,
    Broad,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Callout,
    Sitelink,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdGroupContent {
    pub name: String,
    #[serde(default)]
    pub cpc_bid_micros: Option<i64>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeywordContent {
    pub text: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub cpc_bid_micros: Option<i64>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdContent {
    pub headlines: Vec<String>,
    pub descriptions: Vec<String>,
    pub final_url: String,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionContent {
    pub kind: ExtensionKind,
    pub text: String,
    #[serde(default)]
    pub final_url: Option<String>,
}

impl ExtensionContent {
    /// Extensions with blank text, or sitelinks without a URL, expand to no
    /// platform operation at all.
    pub fn is_publishable(&self) -> bool {
        if self.text.trim().is_empty() {
            return false;
        }
        match self.kind {
            ExtensionKind::Callout => true,
            ExtensionKind::Sitelink => self
                .final_url
                .as_deref()
                .map(|u| !u.trim().is_empty())
                .unwrap_or(false),
        }
    }
}

/// Content fields of a pending entity, one variant per operand kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityContent {
    AdGroup(AdGroupContent),
    Keyword(KeywordContent),
    Ad(AdContent),
    Extension(ExtensionContent),
}

impl EntityContent {
    pub fn operand(&self) -> Operand {
        match self {
            EntityContent::AdGroup(_) => Operand::AdGroup,
            EntityContent::Keyword(_) => Operand::Keyword,
            EntityContent::Ad(_) => Operand::Ad,
            EntityContent::Extension(_) => Operand::Extension,
        }
    }

    /// Reject content that could never produce a valid operation.
    pub fn validate(&self, entity_id: i64) -> Result<(), EngineError> {
        let operand = self.operand();
        let missing = |field| EngineError::MissingField {
            operand,
            entity_id,
            field,
        };
        match self {
            EntityContent::AdGroup(c) if c.name.trim().is_empty() => Err(missing("name")),
            EntityContent::Keyword(c) if c.text.trim().is_empty() => Err(missing("text")),
            EntityContent::Ad(c) if c.headlines.iter().all(|h| h.trim().is_empty()) => {
                Err(missing("headlines"))
            }
            EntityContent::Ad(c) if c.final_url.trim().is_empty() => Err(missing("final_url")),
            _ => Ok(()),
        }
    }
}

/// A local entity waiting for an add, update or remove against its account.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntity {
    pub id: i64,
    pub account_id: i64,
    pub campaign_id: i64,
    /// Local ad group id for keywords and ads.
    pub parent_id: Option<i64>,
    pub action: Action,
    pub content: EntityContent,
    pub remote_id: Option<String>,
    pub remote_parent_id: Option<String>,
}

impl PendingEntity {
    pub fn operand(&self) -> Operand {
        self.content.operand()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncedEntity {
    pub id: i64,
    pub operand: Operand,
    pub account_id: i64,
    pub campaign_id: i64,
    pub parent_id: Option<i64>,
    pub content: EntityContent,
    pub remote_id: String,
    pub remote_parent_id: Option<String>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub platform: Platform,
    pub name: String,
    /// `None` while the account is not provisioned on the platform.
    pub remote_account_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Campaign {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub remote_campaign_id: Option<String>,
}

/// Correlation id embedded in a submitted operation and the entity it stands for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Correlation {
    pub correlation_id: String,
    pub entity_id: i64,
}

/// Exactly what a job submitted; results are diffed against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobMetadata {
    pub entity_ids: Vec<i64>,
    pub correlations: Vec<Correlation>,
}

impl JobMetadata {
    pub fn correlation_index(&self) -> HashMap<&str, i64> {
        self.correlations
            .iter()
            .map(|c| (c.correlation_id.as_str(), c.entity_id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchJob {
    pub id: i64,
    pub namespace: Namespace,
    pub platform: Platform,
    pub account_id: i64,
    pub operand: Operand,
    pub action: Action,
    pub job_token: String,
    pub submission_id: String,
    pub status: JobStatus,
    /// Last adapter-specific status string seen while polling.
    pub platform_status: Option<String>,
    pub attempts: i32,
    pub execute_at: DateTime<Utc>,
    pub metadata: JobMetadata,
    /// Result payload of a synchronous submission.
    pub inline_result: Option<String>,
    pub last_error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert form of [`BatchJob`].
#[derive(Debug, Clone)]
pub struct NewBatchJob {
    pub namespace: Namespace,
    pub platform: Platform,
    pub account_id: i64,
    pub operand: Operand,
    pub action: Action,
    pub job_token: String,
    pub submission_id: String,
    pub status: JobStatus,
    pub execute_at: DateTime<Utc>,
    pub metadata: JobMetadata,
    pub inline_result: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub operand: Operand,
    pub entity_id: i64,
    pub account_id: i64,
    pub campaign_id: i64,
    pub action: Action,
    pub code: Option<i64>,
    pub reason: Option<String>,
    pub raw_message: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_round_trip_through_from_str() {
        for operand in Operand::ALL {
            assert_eq!(operand.as_str().parse::<Operand>().unwrap(), operand);
        }
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert_eq!("delete".parse::<Action>().unwrap(), Action::Remove);
        assert!(matches!(
            "pause".parse::<Action>(),
            Err(EngineError::UnknownAction(_))
        ));
        assert!("Complete".parse::<JobStatus>().unwrap().is_terminal());
        assert!(!JobStatus::PendingResult.is_terminal());
    }

    #[test]
    fn ad_group_is_the_only_operand_with_dependents() {
        assert_eq!(
            Operand::AdGroup.dependents(),
            &[Operand::Keyword, Operand::Ad]
        );
        assert!(Operand::Keyword.dependents().is_empty());
        assert!(Operand::Extension.dependents().is_empty());
    }

    #[test]
    fn content_serializes_with_kind_tag() {
        let content = EntityContent::Keyword(KeywordContent {
            text: "running shoes".into(),
            match_type: MatchType::Phrase,
            cpc_bid_micros: Some(1_500_000),
            paused: false,
        });
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["kind"], "keyword");
        assert_eq!(json["match_type"], "phrase");
        let back: EntityContent = serde_json::from_value(json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn validation_rejects_missing_required_fields() {
        let ad = EntityContent::Ad(AdContent {
            headlines: vec!["  ".into()],
            descriptions: vec![],
            final_url: "https://example.com".into(),
            paused: false,
        });
        match ad.validate(9) {
            Err(EngineError::MissingField {
                field, entity_id, ..
            }) => {
                assert_eq!(field, "headlines");
                assert_eq!(entity_id, 9);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let group = EntityContent::AdGroup(AdGroupContent {
            name: "Shoes".into(),
            cpc_bid_micros: None,
            paused: false,
        });
        assert!(group.validate(1).is_ok());
    }

    #[test]
    fn sitelink_without_url_is_not_publishable() {
        let sitelink = ExtensionContent {
            kind: ExtensionKind::Sitelink,
            text: "Sale".into(),
            final_url: None,
        };
        assert!(!sitelink.is_publishable());
        let callout = ExtensionContent {
            kind: ExtensionKind::Callout,
            text: "Free shipping".into(),
            final_url: None,
        };
        assert!(callout.is_publishable());
    }

    #[test]
    fn correlation_index_maps_ids() {
        let meta = JobMetadata {
            entity_ids: vec![1, 2],
            correlations: vec![
                Correlation {
                    correlation_id: "0".into(),
                    entity_id: 1,
                },
                Correlation {
                    correlation_id: "1".into(),
                    entity_id: 2,
                },
            ],
        };
        let index = meta.correlation_index();
        assert_eq!(index.get("1"), Some(&2));
        assert_eq!(index.get("7"), None);
    }
}
