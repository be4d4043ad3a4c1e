//! Bulk file rows.
//!
//! Upload files carry the column header, a `Format Version` row and one row
//! per entity. Result files echo the rows back with `Id`, `Error` and
//! `Error Number` filled in, preceded by more header rows for adds than for
//! updates and removes.

use crate::error::EngineError;
use crate::model::{Action, EntityContent, ExtensionKind, MatchType, Operand};
use crate::platform::{ParsedResult, PlatformError};
use serde::{Deserialize, Serialize};

pub const FORMAT_VERSION: &str = "6.0";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRow {
    #[serde(rename = "Type")]
    pub row_type: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Parent Id", default)]
    pub parent_id: String,
    #[serde(rename = "Client Id", default)]
    pub client_id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Keyword", default)]
    pub keyword: String,
    #[serde(rename = "Match Type", default)]
    pub match_type: String,
    #[serde(rename = "Bid", default)]
    pub bid: String,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Text", default)]
    pub text: String,
    #[serde(rename = "Final Url", default)]
    pub final_url: String,
    #[serde(rename = "Error", default)]
    pub error: String,
    #[serde(rename = "Error Number", default)]
    pub error_number: String,
}

/// Rows preceding entity rows in a result file, column header included.
pub fn result_header_rows(action: Action) -> usize {
    match action {
        Action::Add => 3,
        Action::Update | Action::Remove => 2,
    }
}

pub fn row_type(content: &EntityContent) -> &'static str {
    match content {
        EntityContent::AdGroup(_) => "Ad Group",
        EntityContent::Keyword(_) => "Keyword",
        EntityContent::Ad(_) => "Responsive Search Ad",
        EntityContent::Extension(e) => match e.kind {
            ExtensionKind::Callout => "Callout Ad Extension",
            ExtensionKind::Sitelink => "Sitelink Ad Extension",
        },
    }
}

fn status(action: Action, paused: bool) -> &'static str {
    match (action, paused) {
        (Action::Remove, _) => "Deleted",
        (_, true) => "Paused",
        (_, false) => "Active",
    }
}

fn match_type(m: MatchType) -> &'static str {
    match m {
        MatchType::Exact => "Exact",
        MatchType::Phrase => "Phrase",
        MatchType::Broad => "Broad",
    }
}

fn bid(micros: Option<i64>) -> String {
    micros
        .map(|m| format!("{:.2}", m as f64 / 1_000_000.0))
        .unwrap_or_default()
}

/// Row for one entity. `parent_id` is the remote campaign id for ad groups
/// and extensions, the remote ad group id otherwise.
pub fn entity_row(
    entity_id: i64,
    action: Action,
    content: &EntityContent,
    remote_id: Option<&str>,
    parent_id: &str,
) -> BulkRow {
    let mut row = BulkRow {
        row_type: row_type(content).to_string(),
        id: remote_id.unwrap_or_default().to_string(),
        parent_id: parent_id.to_string(),
        client_id: entity_id.to_string(),
        ..BulkRow::default()
    };
    // Removes only need identity columns.
    if action == Action::Remove {
        row.status = status(action, false).to_string();
        return row;
    }
    match content {
        EntityContent::AdGroup(c) => {
            row.status = status(action, c.paused).to_string();
            row.name = c.name.clone();
            row.bid = bid(c.cpc_bid_micros);
        }
        EntityContent::Keyword(c) => {
            row.status = status(action, c.paused).to_string();
            row.keyword = c.text.clone();
            row.match_type = match_type(c.match_type).to_string();
            row.bid = bid(c.cpc_bid_micros);
        }
        EntityContent::Ad(c) => {
            row.status = status(action, c.paused).to_string();
            row.title = c.headlines.join(";");
            row.text = c.descriptions.join(";");
            row.final_url = c.final_url.clone();
        }
        EntityContent::Extension(c) => {
            row.status = status(action, false).to_string();
            row.text = c.text.clone();
            row.final_url = c.final_url.clone().unwrap_or_default();
        }
    }
    row
}

fn format_version_row() -> BulkRow {
    BulkRow {
        row_type: "Format Version".into(),
        name: FORMAT_VERSION.into(),
        ..BulkRow::default()
    }
}

/// Serialize rows into an upload file.
pub fn write_upload_file(rows: &[&BulkRow]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.serialize(format_version_row())?;
    for row in rows {
        writer.serialize(row)?;
    }
    Ok(writer.into_inner().map_err(|e| e.into_error())?)
}

fn malformed(err: impl std::fmt::Display) -> EngineError {
    EngineError::MalformedResult(err.to_string())
}

/// Parse a result file into correlation-keyed outcomes.
///
/// Rows without both `Id` and `Error` are skipped. An error row for a
/// `Client Id` wins over any success row for it, in either order.
pub fn parse_result_file(raw: &str, operand: Operand, action: Action) -> Result<ParsedResult, EngineError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());
    let mut records = reader.records();
    let headers = match records.next() {
        Some(rec) => rec.map_err(malformed)?,
        None => return Err(malformed("result file is empty")),
    };
    if !headers.iter().any(|h| h == "Client Id") {
        return Err(malformed("result file has no Client Id column"));
    }

    let mut parsed = ParsedResult::default();
    for record in records.skip(result_header_rows(action) - 1) {
        let record = record.map_err(malformed)?;
        let row: BulkRow = match record.deserialize(Some(&headers)) {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(operand = %operand, ?err, "skipping unreadable result row");
                continue;
            }
        };
        if row.client_id.is_empty() || (row.id.is_empty() && row.error.is_empty()) {
            continue;
        }
        if !row.error.is_empty() {
            parsed.results.remove(&row.client_id);
            parsed.errors.insert(
                row.client_id.clone(),
                PlatformError {
                    code: row.error_number.parse().ok(),
                    reason: Some(row.error.clone()),
                    message: row.error,
                },
            );
        } else if !parsed.errors.contains_key(&row.client_id) {
            parsed.results.insert(row.client_id, row.id);
        }
    }
    Ok(parsed)
}
