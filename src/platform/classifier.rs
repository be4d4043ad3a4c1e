//! Per-platform error classification.
//!
//! `message` is total: exact code, then code range, then reason, then the
//! platform's own message, then a generic fallback. Permanence is decided
//! by explicit code and reason sets, never by the message.

use super::PlatformError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const GENERIC_MESSAGE: &str = "The platform rejected this change.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRange {
    pub from: i64,
    pub to: i64,
    pub message: String,
}

/// Message and permanence tables. Every field may be omitted in YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTable {
    pub messages: BTreeMap<i64, String>,
    pub ranges: Vec<CodeRange>,
    pub reasons: BTreeMap<String, String>,
    pub permanent_codes: BTreeSet<i64>,
    pub permanent_reasons: BTreeSet<String>,
}

impl ErrorTable {
    /// Layer `other` on top of `self`; entries in `other` win.
    pub fn merged_with(mut self, other: &ErrorTable) -> ErrorTable {
        self.messages
            .extend(other.messages.iter().map(|(k, v)| (*k, v.clone())));
        // Ranges are matched first-to-last, so overrides go in front.
        let mut ranges = other.ranges.clone();
        ranges.append(&mut self.ranges);
        self.ranges = ranges;
        self.reasons
            .extend(other.reasons.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.permanent_codes.extend(other.permanent_codes.iter());
        self.permanent_reasons
            .extend(other.permanent_reasons.iter().cloned());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub message: String,
    pub permanent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    table: ErrorTable,
}

impl ErrorClassifier {
    pub fn new(table: ErrorTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ErrorTable {
        &self.table
    }

    pub fn classify(&self, error: &PlatformError) -> Classification {
        let reason = error.reason.as_deref();
        Classification {
            message: self.message(error.code, reason, &error.message),
            permanent: self.is_permanent(error.code, reason),
        }
    }

    pub fn message(&self, code: Option<i64>, reason: Option<&str>, raw_message: &str) -> String {
        if let Some(code) = code {
            if let Some(m) = self.table.messages.get(&code) {
                return m.clone();
            }
            if let Some(r) = self
                .table
                .ranges
                .iter()
                .find(|r| r.from <= code && code <= r.to)
            {
                return r.message.clone();
            }
        }
        if let Some(m) = reason.and_then(|r| self.table.reasons.get(r)) {
            return m.clone();
        }
        let raw = raw_message.trim();
        if !raw.is_empty() {
            return raw.to_string();
        }
        GENERIC_MESSAGE.to_string()
    }

    pub fn is_permanent(&self, code: Option<i64>, reason: Option<&str>) -> bool {
        code.map(|c| self.table.permanent_codes.contains(&c))
            .unwrap_or(false)
            || reason
                .map(|r| self.table.permanent_reasons.contains(r))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        let mut table = ErrorTable::default();
        table.messages.insert(1217, "Campaign is gone.".into());
        table.ranges.push(CodeRange {
            from: 1000,
            to: 1999,
            message: "Structural problem.".into(),
        });
        table
            .reasons
            .insert("RESOURCE_NOT_FOUND".into(), "Not found.".into());
        table.permanent_codes.insert(1217);
        table.permanent_reasons.insert("RESOURCE_NOT_FOUND".into());
        ErrorClassifier::new(table)
    }

    #[test]
    fn lookup_order() {
        let c = classifier();
        assert_eq!(c.message(Some(1217), None, "raw"), "Campaign is gone.");
        assert_eq!(c.message(Some(1500), None, "raw"), "Structural problem.");
        assert_eq!(
            c.message(Some(42), Some("RESOURCE_NOT_FOUND"), "raw"),
            "Not found."
        );
        assert_eq!(c.message(Some(42), None, " bid too low "), "bid too low");
        assert_eq!(c.message(None, None, "  "), GENERIC_MESSAGE);
    }

    #[test]
    fn permanence_uses_codes_and_reasons() {
        let c = classifier();
        assert!(c.is_permanent(Some(1217), None));
        assert!(c.is_permanent(None, Some("RESOURCE_NOT_FOUND")));
        assert!(!c.is_permanent(Some(1500), Some("OTHER")));
        assert!(!c.is_permanent(None, None));

        let verdict = c.classify(&PlatformError {
            code: Some(1217),
            reason: None,
            message: "CampaignIdInvalid".into(),
        });
        assert!(verdict.permanent);
        assert_eq!(verdict.message, "Campaign is gone.");
    }

    #[test]
    fn overrides_take_precedence() {
        let base = classifier().table().clone();
        let mut extra = ErrorTable::default();
        extra.messages.insert(1217, "Parent campaign deleted.".into());
        extra.ranges.push(CodeRange {
            from: 1500,
            to: 1600,
            message: "Bidding problem.".into(),
        });
        extra.permanent_codes.insert(4001);
        let c = ErrorClassifier::new(base.merged_with(&extra));
        assert_eq!(c.message(Some(1217), None, ""), "Parent campaign deleted.");
        assert_eq!(c.message(Some(1550), None, ""), "Bidding problem.");
        assert_eq!(c.message(Some(1700), None, ""), "Structural problem.");
        assert!(c.is_permanent(Some(4001), None));
        assert!(c.is_permanent(Some(1217), None));
    }

    #[test]
    fn table_parses_from_partial_yaml() {
        let table: ErrorTable = serde_yaml::from_str("permanent_codes: [1100, 1201]\n").unwrap();
        assert!(table.permanent_codes.contains(&1201));
        assert!(table.messages.is_empty());
    }
}
