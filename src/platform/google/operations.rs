//! Mutate operation bodies and result payload parsing.
//!
//! Operations are plain JSON in the REST shape (`{"adGroupOperation":
//! {"create": {...}}}`). Remote ids are stored as full resource names; bare
//! numeric ids coming from the local catalog are expanded on the fly.

use crate::error::EngineError;
use crate::model::{Action, EntityContent, ExtensionKind, MatchType, PendingEntity};
use crate::platform::{ParsedResult, PlatformError};
use serde_json::{json, Map, Value};

/// Expand a bare id into `customers/{cid}/{collection}/{id}`.
pub fn resource_name(customer_id: &str, collection: &str, id: &str) -> String {
    if id.contains('/') {
        id.to_string()
    } else {
        format!("customers/{customer_id}/{collection}/{id}")
    }
}

fn status(paused: bool) -> &'static str {
    if paused {
        "PAUSED"
    } else {
        "ENABLED"
    }
}

fn match_type(m: MatchType) -> &'static str {
    match m {
        MatchType::Exact => "EXACT",
        MatchType::Phrase => "PHRASE",
        MatchType::Broad => "BROAD",
    }
}

fn text_assets(lines: &[String]) -> Vec<Value> {
    lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| json!({ "text": l }))
        .collect()
}

fn insert_opt(obj: &mut Map<String, Value>, key: &str, micros: Option<i64>) {
    if let Some(m) = micros {
        obj.insert(key.to_string(), Value::String(m.to_string()));
    }
}

/// Resource names the operation refers to, already expanded.
pub struct Targets<'a> {
    pub customer_id: &'a str,
    pub campaign: Option<String>,
    pub ad_group: Option<String>,
    pub remote_id: Option<&'a str>,
}

fn missing(entity: &PendingEntity, field: &'static str) -> EngineError {
    EngineError::MissingField {
        operand: entity.operand(),
        entity_id: entity.id,
        field,
    }
}

/// Build the mutate operation for one entity.
pub fn mutate_operation(
    action: Action,
    entity: &PendingEntity,
    targets: &Targets<'_>,
) -> Result<Value, EngineError> {
    let cid = targets.customer_id;
    let remote = || {
        targets
            .remote_id
            .ok_or_else(|| missing(entity, "remote_id"))
    };
    let campaign = || {
        targets
            .campaign
            .clone()
            .ok_or_else(|| missing(entity, "remote_campaign_id"))
    };
    let ad_group = || {
        targets
            .ad_group
            .clone()
            .ok_or_else(|| missing(entity, "remote_parent_id"))
    };

    let op = match (&entity.content, action) {
        (EntityContent::AdGroup(_), Action::Remove) => json!({
            "adGroupOperation": { "remove": resource_name(cid, "adGroups", remote()?) }
        }),
        (EntityContent::AdGroup(c), _) => {
            let mut body = Map::new();
            body.insert("name".into(), json!(c.name));
            body.insert("status".into(), json!(status(c.paused)));
            insert_opt(&mut body, "cpcBidMicros", c.cpc_bid_micros);
            if action == Action::Add {
                body.insert("campaign".into(), json!(campaign()?));
                json!({ "adGroupOperation": { "create": body } })
            } else {
                body.insert(
                    "resourceName".into(),
                    json!(resource_name(cid, "adGroups", remote()?)),
                );
                let mask = if c.cpc_bid_micros.is_some() {
                    "name,status,cpc_bid_micros"
                } else {
                    "name,status"
                };
                json!({ "adGroupOperation": { "update": body, "updateMask": mask } })
            }
        }
        (EntityContent::Keyword(_), Action::Remove) => json!({
            "adGroupCriterionOperation": {
                "remove": resource_name(cid, "adGroupCriteria", remote()?)
            }
        }),
        (EntityContent::Keyword(c), _) => {
            let mut body = Map::new();
            body.insert("status".into(), json!(status(c.paused)));
            insert_opt(&mut body, "cpcBidMicros", c.cpc_bid_micros);
            if action == Action::Add {
                body.insert("adGroup".into(), json!(ad_group()?));
                body.insert(
                    "keyword".into(),
                    json!({ "text": c.text, "matchType": match_type(c.match_type) }),
                );
                json!({ "adGroupCriterionOperation": { "create": body } })
            } else {
                // Keyword text and match type are immutable once created.
                body.insert(
                    "resourceName".into(),
                    json!(resource_name(cid, "adGroupCriteria", remote()?)),
                );
                let mask = if c.cpc_bid_micros.is_some() {
                    "status,cpc_bid_micros"
                } else {
                    "status"
                };
                json!({ "adGroupCriterionOperation": { "update": body, "updateMask": mask } })
            }
        }
        (EntityContent::Ad(_), Action::Remove) => json!({
            "adGroupAdOperation": { "remove": resource_name(cid, "adGroupAds", remote()?) }
        }),
        (EntityContent::Ad(c), Action::Add) => json!({
            "adGroupAdOperation": { "create": {
                "adGroup": ad_group()?,
                "status": status(c.paused),
                "ad": {
                    "finalUrls": [c.final_url],
                    "responsiveSearchAd": {
                        "headlines": text_assets(&c.headlines),
                        "descriptions": text_assets(&c.descriptions),
                    }
                }
            }}
        }),
        (EntityContent::Ad(c), _) => {
            // Ad content lives on the ad itself: `adGroupAds/{group}~{ad}` → `ads/{ad}`.
            let remote = remote()?;
            let ad_id = remote.rsplit('~').next().unwrap_or(remote);
            json!({ "adOperation": {
                "update": {
                    "resourceName": resource_name(cid, "ads", ad_id),
                    "finalUrls": [c.final_url],
                    "responsiveSearchAd": {
                        "headlines": text_assets(&c.headlines),
                        "descriptions": text_assets(&c.descriptions),
                    }
                },
                "updateMask": "final_urls,responsive_search_ad.headlines,responsive_search_ad.descriptions"
            }})
        }
        (EntityContent::Extension(_), Action::Remove) => json!({
            "extensionFeedItemOperation": {
                "remove": resource_name(cid, "extensionFeedItems", remote()?)
            }
        }),
        (EntityContent::Extension(c), _) => {
            let mut body = match c.kind {
                ExtensionKind::Callout => {
                    let mut m = Map::new();
                    m.insert("calloutFeedItem".into(), json!({ "calloutText": c.text }));
                    m
                }
                ExtensionKind::Sitelink => {
                    let urls: Vec<&String> = c.final_url.iter().collect();
                    let mut m = Map::new();
                    m.insert(
                        "sitelinkFeedItem".into(),
                        json!({ "linkText": c.text, "finalUrls": urls }),
                    );
                    m
                }
            };
            if action == Action::Add {
                body.insert("targetedCampaign".into(), json!(campaign()?));
                json!({ "extensionFeedItemOperation": { "create": body } })
            } else {
                body.insert(
                    "resourceName".into(),
                    json!(resource_name(cid, "extensionFeedItems", remote()?)),
                );
                let mask = match c.kind {
                    ExtensionKind::Callout => "callout_feed_item.callout_text",
                    ExtensionKind::Sitelink => {
                        "sitelink_feed_item.link_text,sitelink_feed_item.final_urls"
                    }
                };
                json!({ "extensionFeedItemOperation": { "update": body, "updateMask": mask } })
            }
        }
    };
    Ok(op)
}

fn malformed(msg: impl Into<String>) -> EngineError {
    EngineError::MalformedResult(msg.into())
}

fn index_of(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|i| i.to_string()),
        Value::String(s) if s.parse::<u64>().is_ok() => Some(s.clone()),
        _ => None,
    }
}

/// First `resourceName` inside a mutate operation response such as
/// `{"adGroupResult": {"resourceName": "..."}}`.
fn result_resource_name(response: &Value) -> Option<String> {
    response.as_object()?.values().find_map(|v| {
        v.get("resourceName")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Flatten `{"mutateError": "RESOURCE_NOT_FOUND"}` to `mutateError.RESOURCE_NOT_FOUND`.
fn error_reason(error: &Value) -> Option<String> {
    let (kind, value) = error.get("errorCode")?.as_object()?.iter().next()?;
    Some(format!("{}.{}", kind, value.as_str().unwrap_or_default()))
}

fn details_errors(status: &Value) -> Vec<&Value> {
    status
        .get("details")
        .and_then(Value::as_array)
        .map(|details| {
            details
                .iter()
                .filter_map(|d| d.get("errors").and_then(Value::as_array))
                .flatten()
                .collect()
        })
        .unwrap_or_default()
}

fn platform_error(code: Option<i64>, error: Option<&Value>, fallback: &str) -> PlatformError {
    PlatformError {
        code,
        reason: error.and_then(error_reason),
        message: error
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string(),
    }
}

/// Parse either a batch job result listing (`{"results": [...]}`) or a
/// partial-failure mutate response (`{"mutateOperationResponses": [...]}`).
pub fn parse_response(raw: &str) -> Result<ParsedResult, EngineError> {
    let root: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    let mut parsed = ParsedResult::default();

    if let Some(results) = root.get("results").and_then(Value::as_array) {
        for result in results {
            let Some(index) = result.get("operationIndex").and_then(index_of) else {
                continue;
            };
            let status = result
                .get("status")
                .filter(|s| s.get("code").and_then(Value::as_i64).unwrap_or(0) != 0);
            if let Some(status) = status {
                let fallback = status
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let errors = details_errors(status);
                parsed.errors.insert(
                    index,
                    platform_error(
                        status.get("code").and_then(Value::as_i64),
                        errors.first().copied(),
                        fallback,
                    ),
                );
            } else if let Some(name) = result
                .get("mutateOperationResponse")
                .and_then(result_resource_name)
            {
                parsed.results.insert(index, name);
            }
        }
        return Ok(parsed);
    }

    if let Some(responses) = root.get("mutateOperationResponses").and_then(Value::as_array) {
        if let Some(failure) = root.get("partialFailureError") {
            let code = failure.get("code").and_then(Value::as_i64);
            let fallback = failure
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            for error in details_errors(failure) {
                let index = error
                    .pointer("/location/fieldPathElements")
                    .and_then(Value::as_array)
                    .and_then(|path| {
                        path.iter().find(|p| {
                            p.get("fieldName").and_then(Value::as_str) == Some("mutate_operations")
                        })
                    })
                    .and_then(|p| p.get("index"))
                    .and_then(index_of);
                if let Some(index) = index {
                    parsed
                        .errors
                        .entry(index)
                        .or_insert_with(|| platform_error(code, Some(error), fallback));
                }
            }
        }
        for (i, response) in responses.iter().enumerate() {
            let index = i.to_string();
            if parsed.errors.contains_key(&index) {
                continue;
            }
            if let Some(name) = result_resource_name(response) {
                parsed.results.insert(index, name);
            }
        }
        return Ok(parsed);
    }

    Err(malformed("neither results nor mutateOperationResponses present"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AdContent, AdGroupContent, ExtensionContent, KeywordContent};

    fn entity(content: EntityContent, action: Action) -> PendingEntity {
        PendingEntity {
            id: 1,
            account_id: 1,
            campaign_id: 10,
            parent_id: Some(5),
            action,
            content,
            remote_id: None,
            remote_parent_id: None,
        }
    }

    fn targets(remote_id: Option<&str>) -> Targets<'_> {
        Targets {
            customer_id: "123",
            campaign: Some(resource_name("123", "campaigns", "10")),
            ad_group: Some(resource_name("123", "adGroups", "55")),
            remote_id,
        }
    }

    #[test]
    fn resource_names_expand_bare_ids_only() {
        assert_eq!(
            resource_name("123", "campaigns", "9"),
            "customers/123/campaigns/9"
        );
        assert_eq!(
            resource_name("123", "campaigns", "customers/7/campaigns/9"),
            "customers/7/campaigns/9"
        );
    }

    #[test]
    fn ad_group_create_and_update() {
        let group = entity(
            EntityContent::AdGroup(AdGroupContent {
                name: "Shoes".into(),
                cpc_bid_micros: Some(1_500_000),
                paused: true,
            }),
            Action::Add,
        );
        let op = mutate_operation(Action::Add, &group, &targets(None)).unwrap();
        let create = &op["adGroupOperation"]["create"];
        assert_eq!(create["campaign"], "customers/123/campaigns/10");
        assert_eq!(create["status"], "PAUSED");
        assert_eq!(create["cpcBidMicros"], "1500000");

        let op = mutate_operation(Action::Update, &group, &targets(Some("777"))).unwrap();
        assert_eq!(
            op["adGroupOperation"]["update"]["resourceName"],
            "customers/123/adGroups/777"
        );
        assert_eq!(
            op["adGroupOperation"]["updateMask"],
            "name,status,cpc_bid_micros"
        );
    }

    #[test]
    fn keyword_create_targets_parent_ad_group() {
        let kw = entity(
            EntityContent::Keyword(KeywordContent {
                text: "trail shoes".into(),
                match_type: MatchType::Exact,
                cpc_bid_micros: None,
                paused: false,
            }),
            Action::Add,
        );
        let op = mutate_operation(Action::Add, &kw, &targets(None)).unwrap();
        let create = &op["adGroupCriterionOperation"]["create"];
        assert_eq!(create["adGroup"], "customers/123/adGroups/55");
        assert_eq!(create["keyword"]["matchType"], "EXACT");
        assert!(create.get("cpcBidMicros").is_none());

        let mut no_parent = targets(None);
        no_parent.ad_group = None;
        assert!(matches!(
            mutate_operation(Action::Add, &kw, &no_parent),
            Err(EngineError::MissingField {
                field: "remote_parent_id",
                ..
            })
        ));
    }

    #[test]
    fn ad_update_goes_through_the_ad_resource() {
        let ad = entity(
            EntityContent::Ad(AdContent {
                headlines: vec!["Fast".into(), " ".into()],
                descriptions: vec!["Free returns".into()],
                final_url: "https://example.com".into(),
                paused: false,
            }),
            Action::Update,
        );
        let op = mutate_operation(
            Action::Update,
            &ad,
            &targets(Some("customers/123/adGroupAds/55~901")),
        )
        .unwrap();
        assert_eq!(
            op["adOperation"]["update"]["resourceName"],
            "customers/123/ads/901"
        );
        assert_eq!(
            op["adOperation"]["update"]["responsiveSearchAd"]["headlines"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn extension_remove_uses_resource_name() {
        let ext = entity(
            EntityContent::Extension(ExtensionContent {
                kind: ExtensionKind::Callout,
                text: "Free shipping".into(),
                final_url: None,
            }),
            Action::Remove,
        );
        let op = mutate_operation(Action::Remove, &ext, &targets(Some("44"))).unwrap();
        assert_eq!(
            op["extensionFeedItemOperation"]["remove"],
            "customers/123/extensionFeedItems/44"
        );
    }

    #[test]
    fn parses_batch_results() {
        let raw = r#"{"results":[
            {"operationIndex":"0","mutateOperationResponse":{"adGroupResult":{"resourceName":"customers/1/adGroups/111"}}},
            {"operationIndex":1,"mutateOperationResponse":{"adGroupResult":{"resourceName":"customers/1/adGroups/112"}}},
            {"operationIndex":"2","status":{"code":3,"message":"failed","details":[{"errors":[
                {"errorCode":{"mutateError":"RESOURCE_NOT_FOUND"},"message":"Campaign not found."}]}]}}
        ]}"#;
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.results["0"], "customers/1/adGroups/111");
        assert_eq!(parsed.results["1"], "customers/1/adGroups/112");
        let err = &parsed.errors["2"];
        assert_eq!(err.code, Some(3));
        assert_eq!(err.reason.as_deref(), Some("mutateError.RESOURCE_NOT_FOUND"));
        assert_eq!(err.message, "Campaign not found.");
    }

    #[test]
    fn parses_partial_failure_mutate_response() {
        let raw = r#"{
            "mutateOperationResponses":[
                {"adGroupCriterionResult":{"resourceName":"customers/1/adGroupCriteria/5~9"}},
                {}
            ],
            "partialFailureError":{"code":3,"message":"multiple errors","details":[{"errors":[
                {"errorCode":{"requestError":"INVALID_RESOURCE_NAME"},"message":"bad name",
                 "location":{"fieldPathElements":[{"fieldName":"mutate_operations","index":1}]}}
            ]}]}
        }"#;
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results["0"], "customers/1/adGroupCriteria/5~9");
        assert_eq!(
            parsed.errors["1"].reason.as_deref(),
            Some("requestError.INVALID_RESOURCE_NAME")
        );
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(matches!(
            parse_response("{}"),
            Err(EngineError::MalformedResult(_))
        ));
        assert!(matches!(
            parse_response("not json"),
            Err(EngineError::MalformedResult(_))
        ));
    }
}
