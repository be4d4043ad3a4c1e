//! Built-in error table. Codes are gRPC status codes; reasons are flattened
//! `errorCode` entries such as `mutateError.RESOURCE_NOT_FOUND`.

use crate::platform::classifier::ErrorTable;
use once_cell::sync::Lazy;

pub static DEFAULT_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    let messages = [
        (7, "The account does not grant access to this resource."),
        (8, "The account ran out of API quota; the change will be retried."),
        (13, "The platform hit an internal error; the change will be retried."),
        (14, "The platform was unavailable; the change will be retried."),
    ];
    let reasons = [
        (
            "mutateError.RESOURCE_NOT_FOUND",
            "The resource this change refers to no longer exists.",
        ),
        (
            "requestError.INVALID_RESOURCE_NAME",
            "The resource name of this change is invalid.",
        ),
        (
            "operationAccessDeniedError.OPERATION_NOT_PERMITTED_FOR_REMOVED_RESOURCE",
            "The parent of this change has been removed.",
        ),
        (
            "criterionError.KEYWORD_HAS_INVALID_CHARS",
            "The keyword text contains invalid characters.",
        ),
        (
            "policyFindingError.POLICY_FINDING",
            "The ad was disapproved by platform policy.",
        ),
        (
            "urlFieldError.INVALID_URL",
            "The final URL is not valid.",
        ),
    ];
    ErrorTable {
        messages: messages
            .into_iter()
            .map(|(code, m)| (code, m.to_string()))
            .collect(),
        ranges: Vec::new(),
        reasons: reasons
            .into_iter()
            .map(|(r, m)| (r.to_string(), m.to_string()))
            .collect(),
        permanent_codes: Default::default(),
        permanent_reasons: [
            "mutateError.RESOURCE_NOT_FOUND",
            "requestError.INVALID_RESOURCE_NAME",
            "operationAccessDeniedError.OPERATION_NOT_PERMITTED_FOR_REMOVED_RESOURCE",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    }
});
