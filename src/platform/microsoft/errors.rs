//! Built-in error table for the bulk service. Numeric codes come from the
//! `Error Number` column.

use crate::platform::classifier::{CodeRange, ErrorTable};
use once_cell::sync::Lazy;

pub static DEFAULT_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    let messages = [
        (1013, "The bid amount is outside the allowed range."),
        (1100, "The campaign ID is invalid."),
        (1201, "The ad group ID is invalid."),
        (1217, "The parent campaign of this ad group is invalid or has been deleted."),
        (1504, "The ad group is in a status that does not allow this change."),
        (4409, "The keyword text is invalid."),
        (4111, "The final URL is not valid."),
    ];
    let ranges = [
        (1000, 1099, "The request contains an invalid bid or budget."),
        (1100, 1199, "The campaign referenced by this change is invalid."),
        (1200, 1299, "The ad group referenced by this change is invalid."),
        (4000, 4999, "The ad or keyword content failed editorial validation."),
    ];
    ErrorTable {
        messages: messages
            .into_iter()
            .map(|(code, m)| (code, m.to_string()))
            .collect(),
        ranges: ranges
            .into_iter()
            .map(|(from, to, message)| CodeRange {
                from,
                to,
                message: message.to_string(),
            })
            .collect(),
        reasons: [(
            "CampaignIdInvalid",
            "The campaign ID is invalid.",
        )]
        .into_iter()
        .map(|(r, m)| (r.to_string(), m.to_string()))
        .collect(),
        permanent_codes: [1100, 1201, 1217].into_iter().collect(),
        permanent_reasons: ["CampaignIdInvalid", "AdGroupIdInvalid"]
            .into_iter()
            .map(String::from)
            .collect(),
    }
});
