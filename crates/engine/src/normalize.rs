//! Canonical feature view derived from a decision request.
//!
//! Normalization is deterministic and side-effect free; its output feeds the
//! inputs digest, the predicate evaluation document, and the similarity query
//! feature, so any change here changes `inputs_digest`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixture conversion rates to USD. The table is intentionally fixed:
/// swapping rates silently would change `inputs_digest` for amount-bearing
/// requests.
const USD_RATES: &[(&str, f64)] = &[
    ("AUD", 0.66),
    ("CAD", 0.74),
    ("EUR", 1.08),
    ("GBP", 1.27),
    ("JPY", 0.0067),
    ("USD", 1.0),
];

/// Compact, deterministic feature view of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRequest {
    /// `action.type`, verbatim.
    pub action_type: String,
    /// `action.amount.currency` when present.
    pub amount_currency: Option<String>,
    /// Amount converted by the fixture table; `None` when the request has no
    /// amount or the currency is unknown.
    pub amount_usd: Option<f64>,
    /// Tags lowercased, de-duplicated, lexicographically sorted.
    pub tags: Vec<String>,
}

/// Derive the normalized view. The request is expected to have passed schema
/// validation; a missing `action.type` is still reported rather than
/// defaulted.
pub fn normalize(request: &Value) -> Result<NormalizedRequest, String> {
    let action = request.get("action").unwrap_or(&Value::Null);
    let action_type = action
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "request.action.type is required".to_owned())?
        .to_owned();

    let amount = action.get("amount");
    let amount_currency = amount
        .and_then(|a| a.get("currency"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let amount_usd = match (
        amount.and_then(|a| a.get("value")).and_then(Value::as_f64),
        amount_currency.as_deref(),
    ) {
        (Some(value), Some(currency)) => usd_rate(currency).map(|rate| value * rate),
        _ => None,
    };

    let mut tags: Vec<String> = action
        .get("tags")
        .and_then(Value::as_array)
        .map(|ts| ts.iter().filter_map(Value::as_str).map(str::to_lowercase).collect())
        .unwrap_or_default();
    tags.sort();
    tags.dedup();

    Ok(NormalizedRequest { action_type, amount_currency, amount_usd, tags })
}

fn usd_rate(currency: &str) -> Option<f64> {
    USD_RATES.iter().find(|(code, _)| *code == currency).map(|(_, rate)| *rate)
}
