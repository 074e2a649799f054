//! Experience-memory similarity scoring.
//!
//! Scores are in [0, 1]: half the weight comes from tag-set Jaccard overlap,
//! the rest from exact-match indicators on `action_type`, `amount_currency`,
//! and `amount_usd_bucket` (1/6 each). Ordering is total: score descending,
//! then `memory_id` ascending, so results are stable across runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use store::{MemoryItem, MemoryLabel};

/// One scored memory match surfaced in risk signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    /// Matched memory item id.
    pub memory_id: String,
    /// Outcome label of the matched item.
    pub label: MemoryLabel,
    /// Similarity score in [0, 1].
    pub score: f64,
    /// Summary carried over from the item.
    pub summary: String,
}

/// Coarse amount bucket used for matching: `None` when the amount is
/// unknown, `small` below 50 USD, `medium` below 200, else `large`.
pub fn amount_bucket(amount_usd: Option<f64>) -> Option<&'static str> {
    amount_usd.map(|v| {
        if v < 50.0 {
            "small"
        } else if v < 200.0 {
            "medium"
        } else {
            "large"
        }
    })
}

/// Score every candidate against the query feature and return the top `k`.
pub fn top_k_matches(query: &Value, candidates: &[MemoryItem], k: usize) -> Vec<SimilarityMatch> {
    let mut scored: Vec<SimilarityMatch> = candidates
        .iter()
        .map(|c| SimilarityMatch {
            memory_id: c.memory_id.clone(),
            label: c.label,
            score: score(query, &c.feature),
            summary: c.summary.clone(),
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.memory_id.cmp(&b.memory_id))
    });
    scored.truncate(k);
    scored
}

fn score(query: &Value, feature: &Value) -> f64 {
    let exact = ["action_type", "amount_currency", "amount_usd_bucket"]
        .iter()
        .filter(|key| {
            query.get(**key).unwrap_or(&Value::Null) == feature.get(**key).unwrap_or(&Value::Null)
        })
        .count();
    0.5 * jaccard(tag_set(query), tag_set(feature)) + exact as f64 / 6.0
}

fn tag_set(feature: &Value) -> BTreeSet<&str> {
    feature
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| tags.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn jaccard(a: BTreeSet<&str>, b: BTreeSet<&str>) -> f64 {
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(&b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, label: MemoryLabel, feature: Value) -> MemoryItem {
        MemoryItem {
            memory_id: id.into(),
            tenant_id: None,
            action_type: "support.refund".into(),
            label,
            feature,
            summary: format!("summary for {id}"),
            created_at: "2024-01-01T00:00:00.000Z".into(),
        }
    }

    fn query() -> Value {
        json!({
            "action_type": "support.refund",
            "amount_currency": "USD",
            "amount_usd_bucket": "large",
            "tags": ["billing", "vip"]
        })
    }

    #[test]
    fn identical_feature_scores_one() {
        let items = vec![item("m1", MemoryLabel::Failure, query())];
        let top = top_k_matches(&query(), &items, 5);
        assert_eq!(top.len(), 1);
        assert!((top[0].score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn disjoint_feature_scores_zero() {
        let feature = json!({
            "action_type": "support.escalate",
            "amount_currency": "EUR",
            "amount_usd_bucket": "small",
            "tags": ["fraud"]
        });
        let top = top_k_matches(&query(), &[item("m1", MemoryLabel::Neutral, feature)], 5);
        assert_eq!(top[0].score, 0.0);
    }

    #[test]
    fn exact_indicators_count_null_equality() {
        let q = json!({
            "action_type": "support.refund",
            "amount_currency": null,
            "amount_usd_bucket": null,
            "tags": []
        });
        let top = top_k_matches(&q, &[item("m1", MemoryLabel::Success, q.clone())], 5);
        // Tag jaccard contributes 0 on empty sets; three exact matches remain.
        assert!((top[0].score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn ties_break_by_memory_id_ascending() {
        let items = vec![
            item("m2", MemoryLabel::Neutral, query()),
            item("m1", MemoryLabel::Neutral, query()),
            item("m3", MemoryLabel::Neutral, query()),
        ];
        let top = top_k_matches(&query(), &items, 5);
        let ids: Vec<&str> = top.iter().map(|m| m.memory_id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
    }

    #[test]
    fn top_k_zero_returns_nothing() {
        let items = vec![item("m1", MemoryLabel::Failure, query())];
        assert!(top_k_matches(&query(), &items, 0).is_empty());
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(amount_bucket(None), None);
        assert_eq!(amount_bucket(Some(0.0)), Some("small"));
        assert_eq!(amount_bucket(Some(49.99)), Some("small"));
        assert_eq!(amount_bucket(Some(50.0)), Some("medium"));
        assert_eq!(amount_bucket(Some(199.99)), Some("medium"));
        assert_eq!(amount_bucket(Some(200.0)), Some("large"));
    }
}
