//! Redaction profiles applied to the persisted request view.
//!
//! The redacted request is the view used for both `inputs_digest` and record
//! persistence, so redaction must run before digest computation. Markers are
//! deterministic: the same input under the same profile always produces the
//! same bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lumyn_core::canon::sha256_hex;

/// Marker substituted for deny-listed free-text evidence fields.
pub const REDACTED_MARKER: &str = "<redacted>";

/// Evidence keys treated as free text. Structural identifiers (ids, hashes,
/// digests) are deliberately absent.
const DENY_LIST: &[&str] = &[
    "body",
    "comment",
    "comments",
    "description",
    "details",
    "message",
    "messages",
    "note",
    "notes",
    "summary",
    "text",
    "transcript",
];

/// Named redaction profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionProfile {
    /// Identity: the persisted view is the request as evaluated.
    None,
    /// Deny-listed fields under `evidence` are replaced wholesale with
    /// [`REDACTED_MARKER`], whatever their shape.
    #[default]
    Default,
    /// `default`, plus every other string leaf under `evidence` is replaced
    /// with a `sha256:` prefix of its digest.
    Strict,
}

impl RedactionProfile {
    /// Parse a profile name from a request's `context.redaction.profile`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(RedactionProfile::None),
            "default" => Some(RedactionProfile::Default),
            "strict" => Some(RedactionProfile::Strict),
            _ => None,
        }
    }
}

/// What a redaction pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionReport {
    /// Profile that was applied.
    pub profile: RedactionProfile,
    /// Dot paths of every replaced leaf, in walk order.
    pub redacted_paths: Vec<String>,
}

/// A redacted request view plus its report.
#[derive(Debug, Clone)]
pub struct RedactionResult {
    /// The view to digest and persist.
    pub request: Value,
    /// What was replaced.
    pub report: RedactionReport,
}

/// Apply `profile` to a request. Only the `evidence` subtree is touched.
pub fn redact(mut request: Value, profile: RedactionProfile) -> RedactionResult {
    let mut redacted_paths = Vec::new();
    if profile != RedactionProfile::None {
        if let Some(evidence) = request.get_mut("evidence") {
            let mut path = String::from("evidence");
            scrub(
                evidence,
                profile == RedactionProfile::Strict,
                &mut path,
                &mut redacted_paths,
            );
        }
    }
    RedactionResult { request, report: RedactionReport { profile, redacted_paths } }
}

fn is_denied(key: &str) -> bool {
    DENY_LIST.contains(&key.to_ascii_lowercase().as_str())
}

fn hash_marker(s: &str) -> String {
    format!("sha256:{}", &sha256_hex(s.as_bytes())[..16])
}

fn scrub(value: &mut Value, strict: bool, path: &mut String, report: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let len = path.len();
                path.push('.');
                path.push_str(key);
                if is_denied(key) {
                    // A denied key is dropped wholesale: free text hides as
                    // easily in a list or nested object as in a scalar.
                    *child = Value::String(REDACTED_MARKER.to_owned());
                    report.push(path.clone());
                } else if child.is_string() && strict {
                    let hashed = hash_marker(child.as_str().unwrap_or_default());
                    *child = Value::String(hashed);
                    report.push(path.clone());
                } else {
                    scrub(child, strict, path, report);
                }
                path.truncate(len);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                let len = path.len();
                path.push('.');
                path.push_str(&i.to_string());
                if child.is_string() && strict {
                    let hashed = hash_marker(child.as_str().unwrap_or_default());
                    *child = Value::String(hashed);
                    report.push(path.clone());
                } else {
                    scrub(child, strict, path, report);
                }
                path.truncate(len);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(evidence: Value) -> Value {
        json!({
            "schema_version": "decision_request.v0",
            "subject": {"type": "service", "id": "a"},
            "action": {"type": "support.refund", "intent": "x"},
            "evidence": evidence,
            "context": {"mode": "digest_only", "digest": format!("sha256:{}", "a".repeat(64))}
        })
    }

    #[test]
    fn none_profile_is_identity() {
        let req = request(json!({"notes": "customer was upset", "ticket_id": "ZD-1"}));
        let out = redact(req.clone(), RedactionProfile::None);
        assert_eq!(out.request, req);
        assert!(out.report.redacted_paths.is_empty());
    }

    #[test]
    fn default_profile_drops_free_text_keeps_identifiers() {
        let req = request(json!({
            "notes": "customer was upset",
            "ticket_id": "ZD-1",
            "digest": "sha256:abc",
            "thread": {"transcript": "long chat", "turn_count": 7}
        }));
        let out = redact(req, RedactionProfile::Default);
        let ev = &out.request["evidence"];
        assert_eq!(ev["notes"], REDACTED_MARKER);
        assert_eq!(ev["thread"]["transcript"], REDACTED_MARKER);
        assert_eq!(ev["ticket_id"], "ZD-1");
        assert_eq!(ev["digest"], "sha256:abc");
        assert_eq!(ev["thread"]["turn_count"], 7);
        assert_eq!(
            out.report.redacted_paths,
            ["evidence.notes", "evidence.thread.transcript"]
        );
    }

    #[test]
    fn denied_keys_with_structured_values_are_replaced_wholesale() {
        let req = request(json!({
            "notes": ["customer said the card number is 4111...", "ssn 123-45-6789"],
            "thread": {"messages": [{"text": "hello"}], "turn_count": 7},
            "ticket_id": "ZD-1"
        }));
        let out = redact(req, RedactionProfile::Default);
        let ev = &out.request["evidence"];
        assert_eq!(ev["notes"], REDACTED_MARKER);
        assert_eq!(ev["thread"]["messages"], REDACTED_MARKER);
        assert_eq!(ev["thread"]["turn_count"], 7);
        assert_eq!(ev["ticket_id"], "ZD-1");
        assert_eq!(
            out.report.redacted_paths,
            ["evidence.notes", "evidence.thread.messages"]
        );
    }

    #[test]
    fn strict_profile_hashes_remaining_string_leaves() {
        let req = request(json!({"notes": "secret", "ticket_id": "ZD-1", "count": 3}));
        let out = redact(req, RedactionProfile::Strict);
        let ev = &out.request["evidence"];
        assert_eq!(ev["notes"], REDACTED_MARKER);
        let hashed = ev["ticket_id"].as_str().unwrap();
        assert!(hashed.starts_with("sha256:"));
        assert_eq!(hashed.len(), "sha256:".len() + 16);
        assert_eq!(ev["count"], 3);
    }

    #[test]
    fn strict_markers_are_deterministic() {
        let req = request(json!({"ticket_id": "ZD-1"}));
        let a = redact(req.clone(), RedactionProfile::Strict);
        let b = redact(req, RedactionProfile::Strict);
        assert_eq!(a.request, b.request);
    }

    #[test]
    fn only_evidence_is_touched() {
        let mut req = request(json!({"notes": "x"}));
        req["action"]["intent"] = json!("notes about the refund");
        let out = redact(req, RedactionProfile::Strict);
        assert_eq!(out.request["action"]["intent"], "notes about the refund");
    }
}
