//! Decision record assembly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lumyn_core::ids::{format_ts, Clock, IdGenerator};
use policy::{Evaluation, Mode};

use crate::similarity::SimilarityMatch;

/// Schema version stamped into every record.
pub const RECORD_SCHEMA_VERSION: &str = "decision_record.v0";

/// Reference to the policy a record was decided under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRef {
    /// Stable policy identifier.
    pub policy_id: String,
    /// Human-assigned policy version.
    pub policy_version: String,
    /// SHA-256 of the canonical JSON of the policy document; must equal the
    /// hash of the snapshot this record references.
    pub policy_hash: String,
    /// Effective mode the evaluation ran under.
    pub mode: Mode,
}

/// Risk signals folded into a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSignals {
    /// Deterministic uncertainty heuristic in [0, 1].
    pub uncertainty_score: f64,
    /// Score of the best failure-labeled match, or 0.
    pub failure_similarity_score: f64,
    /// Top-k similarity matches, all labels.
    pub failure_similarity_top_k: Vec<SimilarityMatch>,
}

/// Determinism anchors for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Determinism {
    /// Digest of the redacted request plus its normalized view.
    pub inputs_digest: String,
    /// Engine version that produced the record.
    pub engine_version: String,
}

/// Canonical decision record (`decision_record.v0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Document version marker.
    pub schema_version: String,
    /// Opaque record id.
    pub decision_id: String,
    /// UTC ISO-8601 timestamp, millisecond precision.
    pub created_at: String,
    /// The redacted request view this decision was made on.
    pub request: Value,
    /// Policy reference.
    pub policy: PolicyRef,
    /// Evaluation outcome.
    pub evaluation: Evaluation,
    /// Risk signals.
    pub risk: RiskSignals,
    /// Determinism anchors.
    pub determinism: Determinism,
}

/// Assemble a record. Pure aside from the injected clock and id generator;
/// never mutates its inputs.
pub fn build_record(
    request: Value,
    policy: PolicyRef,
    evaluation: Evaluation,
    risk: RiskSignals,
    inputs_digest: String,
    clock: &dyn Clock,
    ids: &dyn IdGenerator,
) -> DecisionRecord {
    DecisionRecord {
        schema_version: RECORD_SCHEMA_VERSION.to_owned(),
        decision_id: ids.next_id(),
        created_at: format_ts(clock.now()),
        request,
        policy,
        evaluation,
        risk,
        determinism: Determinism { inputs_digest, engine_version: lumyn_core::VERSION.to_owned() },
    }
}
