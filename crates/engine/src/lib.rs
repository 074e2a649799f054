//! Lumyn decide pipeline.
//!
//! `decide` composes the whole engine end to end: validate the request, load
//! and hash the policy, normalize, redact, digest, probe idempotency, score
//! experience-memory similarity, evaluate the policy, fold risk, build the
//! canonical record, and persist it.
//!
//! Failure model, expressed as explicit result variants rather than blanket
//! catches:
//! - a store `Unavailable` error degrades to an ABSTAIN record
//!   (`reason_codes = ["STORAGE_UNAVAILABLE"]`, uncertainty 1.0) which is
//!   returned but not persisted;
//! - an `Integrity` error at persist time with a known `request_id` is a lost
//!   idempotency race: the winner's record is fetched and returned verbatim;
//! - everything else propagates.
//!
//! Idempotency is two-phase by design: the pre-probe (step 10) is an
//! optimization, the unique index is the source of truth, and the
//! post-integrity re-probe closes the race window between them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod normalize;
pub mod record;
pub mod redact;
pub mod similarity;

pub use normalize::{normalize, NormalizedRequest};
pub use record::{
    build_record, DecisionRecord, Determinism, PolicyRef, RiskSignals, RECORD_SCHEMA_VERSION,
};
pub use redact::{redact, RedactionProfile, RedactionReport, RedactionResult, REDACTED_MARKER};
pub use similarity::{amount_bucket, top_k_matches, SimilarityMatch};

use serde_json::{json, Map, Value};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info_span, warn};

use lumyn_core::canon::digest_value;
use lumyn_core::ids::{Clock, IdGenerator, SystemClock, UlidGenerator};
use lumyn_core::schemas;
use policy::{effective_mode, evaluate, load_policy, Evaluation, LoadedPolicy, Mode, PolicyError, Verdict};
use store::{MemoryLabel, Store, StoreError, GLOBAL_TENANT};

/// Reason code attached to degraded ABSTAIN records.
pub const REASON_STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";

/// Memory candidates fetched per decision before top-k selection.
const MEMORY_CANDIDATE_LIMIT: u32 = 500;

/// Errors surfaced by [`decide`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request failed schema validation; never persisted.
    #[error("request validation failed: {0}")]
    Validation(String),
    /// Policy could not be loaded or is invalid.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Store failure outside the two absorbed paths.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration for a decide call.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the policy YAML document.
    pub policy_path: PathBuf,
    /// Similarity matches surfaced in risk signals.
    pub top_k: usize,
    /// Mode overlaid onto requests that do not name one.
    pub mode: Option<Mode>,
    /// Redaction profile when the request does not name one.
    pub redaction_profile: RedactionProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy_path: PathBuf::from("policies/lumyn-support.v0.yml"),
            top_k: 5,
            mode: None,
            redaction_profile: RedactionProfile::Default,
        }
    }
}

/// Digest of a redacted request view plus its normalized feature view.
///
/// This is the record's `inputs_digest`: a pure function of the redacted
/// request and normalization, stable across processes.
pub fn compute_inputs_digest(request_view: &Value, normalized: &NormalizedRequest) -> String {
    let normalized_value =
        serde_json::to_value(normalized).expect("normalized view serializes");
    let mut doc = Map::new();
    doc.insert("normalized".to_owned(), normalized_value);
    doc.insert("request".to_owned(), request_view.clone());
    digest_value(&Value::Object(doc))
}

/// Run the decide pipeline with the production clock and id generator.
pub fn decide(
    request: &Value,
    config: &EngineConfig,
    store: &dyn Store,
) -> Result<DecisionRecord, EngineError> {
    decide_with(request, config, store, &SystemClock, &UlidGenerator)
}

/// Run the decide pipeline with injected clock and id generator.
#[allow(clippy::too_many_lines)]
pub fn decide_with(
    request: &Value,
    config: &EngineConfig,
    store: &dyn Store,
    clock: &dyn Clock,
    ids: &dyn IdGenerator,
) -> Result<DecisionRecord, EngineError> {
    let span = info_span!("lumyn.decide", top_k = config.top_k);
    let _guard = span.enter();

    // The configured mode only fills in when the request does not name one;
    // an explicit request-level override always wins.
    let mut request_eval = request.clone();
    if let (Some(mode), Some(root)) = (config.mode, request_eval.as_object_mut()) {
        let mode_value = serde_json::to_value(mode).expect("mode serializes");
        if matches!(root.get("policy"), Some(Value::Object(_))) {
            if let Some(Value::Object(p)) = root.get_mut("policy") {
                p.entry("mode").or_insert(mode_value);
            }
        } else {
            root.insert("policy".to_owned(), json!({ "mode": mode_value }));
        }
    }

    schemas::validate_request(&request_eval).map_err(EngineError::Validation)?;

    let loaded = load_policy(&config.policy_path)?;
    let mode = effective_mode(&loaded.doc, &request_eval);

    let normalized = normalize(&request_eval).map_err(EngineError::Validation)?;

    let tenant_id = request_eval
        .pointer("/subject/tenant_id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let tenant_key = tenant_id.clone().unwrap_or_else(|| GLOBAL_TENANT.to_owned());

    let profile = request_eval
        .pointer("/context/redaction/profile")
        .and_then(Value::as_str)
        .and_then(RedactionProfile::from_name)
        .unwrap_or(config.redaction_profile);

    let redaction = redact(request_eval.clone(), profile);
    debug!(
        profile = ?redaction.report.profile,
        redacted = redaction.report.redacted_paths.len(),
        "redaction applied"
    );
    let request_for_record = redaction.request;
    let inputs_digest = compute_inputs_digest(&request_for_record, &normalized);

    // Store bring-up: init + policy snapshot. Any storage failure here
    // degrades to ABSTAIN.
    let snapshot = store.init().and_then(|()| {
        store.put_policy_snapshot(
            &loaded.policy_hash,
            &loaded.doc.policy_id,
            &loaded.doc.policy_version,
            &loaded.source,
        )
    });
    if let Err(e) = snapshot {
        return match e {
            StoreError::Unavailable(_) | StoreError::Integrity(_) => {
                warn!(error = %e, "store unavailable during snapshot, abstaining");
                emit(degraded_abstain_record(
                    &request_for_record,
                    &loaded,
                    mode,
                    &inputs_digest,
                    clock,
                    ids,
                ))
            }
            other => Err(other.into()),
        };
    }

    // Idempotency pre-probe: a known (tenant_key, request_id) returns the
    // stored record verbatim.
    let request_id = request_eval.get("request_id").and_then(Value::as_str).map(str::to_owned);
    if let Some(rid) = request_id.as_deref() {
        match probe_existing(store, &tenant_key, rid) {
            Ok(Some(existing)) => return emit(existing),
            Ok(None) => {}
            Err(e @ StoreError::Unavailable(_)) => {
                warn!(error = %e, "store unavailable during idempotency probe, abstaining");
                return emit(degraded_abstain_record(
                    &request_for_record,
                    &loaded,
                    mode,
                    &inputs_digest,
                    clock,
                    ids,
                ));
            }
            Err(other) => return Err(other.into()),
        }
    }

    // The query feature carries the request's tags verbatim; memory items
    // store whatever the writer recorded, so the Jaccard side stays
    // case- and duplicate-sensitive on both ends.
    let query_feature = json!({
        "action_type": normalized.action_type,
        "amount_currency": normalized.amount_currency,
        "amount_usd_bucket": amount_bucket(normalized.amount_usd),
        "tags": request_eval.pointer("/action/tags").cloned().unwrap_or_else(|| json!([])),
    });
    let candidates = match store.list_memory_items(
        tenant_id.as_deref(),
        &normalized.action_type,
        MEMORY_CANDIDATE_LIMIT,
    ) {
        Ok(items) => items,
        Err(e @ StoreError::Unavailable(_)) => {
            warn!(error = %e, "store unavailable listing memory items, abstaining");
            return emit(degraded_abstain_record(
                &request_for_record,
                &loaded,
                mode,
                &inputs_digest,
                clock,
                ids,
            ));
        }
        Err(other) => return Err(other.into()),
    };

    let mut eval_doc = request_eval.clone();
    if let Some(doc) = eval_doc.as_object_mut() {
        doc.insert(
            "normalized".to_owned(),
            serde_json::to_value(&normalized).expect("normalized view serializes"),
        );
    }
    let evaluation = evaluate(&loaded.doc, mode, &eval_doc);

    let matches = top_k_matches(&query_feature, &candidates, config.top_k);
    let failure_similarity_score =
        matches.iter().find(|m| m.label == MemoryLabel::Failure).map_or(0.0, |m| m.score);

    let mut uncertainty_score: f64 = 0.2;
    if evaluation.verdict == Verdict::Query {
        uncertainty_score += 0.2;
    }
    if failure_similarity_score >= 0.35 {
        uncertainty_score += 0.3;
    }
    let uncertainty_score = uncertainty_score.clamp(0.0, 1.0);

    let record = build_record(
        request_for_record,
        PolicyRef {
            policy_id: loaded.doc.policy_id.clone(),
            policy_version: loaded.doc.policy_version.clone(),
            policy_hash: loaded.policy_hash.clone(),
            mode,
        },
        evaluation,
        RiskSignals {
            uncertainty_score,
            failure_similarity_score,
            failure_similarity_top_k: matches,
        },
        inputs_digest.clone(),
        clock,
        ids,
    );

    let record_value = serde_json::to_value(&record).expect("record serializes");
    match store.put_decision_record(&record_value) {
        Ok(()) => {}
        Err(integrity @ StoreError::Integrity(_)) => {
            // Lost the idempotency race: the unique index is the source of
            // truth, so fetch and return the winner's record.
            if let Some(rid) = request_id.as_deref() {
                return match probe_existing(store, &tenant_key, rid) {
                    Ok(Some(existing)) => emit(existing),
                    Ok(None) => Err(integrity.into()),
                    Err(e @ StoreError::Unavailable(_)) => {
                        warn!(error = %e, "store unavailable on idempotency re-probe, abstaining");
                        emit(degraded_abstain_record(
                            &record.request,
                            &loaded,
                            mode,
                            &inputs_digest,
                            clock,
                            ids,
                        ))
                    }
                    Err(other) => Err(other.into()),
                };
            }
            return Err(integrity.into());
        }
        Err(e @ StoreError::Unavailable(_)) => {
            warn!(error = %e, "store rejected decision record, abstaining");
            return emit(degraded_abstain_record(
                &record.request,
                &loaded,
                mode,
                &inputs_digest,
                clock,
                ids,
            ));
        }
        Err(other) => return Err(other.into()),
    }

    emit(record)
}

fn emit(record: DecisionRecord) -> Result<DecisionRecord, EngineError> {
    let value = serde_json::to_value(&record).expect("record serializes");
    telemetry::log_decision_record(&value);
    Ok(record)
}

fn probe_existing(
    store: &dyn Store,
    tenant_key: &str,
    request_id: &str,
) -> Result<Option<DecisionRecord>, StoreError> {
    let Some(decision_id) = store.get_decision_id_for_request_id(tenant_key, request_id)? else {
        return Ok(None);
    };
    let Some(value) = store.get_decision_record(&decision_id)? else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| StoreError::Invalid(format!("stored record does not parse: {e}")))
}

fn degraded_abstain_record(
    request_view: &Value,
    loaded: &LoadedPolicy,
    mode: Mode,
    inputs_digest: &str,
    clock: &dyn Clock,
    ids: &dyn IdGenerator,
) -> DecisionRecord {
    build_record(
        request_view.clone(),
        PolicyRef {
            policy_id: loaded.doc.policy_id.clone(),
            policy_version: loaded.doc.policy_version.clone(),
            policy_hash: loaded.policy_hash.clone(),
            mode,
        },
        Evaluation {
            verdict: Verdict::Abstain,
            reason_codes: vec![REASON_STORAGE_UNAVAILABLE.to_owned()],
            matched_rules: vec![],
            queries: vec![],
        },
        RiskSignals {
            uncertainty_score: 1.0,
            failure_similarity_score: 0.0,
            failure_similarity_top_k: vec![],
        },
        inputs_digest.to_owned(),
        clock,
        ids,
    )
}
