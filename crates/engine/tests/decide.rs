use chrono::{TimeZone, Utc};
use engine::{decide_with, DecisionRecord, EngineConfig, EngineError, RedactionProfile};
use lumyn_core::ids::{FixedClock, SequenceGenerator};
use policy::{Mode, Verdict};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use store::{MemoryItem, MemoryLabel, SqliteStore, Store, StoreError};

const POLICY_TEMPLATE: &str = include_str!("../../../policies/lumyn-support.v0.yml");

fn workspace() -> (tempfile::TempDir, EngineConfig) {
    let dir = tempfile::tempdir().unwrap();
    let policy_path: PathBuf = dir.path().join("policy.v0.yml");
    fs::write(&policy_path, POLICY_TEMPLATE).unwrap();
    let config = EngineConfig { policy_path, ..Default::default() };
    (dir, config)
}

fn open_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store.init().unwrap();
    store
}

fn clock() -> FixedClock {
    FixedClock(Utc.with_ymd_and_hms(2024, 5, 2, 3, 4, 5).unwrap())
}

fn request(action_type: &str) -> Value {
    json!({
        "schema_version": "decision_request.v0",
        "subject": {"type": "service", "id": "support-agent", "tenant_id": "acme"},
        "action": {"type": action_type, "intent": "do the thing"},
        "evidence": {"ticket_id": "ZD-4002"},
        "context": {"mode": "digest_only", "digest": format!("sha256:{}", "a".repeat(64))}
    })
}

fn refund_request(value: f64, currency: &str) -> Value {
    let mut req = request("support.refund");
    req["action"]["amount"] = json!({"value": value, "currency": currency});
    req
}

fn run(req: &Value, config: &EngineConfig, store: &dyn Store) -> DecisionRecord {
    decide_with(req, config, store, &clock(), &SequenceGenerator::new("dec")).unwrap()
}

/// Store double that forwards to SQLite but can fail on demand.
struct FaultStore {
    inner: SqliteStore,
    fail_init: AtomicBool,
    fail_put_record: AtomicBool,
    hide_probe_once: AtomicBool,
}

impl FaultStore {
    fn new() -> Self {
        Self {
            inner: open_store(),
            fail_init: AtomicBool::new(false),
            fail_put_record: AtomicBool::new(false),
            hide_probe_once: AtomicBool::new(false),
        }
    }
}

impl Store for FaultStore {
    fn init(&self) -> Result<(), StoreError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.inner.init()
    }

    fn put_policy_snapshot(
        &self,
        policy_hash: &str,
        policy_id: &str,
        policy_version: &str,
        policy_text: &str,
    ) -> Result<(), StoreError> {
        self.inner.put_policy_snapshot(policy_hash, policy_id, policy_version, policy_text)
    }

    fn get_policy_snapshot_text(&self, policy_hash: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_policy_snapshot_text(policy_hash)
    }

    fn put_decision_record(&self, record: &Value) -> Result<(), StoreError> {
        if self.fail_put_record.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.inner.put_decision_record(record)
    }

    fn get_decision_record(&self, decision_id: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get_decision_record(decision_id)
    }

    fn get_decision_id_for_request_id(
        &self,
        tenant_key: &str,
        request_id: &str,
    ) -> Result<Option<String>, StoreError> {
        if self.hide_probe_once.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get_decision_id_for_request_id(tenant_key, request_id)
    }

    fn put_memory_item(&self, item: &MemoryItem) -> Result<(), StoreError> {
        self.inner.put_memory_item(item)
    }

    fn list_memory_items(
        &self,
        tenant_id: Option<&str>,
        action_type: &str,
        limit: u32,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        self.inner.list_memory_items(tenant_id, action_type, limit)
    }

    fn append_decision_event(
        &self,
        decision_id: &str,
        event_type: &str,
        data: &Value,
    ) -> Result<String, StoreError> {
        self.inner.append_decision_event(decision_id, event_type, data)
    }
}

#[test]
fn allow_path_for_unmatched_action() {
    let (_dir, config) = workspace();
    let store = open_store();
    let rec = run(&request("support.update_ticket"), &config, &store);

    assert_eq!(rec.evaluation.verdict, Verdict::Allow);
    assert!(rec.evaluation.reason_codes.is_empty());
    assert!(rec.evaluation.matched_rules.is_empty());
    assert_eq!(rec.policy.mode, Mode::Enforce);

    // Persisted and schema-conformant.
    let stored = store.get_decision_record(&rec.decision_id).unwrap().unwrap();
    assert!(lumyn_core::schemas::validate_record(&stored).is_ok());
}

#[test]
fn block_path_for_high_value_refund() {
    let (_dir, config) = workspace();
    let store = open_store();
    let rec = run(&refund_request(1000.0, "USD"), &config, &store);

    assert_eq!(rec.evaluation.verdict, Verdict::Block);
    assert_eq!(rec.evaluation.reason_codes, ["HIGH_VALUE"]);
    assert_eq!(rec.evaluation.matched_rules.len(), 1);
    assert_eq!(rec.evaluation.matched_rules[0].rule_id, "block-high-value-refund");
    assert_eq!(rec.evaluation.matched_rules[0].stage, "refunds");
}

#[test]
fn unknown_currency_routes_to_query() {
    let (_dir, config) = workspace();
    let store = open_store();
    let rec = run(&refund_request(100.0, "XTS"), &config, &store);

    assert_eq!(rec.evaluation.verdict, Verdict::Query);
    assert_eq!(rec.evaluation.reason_codes, ["UNKNOWN_CURRENCY"]);
    assert_eq!(rec.evaluation.queries.len(), 1);
    // QUERY bumps the uncertainty heuristic.
    assert!((rec.risk.uncertainty_score - 0.4).abs() < 1e-12);
}

#[test]
fn identical_inputs_yield_identical_digests() {
    let (_dir, config) = workspace();
    let a = run(&request("support.update_ticket"), &config, &open_store());
    let b = run(&request("support.update_ticket"), &config, &open_store());

    assert_eq!(a.determinism.inputs_digest, b.determinism.inputs_digest);
    assert_eq!(a.policy.policy_hash, b.policy.policy_hash);
    // With frozen clock and id sequence the whole record matches.
    assert_eq!(a, b);
}

#[test]
fn digest_depends_only_on_redacted_view() {
    let (_dir, config) = workspace();
    let mut noisy = request("support.update_ticket");
    noisy["evidence"]["notes"] = json!("customer shouted for ten minutes");
    let mut quiet = request("support.update_ticket");
    quiet["evidence"]["notes"] = json!("all calm");

    let a = run(&noisy, &config, &open_store());
    let b = run(&quiet, &config, &open_store());

    // Both notes redact to the same marker, so the digests agree.
    assert_eq!(a.request["evidence"]["notes"], engine::REDACTED_MARKER);
    assert_eq!(a.determinism.inputs_digest, b.determinism.inputs_digest);
}

#[test]
fn none_profile_keeps_evidence_verbatim() {
    let (_dir, config) = workspace();
    let mut req = request("support.update_ticket");
    req["evidence"]["notes"] = json!("kept verbatim");
    req["context"]["redaction"] = json!({"profile": "none"});

    let rec = run(&req, &config, &open_store());
    assert_eq!(rec.request["evidence"]["notes"], "kept verbatim");
}

#[test]
fn request_profile_overrides_configured_default() {
    let (_dir, mut config) = workspace();
    config.redaction_profile = RedactionProfile::None;
    let mut req = request("support.update_ticket");
    req["evidence"]["notes"] = json!("sensitive");
    req["context"]["redaction"] = json!({"profile": "strict"});

    let rec = run(&req, &config, &open_store());
    assert_eq!(rec.request["evidence"]["notes"], engine::REDACTED_MARKER);
    let ticket = rec.request["evidence"]["ticket_id"].as_str().unwrap();
    assert!(ticket.starts_with("sha256:"), "strict should hash identifiers: {ticket}");
}

#[test]
fn idempotent_replay_returns_stored_record() {
    let (_dir, config) = workspace();
    let store = open_store();
    let mut req = request("support.update_ticket");
    req["request_id"] = json!("r-1");

    let first = run(&req, &config, &store);
    // Different clock and id sequence: the stored record must win anyway.
    let later = FixedClock(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
    let second =
        decide_with(&req, &config, &store, &later, &SequenceGenerator::new("other")).unwrap();

    assert_eq!(first.decision_id, second.decision_id);
    assert_eq!(first, second);
}

#[test]
fn lost_race_returns_winner_via_reprobe() {
    let (_dir, config) = workspace();
    let store = FaultStore::new();
    let mut req = request("support.update_ticket");
    req["request_id"] = json!("r-race");

    let winner = run(&req, &config, &store);

    // Simulate the race window: the pre-probe misses, the insert collides,
    // the re-probe finds the winner.
    store.hide_probe_once.store(true, Ordering::SeqCst);
    let loser = decide_with(
        &req,
        &config,
        &store,
        &clock(),
        &SequenceGenerator::new("loser"),
    )
    .unwrap();

    assert_eq!(winner.decision_id, loser.decision_id);
    assert_eq!(winner, loser);
}

#[test]
fn storage_failure_on_persist_degrades_to_abstain() {
    let (_dir, config) = workspace();
    let store = FaultStore::new();
    store.fail_put_record.store(true, Ordering::SeqCst);

    let rec = run(&request("support.update_ticket"), &config, &store);
    assert_eq!(rec.evaluation.verdict, Verdict::Abstain);
    assert_eq!(rec.evaluation.reason_codes, [engine::REASON_STORAGE_UNAVAILABLE]);
    assert!(rec.evaluation.matched_rules.is_empty());
    assert!((rec.risk.uncertainty_score - 1.0).abs() < 1e-12);
    assert_eq!(rec.risk.failure_similarity_score, 0.0);
    // Nothing persisted.
    assert_eq!(store.get_decision_record(&rec.decision_id).unwrap(), None);
}

#[test]
fn storage_failure_at_init_degrades_to_abstain() {
    let (_dir, config) = workspace();
    let store = FaultStore::new();
    store.fail_init.store(true, Ordering::SeqCst);

    let rec = run(&request("support.update_ticket"), &config, &store);
    assert_eq!(rec.evaluation.verdict, Verdict::Abstain);
    assert_eq!(rec.evaluation.reason_codes, [engine::REASON_STORAGE_UNAVAILABLE]);
}

#[test]
fn invalid_request_is_a_validation_error() {
    let (_dir, config) = workspace();
    let store = open_store();
    let err = decide_with(
        &json!({"schema_version": "decision_request.v0"}),
        &config,
        &store,
        &clock(),
        &SequenceGenerator::new("dec"),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");
}

#[test]
fn missing_policy_file_is_a_policy_error() {
    let (_dir, mut config) = workspace();
    config.policy_path = PathBuf::from("/nonexistent/policy.yml");
    let err = decide_with(
        &request("support.update_ticket"),
        &config,
        &open_store(),
        &clock(),
        &SequenceGenerator::new("dec"),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::Policy(_)), "got {err:?}");
}

#[test]
fn advisory_config_mode_defaults_unmatched_to_query() {
    let (_dir, mut config) = workspace();
    config.mode = Some(Mode::Advisory);
    let rec = run(&request("support.update_ticket"), &config, &open_store());
    assert_eq!(rec.evaluation.verdict, Verdict::Query);
    assert_eq!(rec.policy.mode, Mode::Advisory);
}

#[test]
fn request_mode_wins_over_config_mode() {
    let (_dir, mut config) = workspace();
    config.mode = Some(Mode::Advisory);
    let mut req = request("support.update_ticket");
    req["policy"] = json!({"mode": "enforce"});
    let rec = run(&req, &config, &open_store());
    assert_eq!(rec.evaluation.verdict, Verdict::Allow);
    assert_eq!(rec.policy.mode, Mode::Enforce);
}

#[test]
fn failure_similarity_raises_uncertainty() {
    let (_dir, config) = workspace();
    let store = open_store();
    store
        .put_memory_item(&MemoryItem {
            memory_id: "mem-1".into(),
            tenant_id: Some("acme".into()),
            action_type: "support.update_ticket".into(),
            label: MemoryLabel::Failure,
            feature: json!({
                "action_type": "support.update_ticket",
                "amount_currency": null,
                "amount_usd_bucket": null,
                "tags": ["vip"]
            }),
            summary: "same update went badly last week".into(),
            created_at: "2024-04-01T00:00:00.000Z".into(),
        })
        .unwrap();

    let mut req = request("support.update_ticket");
    req["action"]["tags"] = json!(["vip"]);
    let rec = run(&req, &config, &store);
    assert_eq!(rec.evaluation.verdict, Verdict::Allow);
    assert!((rec.risk.failure_similarity_score - 1.0).abs() < 1e-12);
    // 0.2 base + 0.3 failure-similarity bump.
    assert!((rec.risk.uncertainty_score - 0.5).abs() < 1e-12);
    assert_eq!(rec.risk.failure_similarity_top_k.len(), 1);
    assert_eq!(rec.risk.failure_similarity_top_k[0].memory_id, "mem-1");
}

#[test]
fn top_k_zero_still_succeeds() {
    let (_dir, mut config) = workspace();
    config.top_k = 0;
    let store = open_store();
    store
        .put_memory_item(&MemoryItem {
            memory_id: "mem-1".into(),
            tenant_id: None,
            action_type: "support.update_ticket".into(),
            label: MemoryLabel::Failure,
            feature: json!({"action_type": "support.update_ticket", "tags": []}),
            summary: "irrelevant at k=0".into(),
            created_at: "2024-04-01T00:00:00.000Z".into(),
        })
        .unwrap();

    let rec = run(&request("support.update_ticket"), &config, &store);
    assert!(rec.risk.failure_similarity_top_k.is_empty());
    assert_eq!(rec.risk.failure_similarity_score, 0.0);
    assert!((rec.risk.uncertainty_score - 0.2).abs() < 1e-12);
}

#[test]
fn request_ids_are_scoped_per_tenant() {
    let (_dir, config) = workspace();
    let store = open_store();

    let mut acme = request("support.update_ticket");
    acme["request_id"] = json!("r-1");
    let mut zen = request("support.update_ticket");
    zen["request_id"] = json!("r-1");
    zen["subject"]["tenant_id"] = json!("zen");

    let a = decide_with(&acme, &config, &store, &clock(), &SequenceGenerator::new("a")).unwrap();
    let z = decide_with(&zen, &config, &store, &clock(), &SequenceGenerator::new("z")).unwrap();
    assert_ne!(a.decision_id, z.decision_id);
}

#[test]
fn record_policy_hash_matches_stored_snapshot() {
    let (_dir, config) = workspace();
    let store = open_store();
    let rec = run(&request("support.update_ticket"), &config, &store);
    let snapshot = store.get_policy_snapshot_text(&rec.policy.policy_hash).unwrap().unwrap();
    assert_eq!(snapshot, POLICY_TEMPLATE);
}
