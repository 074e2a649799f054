//! Telemetry: structured JSON logging and per-decision events.

#![deny(unsafe_code)]

use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Filter applied when `RUST_LOG` is unset: the decide pipeline and its
/// surfaces at info, the store kept to warnings so per-statement chatter
/// does not drown decision events.
const DEFAULT_DIRECTIVES: &str = "info,store=warn";

/// Initialize structured JSON logging for the engine and its surfaces.
///
/// `RUST_LOG` overrides the default directives (e.g. `RUST_LOG=engine=debug`
/// to watch redaction and idempotency decisions). Events are flattened and
/// carry the enclosing `lumyn.decide` span fields, so `top_k` and the span
/// name land on every decision event without a nested `fields` object.
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_json_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let fmt_layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false);
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Emit one structured event for a decision record about to be returned to
/// the caller. Every exit path of the decide pipeline logs through here,
/// including records that were not persisted (degraded ABSTAIN).
pub fn log_decision_record(record: &Value) {
    let decision_id = record.get("decision_id").and_then(Value::as_str).unwrap_or("");
    let verdict = record.pointer("/evaluation/verdict").and_then(Value::as_str).unwrap_or("");
    let policy_hash = record.pointer("/policy/policy_hash").and_then(Value::as_str).unwrap_or("");
    let inputs_digest =
        record.pointer("/determinism/inputs_digest").and_then(Value::as_str).unwrap_or("");
    info!(decision_id, verdict, policy_hash, inputs_digest, "decision");
}
