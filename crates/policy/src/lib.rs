//! Lumyn policy engine
//!
//! This crate owns the versioned policy document: loading and validating the
//! YAML source, hashing it into the determinism chain, and executing the
//! staged rule machine that turns a decision request into a verdict.
//!
//! Verdict taxonomy:
//! - Allow — proceed unchanged
//! - Block — refuse the action
//! - Query — proceed only after a human answers the attached prompt
//! - Abstain — never produced here; reserved for the orchestrator's degraded
//!   storage path
//!
//! Precedence and determinism:
//! 1) Stages run in source order; a stage whose `match` gate is false is
//!    skipped whole.
//! 2) Within a stage, rules are scanned in source order and every rule whose
//!    `when` predicate holds fires; firing never short-circuits the scan.
//! 3) The final verdict is the highest-precedence effect among all fired
//!    rules: block > query > allow.
//! 4) When nothing fires, `enforce` mode yields ALLOW and `advisory` yields
//!    QUERY.
//!
//! The predicate language is total: evaluation always terminates, has no side
//! effects, and undefined paths resolve to null. `policy_hash` is the SHA-256
//! of the canonical JSON of the parsed document, so it is invariant under key
//! reordering and YAML formatting differences.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

use lumyn_core::canon::digest_value;
use lumyn_core::schemas;

/// Errors from policy loading.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Policy file could not be read.
    #[error("policy file {path}: {source}")]
    Io {
        /// Path the loader was asked to read.
        path: String,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },
    /// Policy text is not well-formed YAML.
    #[error("malformed policy yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Policy document violates the schema or the reason-code registry.
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Final verdict of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Action may proceed.
    Allow,
    /// Action is refused.
    Block,
    /// Action needs a human answer before proceeding.
    Query,
    /// Engine could not decide (degraded storage path only).
    Abstain,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Allow => "ALLOW",
            Verdict::Block => "BLOCK",
            Verdict::Query => "QUERY",
            Verdict::Abstain => "ABSTAIN",
        };
        f.write_str(s)
    }
}

/// Effect a fired rule contributes to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Contributes ALLOW.
    Allow,
    /// Contributes BLOCK; wins over every other effect.
    Block,
    /// Contributes QUERY; wins over allow.
    Query,
}

impl Effect {
    fn severity(self) -> u8 {
        match self {
            Effect::Block => 3,
            Effect::Query => 2,
            Effect::Allow => 1,
        }
    }

    fn verdict(self) -> Verdict {
        match self {
            Effect::Allow => Verdict::Allow,
            Effect::Block => Verdict::Block,
            Effect::Query => Verdict::Query,
        }
    }
}

/// Policy execution mode; controls the verdict when no rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Default-allow: silence means the action is permitted.
    #[default]
    Enforce,
    /// Default-query: silence still routes to a human.
    Advisory,
}

/// Comparison operator inside a rule predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    /// Structural equality (null-safe).
    Eq,
    /// Structural inequality.
    Ne,
    /// Numeric less-than.
    Lt,
    /// Numeric less-than-or-equal.
    Lte,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-than-or-equal.
    Gte,
    /// Membership of the resolved value in an array literal.
    In,
}

/// Total predicate over the evaluation document.
///
/// The document is the request JSON with the normalized feature view spliced
/// in under `normalized`, so predicates can address both raw request paths
/// (`action.type`) and derived features (`normalized.amount_usd`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    /// Every child predicate holds.
    All {
        /// Conjuncts, evaluated in order.
        all: Vec<Predicate>,
    },
    /// At least one child predicate holds.
    Any {
        /// Disjuncts, evaluated in order.
        any: Vec<Predicate>,
    },
    /// The child predicate does not hold.
    Not {
        /// Negated predicate.
        not: Box<Predicate>,
    },
    /// Compare the value at `field` against `value`.
    Cmp {
        /// Dot path into the evaluation document.
        field: String,
        /// Comparison operator.
        op: CmpOp,
        /// Literal to compare against; defaults to null.
        #[serde(default)]
        value: Value,
    },
}

impl Predicate {
    /// Evaluate against a document. Undefined paths resolve to null; ordered
    /// comparisons where either side is not a number are false; equality is
    /// structural and null-safe.
    pub fn eval(&self, doc: &Value) -> bool {
        match self {
            Predicate::All { all } => all.iter().all(|p| p.eval(doc)),
            Predicate::Any { any } => any.iter().any(|p| p.eval(doc)),
            Predicate::Not { not } => !not.eval(doc),
            Predicate::Cmp { field, op, value } => {
                let resolved = resolve_path(doc, field).unwrap_or(&Value::Null);
                compare(resolved, *op, value)
            }
        }
    }
}

fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => lhs == rhs,
        CmpOp::Ne => lhs != rhs,
        CmpOp::In => rhs.as_array().is_some_and(|set| set.contains(lhs)),
        CmpOp::Lt | CmpOp::Lte | CmpOp::Gt | CmpOp::Gte => {
            match (lhs.as_f64(), rhs.as_f64()) {
                (Some(l), Some(r)) => match op {
                    CmpOp::Lt => l < r,
                    CmpOp::Lte => l <= r,
                    CmpOp::Gt => l > r,
                    _ => l >= r,
                },
                _ => false,
            }
        }
    }
}

/// A single policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Rule identifier, unique within the policy.
    pub id: String,
    /// Firing condition.
    pub when: Predicate,
    /// Effect contributed when the rule fires.
    pub effect: Effect,
    /// Reason codes attached to the decision; must exist in the registry.
    #[serde(default)]
    pub reason_codes: Vec<String>,
    /// Prompt surfaced to a human when a `query` rule fires.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// An ordered evaluation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage identifier.
    pub id: String,
    /// Stage-level gate; a false gate skips the whole stage.
    #[serde(default, rename = "match")]
    pub gate: Option<Predicate>,
    /// Rules scanned in source order.
    pub rules: Vec<Rule>,
}

/// Parsed policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDoc {
    /// Document version marker (`policy.v0`).
    pub schema_version: String,
    /// Stable policy identifier.
    pub policy_id: String,
    /// Human-assigned policy version string.
    pub policy_version: String,
    /// Execution mode; defaults to enforce.
    #[serde(default)]
    pub mode: Mode,
    /// Stages in source order; ordering is significant for precedence.
    pub stages: Vec<Stage>,
}

/// A policy ready for evaluation: parsed document, raw source, content hash.
#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    /// Parsed and validated document.
    pub doc: PolicyDoc,
    /// Raw YAML text, snapshotted verbatim to the store.
    pub source: String,
    /// SHA-256 of the canonical JSON of the parsed document.
    pub policy_hash: String,
}

/// Load a policy from a YAML file.
pub fn load_policy(path: impl AsRef<Path>) -> Result<LoadedPolicy, PolicyError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|e| PolicyError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_policy_str(&source)
}

/// Parse and validate a policy from YAML text.
///
/// Validation order: YAML parse, policy schema, reason-code registry
/// cross-check. The hash is computed over the parsed document, not the
/// source text, so formatting and key order do not affect it.
pub fn load_policy_str(source: &str) -> Result<LoadedPolicy, PolicyError> {
    let raw: Value = serde_yaml::from_str(source)?;
    schemas::validate_policy(&raw).map_err(PolicyError::Invalid)?;
    check_reason_codes(&raw)?;
    let doc: PolicyDoc =
        serde_json::from_value(raw.clone()).map_err(|e| PolicyError::Invalid(e.to_string()))?;
    let policy_hash = digest_value(&raw);
    Ok(LoadedPolicy { doc, source: source.to_owned(), policy_hash })
}

fn check_reason_codes(raw: &Value) -> Result<(), PolicyError> {
    let registry = schemas::reason_codes();
    let empty = Vec::new();
    let stages = raw.get("stages").and_then(Value::as_array).unwrap_or(&empty);
    for (si, stage) in stages.iter().enumerate() {
        let rules = stage.get("rules").and_then(Value::as_array).unwrap_or(&empty);
        for (ri, rule) in rules.iter().enumerate() {
            let codes = rule.get("reason_codes").and_then(Value::as_array).unwrap_or(&empty);
            for code in codes {
                let code = code.as_str().unwrap_or_default();
                if !registry.contains(code) {
                    return Err(PolicyError::Invalid(format!(
                        "stages[{si}].rules[{ri}] references unknown reason code '{code}'"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// One fired rule, in firing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedRule {
    /// Stage the rule fired in.
    pub stage: String,
    /// Firing rule id.
    pub rule_id: String,
    /// Effect the rule contributed.
    pub effect: Effect,
    /// Reason codes carried by the rule.
    pub reason_codes: Vec<String>,
}

/// Prompt emitted by a fired `query` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPrompt {
    /// Firing rule id.
    pub rule_id: String,
    /// Prompt text; empty when the rule declares none.
    pub prompt: String,
}

/// Outcome of evaluating a policy against an evaluation document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Final verdict under the precedence rules.
    pub verdict: Verdict,
    /// De-duplicated union of fired reason codes, first occurrence first.
    pub reason_codes: Vec<String>,
    /// Every fired rule in firing order.
    pub matched_rules: Vec<MatchedRule>,
    /// One entry per fired `query` rule.
    pub queries: Vec<QueryPrompt>,
}

/// Resolve the effective mode for an evaluation document: a request-level
/// `policy.mode` override wins over the document default.
pub fn effective_mode(policy: &PolicyDoc, doc: &Value) -> Mode {
    match doc.pointer("/policy/mode").and_then(Value::as_str) {
        Some("advisory") => Mode::Advisory,
        Some("enforce") => Mode::Enforce,
        _ => policy.mode,
    }
}

/// Run the staged state machine over `doc` under the given mode.
pub fn evaluate(policy: &PolicyDoc, mode: Mode, doc: &Value) -> Evaluation {
    let mut matched: Vec<MatchedRule> = Vec::new();
    let mut queries: Vec<QueryPrompt> = Vec::new();
    for stage in &policy.stages {
        if let Some(gate) = &stage.gate {
            if !gate.eval(doc) {
                continue;
            }
        }
        for rule in &stage.rules {
            if !rule.when.eval(doc) {
                continue;
            }
            matched.push(MatchedRule {
                stage: stage.id.clone(),
                rule_id: rule.id.clone(),
                effect: rule.effect,
                reason_codes: rule.reason_codes.clone(),
            });
            if rule.effect == Effect::Query {
                queries.push(QueryPrompt {
                    rule_id: rule.id.clone(),
                    prompt: rule.prompt.clone().unwrap_or_default(),
                });
            }
        }
    }

    let verdict = matched
        .iter()
        .map(|m| m.effect)
        .max_by_key(|e| e.severity())
        .map(Effect::verdict)
        .unwrap_or(match mode {
            Mode::Enforce => Verdict::Allow,
            Mode::Advisory => Verdict::Query,
        });

    let mut reason_codes: Vec<String> = Vec::new();
    for m in &matched {
        for code in &m.reason_codes {
            if !reason_codes.contains(code) {
                reason_codes.push(code.clone());
            }
        }
    }

    Evaluation { verdict, reason_codes, matched_rules: matched, queries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn undefined_path_resolves_to_null() {
        let p = Predicate::Cmp {
            field: "action.missing".into(),
            op: CmpOp::Eq,
            value: Value::Null,
        };
        assert!(p.eval(&json!({"action": {}})));
    }

    #[test]
    fn ordered_comparison_with_null_is_false() {
        let p = Predicate::Cmp { field: "amount".into(), op: CmpOp::Gte, value: json!(5) };
        assert!(!p.eval(&json!({})));
        assert!(!p.eval(&json!({"amount": null})));
        assert!(p.eval(&json!({"amount": 7})));
    }

    #[test]
    fn in_requires_array_literal() {
        let p = Predicate::Cmp {
            field: "action.type".into(),
            op: CmpOp::In,
            value: json!(["a", "b"]),
        };
        assert!(p.eval(&json!({"action": {"type": "b"}})));
        assert!(!p.eval(&json!({"action": {"type": "c"}})));
        let scalar = Predicate::Cmp { field: "x".into(), op: CmpOp::In, value: json!("a") };
        assert!(!scalar.eval(&json!({"x": "a"})));
    }

    #[test]
    fn combinators_compose() {
        let p = Predicate::All {
            all: vec![
                Predicate::Cmp { field: "a".into(), op: CmpOp::Eq, value: json!(1) },
                Predicate::Not {
                    not: Box::new(Predicate::Cmp {
                        field: "b".into(),
                        op: CmpOp::Eq,
                        value: json!(2),
                    }),
                },
            ],
        };
        assert!(p.eval(&json!({"a": 1, "b": 3})));
        assert!(!p.eval(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn predicate_yaml_shapes_deserialize() {
        let y = r#"
all:
  - field: action.type
    op: eq
    value: support.refund
  - any:
      - field: normalized.amount_usd
        op: gte
        value: 500
      - not:
          field: evidence.ticket_id
          op: ne
"#;
        let p: Predicate = serde_yaml::from_str(y).unwrap();
        assert!(matches!(p, Predicate::All { .. }));
    }
}
