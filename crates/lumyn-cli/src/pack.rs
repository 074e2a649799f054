//! Decision pack (ZIP) writing and replay validation.
//!
//! A pack is self-describing: the record, the redacted request view it was
//! decided on, and the policy text. Replay recomputes `policy_hash` and
//! `inputs_digest` from the pack members and refuses to validate when either
//! disagrees with the record.

use serde_json::Value;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use lumyn_core::canon::canonical_json;
use lumyn_core::schemas;

use crate::{die, CliError};

/// Record member name inside a pack.
pub(crate) const RECORD_MEMBER: &str = "decision_record.json";
/// Redacted request member name.
pub(crate) const REQUEST_MEMBER: &str = "request.json";
/// Policy text member name.
pub(crate) const POLICY_MEMBER: &str = "policy.yml";

/// Write a decision pack for `record` with its policy snapshot text.
pub(crate) fn write_pack(out: &Path, record: &Value, policy_text: &str) -> Result<(), CliError> {
    let request = record.get("request").cloned().unwrap_or(Value::Null);
    let file = File::create(out)?;
    let mut writer = ZipWriter::new(file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(RECORD_MEMBER, opts)?;
    writer.write_all(canonical_json(record).as_bytes())?;
    writer.start_file(REQUEST_MEMBER, opts)?;
    writer.write_all(canonical_json(&request).as_bytes())?;
    writer.start_file(POLICY_MEMBER, opts)?;
    writer.write_all(policy_text.as_bytes())?;
    writer.finish()?;
    Ok(())
}

/// Validated summary of a replayed pack.
#[derive(Debug)]
pub(crate) struct ReplayOutcome {
    /// Record id.
    pub decision_id: String,
    /// Recorded verdict.
    pub verdict: String,
    /// Recorded reason codes.
    pub reason_codes: Vec<String>,
    /// Recomputed (and matching) policy hash.
    pub policy_hash: String,
    /// Context digest carried by the request.
    pub context_digest: String,
    /// Recomputed (and matching) inputs digest.
    pub inputs_digest: String,
}

/// Validate a pack: schemas first, then the digest chain.
pub(crate) fn replay_pack(path: &Path) -> Result<ReplayOutcome, CliError> {
    if !path.exists() {
        return Err(die(format!("pack not found: {}", path.display())));
    }
    let is_zip = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    if !is_zip {
        return Err(die("pack path must be a .zip file"));
    }

    let mut archive = ZipArchive::new(File::open(path)?)?;
    let record = parse_member(&read_member(&mut archive, RECORD_MEMBER)?, RECORD_MEMBER)?;
    let request = parse_member(&read_member(&mut archive, REQUEST_MEMBER)?, REQUEST_MEMBER)?;
    let policy_text = read_member(&mut archive, POLICY_MEMBER)?;

    schemas::validate_record(&record).map_err(|e| die(format!("{RECORD_MEMBER}: {e}")))?;
    schemas::validate_request(&request).map_err(|e| die(format!("{REQUEST_MEMBER}: {e}")))?;

    let loaded = policy::load_policy_str(&policy_text)?;
    let expected_hash =
        record.pointer("/policy/policy_hash").and_then(Value::as_str).unwrap_or_default();
    if expected_hash != loaded.policy_hash {
        return Err(die(format!(
            "policy_hash mismatch: record={expected_hash} computed={}",
            loaded.policy_hash
        )));
    }

    let normalized = engine::normalize(&request).map_err(die)?;
    let computed_digest = engine::compute_inputs_digest(&request, &normalized);
    let recorded_digest =
        record.pointer("/determinism/inputs_digest").and_then(Value::as_str).unwrap_or_default();
    if recorded_digest != computed_digest {
        return Err(die(format!(
            "inputs_digest mismatch: record={recorded_digest} computed={computed_digest}"
        )));
    }

    Ok(ReplayOutcome {
        decision_id: record
            .get("decision_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        verdict: record
            .pointer("/evaluation/verdict")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        reason_codes: record
            .pointer("/evaluation/reason_codes")
            .and_then(Value::as_array)
            .map(|codes| {
                codes.iter().filter_map(Value::as_str).map(str::to_owned).collect()
            })
            .unwrap_or_default(),
        policy_hash: loaded.policy_hash,
        context_digest: request
            .pointer("/context/digest")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        inputs_digest: computed_digest,
    })
}

fn read_member(archive: &mut ZipArchive<File>, name: &str) -> Result<String, CliError> {
    let mut member =
        archive.by_name(name).map_err(|_| die(format!("missing {name} in pack")))?;
    let mut buf = String::new();
    member.read_to_string(&mut buf)?;
    Ok(buf)
}

fn parse_member(raw: &str, name: &str) -> Result<Value, CliError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| die(format!("{name} is not valid json: {e}")))?;
    if !value.is_object() {
        return Err(die(format!("{name} must be a JSON object")));
    }
    Ok(value)
}
