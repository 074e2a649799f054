//! Lumyn core primitives and shared seams.

#![deny(unsafe_code)]

/// Version of the Lumyn engine, stamped into every decision record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ids {
    //! Id and clock seams: ULID generation, injectable time.

    use chrono::{DateTime, SecondsFormat, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};
    use ulid::Ulid;

    /// Clock abstraction so record timestamps are injectable in tests.
    pub trait Clock: Send + Sync {
        /// Current instant in UTC.
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by system time.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Frozen clock for tests and replay.
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Record timestamp format: UTC ISO-8601 with millisecond precision.
    pub fn format_ts(t: DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Opaque id source for decisions, events, and memory items.
    pub trait IdGenerator: Send + Sync {
        /// Produce a fresh opaque id.
        fn next_id(&self) -> String;
    }

    /// Production generator emitting ULIDs.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UlidGenerator;

    impl IdGenerator for UlidGenerator {
        fn next_id(&self) -> String {
            Ulid::new().to_string()
        }
    }

    /// Deterministic generator for tests: `<prefix>-1`, `<prefix>-2`, ...
    #[derive(Debug)]
    pub struct SequenceGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequenceGenerator {
        /// Start a sequence at 1 with the given prefix.
        pub fn new(prefix: impl Into<String>) -> Self {
            Self { prefix: prefix.into(), next: AtomicU64::new(1) }
        }
    }

    impl IdGenerator for SequenceGenerator {
        fn next_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            format!("{}-{}", self.prefix, n)
        }
    }

}

pub mod canon {
    //! Canonical JSON and SHA-256 digests, the reproducibility anchors.
    //!
    //! `serde_json` already provides the two properties canonical form needs:
    //! object keys serialize sorted (`Value`'s map is a BTreeMap) and numbers
    //! print in shortest round-trip form. Canonical JSON is therefore compact
    //! serialization of a `Value`; the tests pin both properties so a
    //! dependency change cannot silently break replay.

    use serde_json::Value;
    use sha2::{Digest, Sha256};

    /// Serialize a JSON value canonically: sorted object keys, no
    /// insignificant whitespace, arrays in source order, UTF-8 without BOM.
    pub fn canonical_json(value: &Value) -> String {
        serde_json::to_string(value).expect("serializing a serde_json::Value cannot fail")
    }

    /// Lowercase hex SHA-256 of raw bytes.
    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Digest of the canonical JSON of a value.
    pub fn digest_value(value: &Value) -> String {
        sha256_hex(canonical_json(value).as_bytes())
    }

}

pub mod schemas {
    //! Embedded Draft 2020-12 schema validation for the v0 documents.

    use jsonschema::{Draft, JSONSchema};
    use once_cell::sync::Lazy;
    use serde_json::Value;
    use std::collections::BTreeSet;

    static REQUEST_SRC: &str = include_str!("../../../schemas/decision_request.v0.schema.json");
    static RECORD_SRC: &str = include_str!("../../../schemas/decision_record.v0.schema.json");
    static POLICY_SRC: &str = include_str!("../../../schemas/policy.v0.schema.json");
    static REASON_CODES_SRC: &str = include_str!("../../../schemas/reason_codes.v0.json");

    fn compile(src: &str) -> JSONSchema {
        let schema: Value = serde_json::from_str(src).expect("invalid schema json");
        JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&schema)
            .expect("compile schema")
    }

    static REQUEST: Lazy<JSONSchema> = Lazy::new(|| compile(REQUEST_SRC));
    static RECORD: Lazy<JSONSchema> = Lazy::new(|| compile(RECORD_SRC));
    static POLICY: Lazy<JSONSchema> = Lazy::new(|| compile(POLICY_SRC));

    static REASON_CODES: Lazy<BTreeSet<String>> = Lazy::new(|| {
        let doc: Value =
            serde_json::from_str(REASON_CODES_SRC).expect("invalid reason code registry json");
        doc.get("codes")
            .and_then(Value::as_array)
            .expect("reason code registry missing codes")
            .iter()
            .filter_map(|c| c.get("code").and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    });

    fn validate(compiled: &JSONSchema, v: &Value) -> Result<(), String> {
        match compiled.validate(v) {
            Ok(_) => Ok(()),
            Err(iter) => {
                let msg = iter.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
                Err(msg)
            }
        }
    }

    /// Validate a decision request document.
    pub fn validate_request(v: &Value) -> Result<(), String> {
        validate(&REQUEST, v)
    }

    /// Validate a decision record document.
    pub fn validate_record(v: &Value) -> Result<(), String> {
        validate(&RECORD, v)
    }

    /// Validate a parsed policy document.
    pub fn validate_policy(v: &Value) -> Result<(), String> {
        validate(&POLICY, v)
    }

    /// Registry of reason codes a policy rule may reference.
    pub fn reason_codes() -> &'static BTreeSet<String> {
        &REASON_CODES
    }

}
