//! Lumyn durable store.
//!
//! Single-node SQLite store behind a [`Store`] trait so the engine can be
//! exercised against fault-injecting doubles. Five logical tables: policy
//! snapshots (content-addressed by hash), decision records, the idempotency
//! index, memory items, and decision events. Records and events are never
//! mutated after insert.
//!
//! The error split matters to callers: [`StoreError::Integrity`] is a unique
//! constraint violation (the orchestrator resolves it through the idempotency
//! index), while [`StoreError::Unavailable`] covers every I/O- or
//! engine-shaped failure (the orchestrator degrades to an ABSTAIN record).
//! The record insert and its idempotency row land in one transaction: either
//! both persist or neither does.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use lumyn_core::canon::canonical_json;
use lumyn_core::ids::{format_ts, IdGenerator, UlidGenerator};

/// Tenant key used when a request carries no `tenant_id`.
pub const GLOBAL_TENANT: &str = "__global__";

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation (duplicate idempotency key or primary key).
    #[error("integrity: {0}")]
    Integrity(String),
    /// Any other engine or I/O failure.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Referenced decision does not exist.
    #[error("unknown decision: {0}")]
    UnknownDecision(String),
    /// Document shape the store cannot index.
    #[error("invalid document: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Integrity(e.to_string())
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Label attached to a memory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLabel {
    /// The prior action went well.
    Success,
    /// The prior action went badly; feeds the failure-similarity signal.
    Failure,
    /// No outcome signal either way.
    Neutral,
}

impl MemoryLabel {
    fn as_str(self) -> &'static str {
        match self {
            MemoryLabel::Success => "success",
            MemoryLabel::Failure => "failure",
            MemoryLabel::Neutral => "neutral",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "success" => Ok(MemoryLabel::Success),
            "failure" => Ok(MemoryLabel::Failure),
            "neutral" => Ok(MemoryLabel::Neutral),
            other => Err(StoreError::Invalid(format!("unknown memory label '{other}'"))),
        }
    }
}

/// Labeled prior feature vector used for similarity signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Opaque item id.
    pub memory_id: String,
    /// Owning tenant, when scoped.
    pub tenant_id: Option<String>,
    /// Action type this item describes.
    pub action_type: String,
    /// Outcome label.
    pub label: MemoryLabel,
    /// Feature mapping matching the engine's query feature shape.
    pub feature: Value,
    /// Short human summary of the prior outcome.
    pub summary: String,
    /// Insertion timestamp (UTC ISO-8601 ms).
    pub created_at: String,
}

/// Durable storage seam for the decide pipeline.
pub trait Store: Send + Sync {
    /// Idempotent schema migration.
    fn init(&self) -> Result<(), StoreError>;

    /// Upsert a policy snapshot; storing the same hash twice is a no-op.
    fn put_policy_snapshot(
        &self,
        policy_hash: &str,
        policy_id: &str,
        policy_version: &str,
        policy_text: &str,
    ) -> Result<(), StoreError>;

    /// Fetch the raw policy text for a snapshot hash.
    fn get_policy_snapshot_text(&self, policy_hash: &str) -> Result<Option<String>, StoreError>;

    /// Insert a decision record; when the embedded request carries a
    /// `request_id`, the idempotency row is inserted in the same transaction.
    fn put_decision_record(&self, record: &Value) -> Result<(), StoreError>;

    /// Fetch a decision record by id.
    fn get_decision_record(&self, decision_id: &str) -> Result<Option<Value>, StoreError>;

    /// Probe the idempotency index.
    fn get_decision_id_for_request_id(
        &self,
        tenant_key: &str,
        request_id: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Insert a memory item.
    fn put_memory_item(&self, item: &MemoryItem) -> Result<(), StoreError>;

    /// List memory items for an action type, newest first. `tenant_id = None`
    /// matches every tenant.
    fn list_memory_items(
        &self,
        tenant_id: Option<&str>,
        action_type: &str,
        limit: u32,
    ) -> Result<Vec<MemoryItem>, StoreError>;

    /// Append an event to a known decision; returns the new event id.
    fn append_decision_event(
        &self,
        decision_id: &str,
        event_type: &str,
        data: &Value,
    ) -> Result<String, StoreError>;
}

/// SQLite-backed [`Store`]. A single connection serialized behind a mutex;
/// SQLite's own locking covers cross-process writers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    ids: UlidGenerator,
}

const SCHEMA_DDL: &str = "
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS policy_snapshots(
    policy_hash    TEXT PRIMARY KEY,
    policy_id      TEXT NOT NULL,
    policy_version TEXT NOT NULL,
    policy_text    TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS decision_records(
    decision_id TEXT PRIMARY KEY,
    tenant_key  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    record_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS request_idempotency(
    tenant_key  TEXT NOT NULL,
    request_id  TEXT NOT NULL,
    decision_id TEXT NOT NULL,
    PRIMARY KEY (tenant_key, request_id)
);
CREATE TABLE IF NOT EXISTS memory_items(
    memory_id    TEXT PRIMARY KEY,
    tenant_id    TEXT,
    action_type  TEXT NOT NULL,
    label        TEXT NOT NULL,
    feature_json TEXT NOT NULL,
    summary      TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS decision_events(
    event_id    TEXT PRIMARY KEY,
    decision_id TEXT NOT NULL REFERENCES decision_records(decision_id),
    type        TEXT NOT NULL,
    data_json   TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

impl SqliteStore {
    /// Open (or create) a store at `path`, creating parent directories as
    /// needed. Call [`Store::init`] before first use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn), ids: UlidGenerator })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn), ids: UlidGenerator })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }
}

fn record_keys(record: &Value) -> Result<(&str, String, Option<&str>, &str), StoreError> {
    let decision_id = record
        .get("decision_id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Invalid("record missing decision_id".into()))?;
    let created_at = record
        .get("created_at")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Invalid("record missing created_at".into()))?;
    let request = record.get("request").unwrap_or(&Value::Null);
    let tenant_key = request
        .pointer("/subject/tenant_id")
        .and_then(Value::as_str)
        .unwrap_or(GLOBAL_TENANT)
        .to_owned();
    let request_id = request.get("request_id").and_then(Value::as_str);
    Ok((decision_id, tenant_key, request_id, created_at))
}

impl Store for SqliteStore {
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(())
    }

    fn put_policy_snapshot(
        &self,
        policy_hash: &str,
        policy_id: &str,
        policy_version: &str,
        policy_text: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO policy_snapshots(policy_hash, policy_id, policy_version, policy_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(policy_hash) DO NOTHING",
            params![policy_hash, policy_id, policy_version, policy_text, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    fn get_policy_snapshot_text(&self, policy_hash: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let text = conn
            .query_row(
                "SELECT policy_text FROM policy_snapshots WHERE policy_hash = ?1",
                params![policy_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text)
    }

    fn put_decision_record(&self, record: &Value) -> Result<(), StoreError> {
        let (decision_id, tenant_key, request_id, created_at) = record_keys(record)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO decision_records(decision_id, tenant_key, created_at, record_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![decision_id, tenant_key, created_at, canonical_json(record)],
        )?;
        if let Some(request_id) = request_id {
            tx.execute(
                "INSERT INTO request_idempotency(tenant_key, request_id, decision_id)
                 VALUES (?1, ?2, ?3)",
                params![tenant_key, request_id, decision_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_decision_record(&self, decision_id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM decision_records WHERE decision_id = ?1",
                params![decision_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| StoreError::Invalid(format!("stored record is not json: {e}"))),
            None => Ok(None),
        }
    }

    fn get_decision_id_for_request_id(
        &self,
        tenant_key: &str,
        request_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT decision_id FROM request_idempotency
                 WHERE tenant_key = ?1 AND request_id = ?2",
                params![tenant_key, request_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn put_memory_item(&self, item: &MemoryItem) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO memory_items(memory_id, tenant_id, action_type, label, feature_json, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.memory_id,
                item.tenant_id,
                item.action_type,
                item.label.as_str(),
                canonical_json(&item.feature),
                item.summary,
                item.created_at
            ],
        )?;
        Ok(())
    }

    fn list_memory_items(
        &self,
        tenant_id: Option<&str>,
        action_type: &str,
        limit: u32,
    ) -> Result<Vec<MemoryItem>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT memory_id, tenant_id, action_type, label, feature_json, summary, created_at
             FROM memory_items
             WHERE action_type = ?1 AND (?2 IS NULL OR tenant_id = ?2)
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![action_type, tenant_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut items = Vec::new();
        for row in rows {
            let (memory_id, tenant_id, action_type, label, feature_json, summary, created_at) =
                row?;
            items.push(MemoryItem {
                memory_id,
                tenant_id,
                action_type,
                label: MemoryLabel::parse(&label)?,
                feature: serde_json::from_str(&feature_json)
                    .map_err(|e| StoreError::Invalid(format!("stored feature is not json: {e}")))?,
                summary,
                created_at,
            });
        }
        Ok(items)
    }

    fn append_decision_event(
        &self,
        decision_id: &str,
        event_type: &str,
        data: &Value,
    ) -> Result<String, StoreError> {
        let conn = self.lock()?;
        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM decision_records WHERE decision_id = ?1",
                params![decision_id],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(StoreError::UnknownDecision(decision_id.to_owned()));
        }
        let event_id = self.ids.next_id();
        conn.execute(
            "INSERT INTO decision_events(event_id, decision_id, type, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event_id,
                decision_id,
                event_type,
                canonical_json(data),
                format_ts(Utc::now())
            ],
        )?;
        Ok(event_id)
    }
}
