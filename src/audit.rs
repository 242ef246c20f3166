//! Append-only audit trail of mutations, plus the field-level diff accumulator
//! every mutating operation uses to describe an update.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulates `old`/`new` pairs for the fields that actually changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    old: Map<String, Value>,
    new: Map<String, Value>,
    empty: bool,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self {
            old: Map::new(),
            new: Map::new(),
            empty: true,
        }
    }

    /// No-op when `old == new`.
    pub fn record<T>(&mut self, field: &str, old: &T, new: &T)
    where
        T: Serialize + PartialEq + ?Sized,
    {
        if old == new {
            return;
        }
        self.old.insert(field.to_string(), to_value(old));
        self.new.insert(field.to_string(), to_value(new));
        self.empty = false;
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn changed_fields(&self) -> impl Iterator<Item = &str> {
        self.new.keys().map(String::as_str)
    }

    /// `{"old": {...}, "new": {...}}`
    pub fn into_detail(self) -> Value {
        let mut detail = Map::new();
        detail.insert("old".into(), Value::Object(self.old));
        detail.insert("new".into(), Value::Object(self.new));
        Value::Object(detail)
    }
}

impl Default for ChangeSet {
    fn default() -> Self {
        Self::new()
    }
}

fn to_value<T: Serialize + ?Sized>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or_else(|e| Value::String(format!("<unserializable: {e}>")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub action: AuditAction,
    pub actor_id: UserId,
    pub object_table: String,
    pub object_id: String,
    pub detail: Value,
    pub timestamp: NaiveDateTime,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        actor_id: UserId,
        object_table: &str,
        object_id: impl ToString,
        detail: Value,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            id: Ulid::new(),
            action,
            actor_id,
            object_table: object_table.to_string(),
            object_id: object_id.to_string(),
            detail,
            timestamp,
        }
    }

    /// An Update entry, or `None` when nothing changed.
    pub fn update(
        actor_id: UserId,
        object_table: &str,
        object_id: impl ToString,
        changes: ChangeSet,
        timestamp: NaiveDateTime,
    ) -> Option<Self> {
        if changes.is_empty() {
            return None;
        }
        Some(Self::new(
            AuditAction::Update,
            actor_id,
            object_table,
            object_id,
            changes.into_detail(),
            timestamp,
        ))
    }

    /// A Create/Delete entry whose detail is the full serialized object.
    pub fn snapshot<T: Serialize>(
        action: AuditAction,
        actor_id: UserId,
        object_table: &str,
        object_id: impl ToString,
        object: &T,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self::new(action, actor_id, object_table, object_id, to_value(object), timestamp)
    }
}

#[derive(Debug)]
pub struct AuditSinkError(pub String);

impl fmt::Display for AuditSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audit sink error: {}", self.0)
    }
}

impl std::error::Error for AuditSinkError {}

/// Destination for audit entries. Callers log failures and carry on.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditSinkError>;
}

/// In-process audit log.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn for_object(&self, object_table: &str, object_id: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.object_table == object_table && e.object_id == object_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditSinkError> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}

/// Audit sink that only emits a tracing event per entry.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditSinkError> {
        tracing::info!(
            action = %entry.action,
            actor = %entry.actor_id,
            table = %entry.object_table,
            object = %entry.object_id,
            detail = %entry.detail,
            "audit"
        );
        Ok(())
    }
}
