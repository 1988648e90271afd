use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use panemux_types::{
    Error, PaneRecord, RecordKind, Result, SessionRecord, WindowRecord,
};

use crate::store::JournalEntry;

/// Current snapshot document schema version.
///
/// Version 1 predates per-record version counters; its records are
/// forward-migrated with `version: 0`. Documents newer than this are
/// refused rather than guessed at.
pub const SCHEMA_VERSION: u32 = 2;

/// A serialized, versioned copy of all state-manager records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub sessions: Vec<SessionRecord>,
    pub windows: Vec<WindowRecord>,
    pub panes: Vec<PaneRecord>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            sessions: Vec::new(),
            windows: Vec::new(),
            panes: Vec::new(),
        }
    }

    /// Parse a snapshot document, refusing unknown future versions and
    /// forward-migrating recognized older ones.
    pub fn from_json(mut value: serde_json::Value) -> Result<Self> {
        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::storage("snapshot document has no schema_version"))?
            as u32;

        if version > SCHEMA_VERSION {
            return Err(Error::storage(format!(
                "snapshot schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        if version < SCHEMA_VERSION {
            migrate_v1(&mut value);
        }

        serde_json::from_value(value)
            .map_err(|e| Error::storage(format!("malformed snapshot document: {e}")))
    }

    /// Apply one journal entry on top of this snapshot (journal replay).
    pub fn apply(&mut self, entry: &JournalEntry) -> Result<()> {
        match entry.kind {
            RecordKind::Session => apply_one(&mut self.sessions, entry, |r| r.id.to_string()),
            RecordKind::Window => apply_one(&mut self.windows, entry, |r| r.id.to_string()),
            RecordKind::Pane => apply_one(&mut self.panes, entry, |r| r.id.to_string()),
        }
    }
}

fn apply_one<R>(
    records: &mut Vec<R>,
    entry: &JournalEntry,
    id_of: impl Fn(&R) -> String,
) -> Result<()>
where
    R: serde::de::DeserializeOwned,
{
    match &entry.value {
        None => {
            records.retain(|r| id_of(r) != entry.id);
            Ok(())
        }
        Some(value) => {
            let record: R = serde_json::from_value(value.clone())
                .map_err(|e| Error::storage(format!("malformed journal entry: {e}")))?;
            records.retain(|r| id_of(r) != entry.id);
            records.push(record);
            Ok(())
        }
    }
}

/// v1 -> v2: records carried no `version` counter; start them at zero.
fn migrate_v1(value: &mut serde_json::Value) {
    for table in ["sessions", "windows", "panes"] {
        if let Some(records) = value.get_mut(table).and_then(|v| v.as_array_mut()) {
            for record in records {
                if let Some(obj) = record.as_object_mut() {
                    obj.entry("version").or_insert(serde_json::json!(0));
                }
            }
        }
    }
    if let Some(obj) = value.as_object_mut() {
        obj.insert("schema_version".to_string(), serde_json::json!(SCHEMA_VERSION));
    }
}
