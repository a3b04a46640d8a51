//! Append-only conflict ledger

use std::collections::BTreeMap;

use libsql::{Connection, Row, Value};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{ConflictEntry, ConflictReason, EntityType, NewConflict, RecordId};
use crate::util::{now_ts, Timestamp};

const SELECT_COLUMNS: &str = "id, entity_type, source_destination, target_destination, source_id, \
     target_id, natural_key_attempted, reason, payload_snapshot, created_at, resolved, resolved_at";

/// Narrowing options for [`ConflictLedger::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConflictFilter {
    pub entity_type: Option<EntityType>,
    pub reason: Option<ConflictReason>,
    /// Include entries an operator has already resolved
    #[serde(default)]
    pub include_resolved: bool,
    pub limit: Option<u32>,
}

/// Durable record of every collision, integrity failure and id mismatch
/// the reconciler refused to apply.
#[derive(Clone)]
pub struct ConflictLedger {
    conn: Connection,
}

impl ConflictLedger {
    /// Create a new ledger with the given connection
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Append a conflict and return its ledger id.
    ///
    /// An unresolved entry describing the same collision (entity, route, key
    /// and reason) is reused instead of growing the ledger on every cycle.
    pub async fn append(&self, conflict: &NewConflict) -> Result<i64> {
        let snapshot = serde_json::to_string(&conflict.payload_snapshot)?;
        let source_id = optional_id(conflict.source_id.as_ref());
        let target_id = optional_id(conflict.target_id.as_ref());

        let mut rows = self
            .conn
            .query(
                "INSERT INTO sync_conflicts (entity_type, source_destination, target_destination,
                    source_id, target_id, natural_key_attempted, reason, payload_snapshot, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                 WHERE NOT EXISTS (
                    SELECT 1 FROM sync_conflicts
                    WHERE resolved = 0 AND entity_type = ?1 AND source_destination = ?2
                      AND target_destination = ?3 AND natural_key_attempted = ?6 AND reason = ?7
                 )
                 RETURNING id",
                libsql::params![
                    conflict.entity_type.as_str(),
                    conflict.source_destination.as_str(),
                    conflict.target_destination.as_str(),
                    source_id,
                    target_id,
                    conflict.natural_key_attempted.as_str(),
                    conflict.reason.as_str(),
                    snapshot,
                    now_ts()
                ],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            let id: i64 = row.get(0)?;
            tracing::warn!(
                conflict_id = id,
                entity = %conflict.entity_type,
                source = %conflict.source_destination,
                target = %conflict.target_destination,
                natural_key = %conflict.natural_key_attempted,
                reason = %conflict.reason,
                "Recorded sync conflict"
            );
            return Ok(id);
        }
        drop(rows);

        let mut rows = self
            .conn
            .query(
                "SELECT id FROM sync_conflicts
                 WHERE resolved = 0 AND entity_type = ? AND source_destination = ?
                   AND target_destination = ? AND natural_key_attempted = ? AND reason = ?
                 ORDER BY id LIMIT 1",
                libsql::params![
                    conflict.entity_type.as_str(),
                    conflict.source_destination.as_str(),
                    conflict.target_destination.as_str(),
                    conflict.natural_key_attempted.as_str(),
                    conflict.reason.as_str()
                ],
            )
            .await?;
        let row = rows.next().await?.ok_or_else(|| {
            Error::Database("conflict neither inserted nor found as pending".into())
        })?;
        let id: i64 = row.get(0)?;
        tracing::debug!(conflict_id = id, "Conflict already pending");
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ConflictEntry>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
                [id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_entry(&row)?)),
            None => Ok(None),
        }
    }

    /// List entries, newest first.
    pub async fn list(&self, filter: &ConflictFilter) -> Result<Vec<ConflictEntry>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM sync_conflicts WHERE 1 = 1");
        let mut params: Vec<Value> = Vec::new();

        if !filter.include_resolved {
            sql.push_str(" AND resolved = 0");
        }
        if let Some(entity) = filter.entity_type {
            sql.push_str(" AND entity_type = ?");
            params.push(Value::Text(entity.as_str().to_string()));
        }
        if let Some(reason) = filter.reason {
            sql.push_str(" AND reason = ?");
            params.push(Value::Text(reason.as_str().to_string()));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(i64::from(limit)));
        }

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(params))
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM sync_conflicts WHERE resolved = 0", ())
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Pending entries per entity type.
    pub async fn pending_counts(&self) -> Result<BTreeMap<EntityType, u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, COUNT(*) FROM sync_conflicts
                 WHERE resolved = 0 GROUP BY entity_type",
                (),
            )
            .await?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let entity: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.insert(entity.parse()?, u64::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }

    /// Mark an entry resolved. Resolving twice keeps the first resolution time.
    pub async fn resolve(&self, id: i64) -> Result<ConflictEntry> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET resolved = 1, resolved_at = ?
                 WHERE id = ? AND resolved = 0",
                libsql::params![now_ts(), id],
            )
            .await?;

        let entry = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        if changed > 0 {
            tracing::info!(
                conflict_id = id,
                entity = %entry.entity_type,
                natural_key = %entry.natural_key_attempted,
                "Conflict resolved"
            );
        }
        Ok(entry)
    }
}

fn optional_id(id: Option<&RecordId>) -> Value {
    id.map_or(Value::Null, |id| Value::Text(id.as_str().to_string()))
}

fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        Value::Integer(value) => Ok(Some(value.to_string())),
        other => Err(Error::Database(format!(
            "unexpected value in column {idx}: {other:?}"
        ))),
    }
}

fn optional_real(row: &Row, idx: i32) -> Result<Option<Timestamp>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Real(value) => Ok(Some(value)),
        #[allow(clippy::cast_precision_loss)]
        Value::Integer(value) => Ok(Some(value as f64)),
        other => Err(Error::Database(format!(
            "unexpected value in column {idx}: {other:?}"
        ))),
    }
}

fn row_to_entry(row: &Row) -> Result<ConflictEntry> {
    let entity: String = row.get(1)?;
    let source: String = row.get(2)?;
    let target: String = row.get(3)?;
    let reason: String = row.get(7)?;
    let snapshot: String = row.get(8)?;

    Ok(ConflictEntry {
        id: row.get(0)?,
        entity_type: entity.parse()?,
        source_destination: source.parse()?,
        target_destination: target.parse()?,
        source_id: optional_text(row, 4)?.map(RecordId::new),
        target_id: optional_text(row, 5)?.map(RecordId::new),
        natural_key_attempted: row.get(6)?,
        reason: reason.parse()?,
        payload_snapshot: serde_json::from_str(&snapshot)?,
        created_at: row.get(9)?,
        resolved: row.get::<i64>(10)? != 0,
        resolved_at: optional_real(row, 11)?,
    })
}
