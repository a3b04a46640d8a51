//! Relational adapter over a libSQL database (local file or remote Turso).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Row};

use super::DestinationAdapter;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Destination, EntityType, Payload, Record, RecordId};
use crate::util::Timestamp;

const RECORD_COLUMNS: &str =
    "id, natural_key, payload, created_at, updated_at, last_activity_at, soft_deleted";

/// Adapter storing each entity type in its own table.
pub struct SqlAdapter {
    destination: Destination,
    db: Arc<Database>,
    conn: Connection,
}

impl SqlAdapter {
    /// Create an adapter on a dedicated connection to `db`.
    pub fn new(destination: Destination, db: Arc<Database>) -> Result<Self> {
        let conn = db.connect()?;
        Ok(Self {
            destination,
            db,
            conn,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Record>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn insert(&self, entity: EntityType, record: &Record) -> Result<RecordId> {
        let payload = serde_json::to_string(&record.payload)?;
        let sql = format!(
            "INSERT INTO {} (natural_key, payload, created_at, updated_at, last_activity_at, soft_deleted)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
            entity.as_str()
        );

        let write_failure =
            |error: libsql::Error| Error::from_write_failure(error, entity, &record.natural_key);
        let mut rows = self
            .conn
            .query(
                &sql,
                libsql::params![
                    record.natural_key.as_str(),
                    payload,
                    record.created_at,
                    record.updated_at,
                    record.last_activity_at,
                    i64::from(record.soft_deleted)
                ],
            )
            .await
            .map_err(write_failure)?;
        let row = rows
            .next()
            .await
            .map_err(write_failure)?
            .ok_or_else(|| Error::Database("insert returned no id".into()))?;

        Ok(RecordId::from(row.get::<i64>(0)?))
    }

    async fn update(&self, entity: EntityType, record: &Record, id: &RecordId) -> Result<RecordId> {
        let payload = serde_json::to_string(&record.payload)?;
        let sql = format!(
            "UPDATE {} SET natural_key = ?, payload = ?, created_at = ?, updated_at = ?,
                last_activity_at = ?, soft_deleted = ?
             WHERE id = ?",
            entity.as_str()
        );

        let changed = self
            .conn
            .execute(
                &sql,
                libsql::params![
                    record.natural_key.as_str(),
                    payload,
                    record.created_at,
                    record.updated_at,
                    record.last_activity_at,
                    i64::from(record.soft_deleted),
                    id.as_i64()?
                ],
            )
            .await
            .map_err(|error| Error::from_write_failure(error, entity, &record.natural_key))?;

        if changed == 0 {
            return Err(Error::NotFound(format!(
                "{entity} row {id} on {}",
                self.destination
            )));
        }
        Ok(id.clone())
    }
}

#[async_trait]
impl DestinationAdapter for SqlAdapter {
    fn destination(&self) -> Destination {
        self.destination
    }

    async fn ping(&self) -> Result<()> {
        let mut rows = self
            .conn
            .query("SELECT 1", ())
            .await
            .map_err(|error| Error::Unreachable {
                destination: self.destination,
                reason: error.to_string(),
            })?;
        rows.next().await.map_err(|error| Error::Unreachable {
            destination: self.destination,
            reason: error.to_string(),
        })?;
        Ok(())
    }

    async fn fetch_changed_since(
        &self,
        entity: EntityType,
        cursor: Timestamp,
    ) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {}
             WHERE updated_at > ?1 OR created_at > ?1 OR last_activity_at > ?1
             ORDER BY updated_at, id",
            entity.as_str()
        );
        self.query_records(&sql, [cursor]).await
    }

    async fn fetch_all_keys(&self, entity: EntityType) -> Result<BTreeMap<String, RecordId>> {
        let sql = format!("SELECT natural_key, id FROM {}", entity.as_str());
        let mut rows = self.conn.query(&sql, ()).await?;
        let mut keys = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            keys.insert(row.get::<String>(0)?, RecordId::from(row.get::<i64>(1)?));
        }
        Ok(keys)
    }

    async fn find_by_natural_key(
        &self,
        entity: EntityType,
        natural_key: &str,
    ) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE natural_key = ?",
            entity.as_str()
        );
        Ok(self.query_records(&sql, [natural_key]).await?.pop())
    }

    async fn find_by_id(&self, entity: EntityType, id: &RecordId) -> Result<Option<Record>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?", entity.as_str());
        Ok(self.query_records(&sql, [id.as_i64()?]).await?.pop())
    }

    async fn fetch_by_key_prefix(&self, entity: EntityType, prefix: &str) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {}
             WHERE substr(natural_key, 1, length(?1)) = ?1
             ORDER BY natural_key",
            entity.as_str()
        );
        self.query_records(&sql, [prefix]).await
    }

    async fn upsert(
        &self,
        entity: EntityType,
        record: &Record,
        existing_id: Option<&RecordId>,
    ) -> Result<RecordId> {
        record.validate()?;
        match existing_id {
            Some(id) => self.update(entity, record, id).await,
            None => self.insert(entity, record).await,
        }
    }

    async fn delete(&self, entity: EntityType, natural_key: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE natural_key = ?", entity.as_str());
        self.conn.execute(&sql, [natural_key]).await?;
        Ok(())
    }
}

fn row_to_record(row: &Row) -> Result<Record> {
    let payload: String = row.get(2)?;
    let payload: Payload = if payload.trim().is_empty() {
        Payload::new()
    } else {
        serde_json::from_str(&payload)?
    };

    Ok(Record {
        id: RecordId::from(row.get::<i64>(0)?),
        natural_key: row.get(1)?,
        payload,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        last_activity_at: row.get(5)?,
        soft_deleted: row.get::<i64>(6)? != 0,
    })
}
