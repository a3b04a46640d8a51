//! Object-storage adapter for the BACKUP destination.
//!
//! Each record is one JSON object at
//! `<prefix>/records/<entity>/<urlencoded natural key>.json`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::DestinationAdapter;
use crate::error::{Error, Result};
use crate::models::{Destination, EntityType, Record, RecordId};
use crate::storage::BlobStore;
use crate::util::Timestamp;

const RECORD_CONTENT_TYPE: &str = "application/json";

pub struct ObjectAdapter {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl ObjectAdapter {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn entity_dir(&self, entity: EntityType) -> String {
        format!("{}/records/{}/", self.prefix, entity.as_str())
    }

    fn object_key(&self, entity: EntityType, natural_key: &str) -> String {
        format!(
            "{}{}.json",
            self.entity_dir(entity),
            urlencoding::encode(natural_key)
        )
    }

    async fn read(&self, key: &str) -> Result<Option<Record>> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, entity: EntityType, record: &Record) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store
            .put(
                &self.object_key(entity, &record.natural_key),
                &bytes,
                Some(RECORD_CONTENT_TYPE),
            )
            .await
    }

    /// Every stored record of `entity`, skipping objects that fail to decode.
    async fn read_all(&self, entity: EntityType) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for key in self.store.list(&self.entity_dir(entity)).await? {
            if !key.ends_with(".json") {
                continue;
            }
            match self.read(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(Error::Serialization(error)) => {
                    tracing::warn!(key = %key, "Skipping undecodable backup object: {error}");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DestinationAdapter for ObjectAdapter {
    fn destination(&self) -> Destination {
        Destination::Backup
    }

    async fn ping(&self) -> Result<()> {
        self.store.ping().await.map_err(|error| Error::Unreachable {
            destination: Destination::Backup,
            reason: error.to_string(),
        })
    }

    async fn fetch_changed_since(
        &self,
        entity: EntityType,
        cursor: Timestamp,
    ) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self
            .read_all(entity)
            .await?
            .into_iter()
            .filter(|record| record.changed_since(cursor))
            .collect();
        records.sort_by(|a, b| a.updated_at.total_cmp(&b.updated_at));
        Ok(records)
    }

    async fn fetch_all_keys(&self, entity: EntityType) -> Result<BTreeMap<String, RecordId>> {
        Ok(self
            .read_all(entity)
            .await?
            .into_iter()
            .map(|record| (record.natural_key, record.id))
            .collect())
    }

    async fn find_by_natural_key(
        &self,
        entity: EntityType,
        natural_key: &str,
    ) -> Result<Option<Record>> {
        self.read(&self.object_key(entity, natural_key)).await
    }

    async fn fetch_by_key_prefix(&self, entity: EntityType, prefix: &str) -> Result<Vec<Record>> {
        let listing_prefix = format!("{}{}", self.entity_dir(entity), urlencoding::encode(prefix));
        let mut records = Vec::new();
        for key in self.store.list(&listing_prefix).await? {
            if let Some(record) = self.read(&key).await? {
                if record.natural_key.starts_with(prefix) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(records)
    }

    async fn upsert(
        &self,
        entity: EntityType,
        record: &Record,
        existing_id: Option<&RecordId>,
    ) -> Result<RecordId> {
        record.validate()?;
        let current = self.find_by_natural_key(entity, &record.natural_key).await?;

        let id = match (existing_id, current) {
            (None, Some(_)) => {
                return Err(Error::UniqueViolation {
                    entity,
                    natural_key: record.natural_key.clone(),
                });
            }
            (None, None) => RecordId::new(Uuid::now_v7().to_string()),
            (Some(id), Some(current)) if &current.id == id => {
                if current.same_content(record) {
                    return Ok(current.id);
                }
                current.id
            }
            (Some(_), Some(_)) => {
                return Err(Error::UniqueViolation {
                    entity,
                    natural_key: record.natural_key.clone(),
                });
            }
            (Some(id), None) => {
                return Err(Error::NotFound(format!(
                    "{entity} object {id} under key '{}'",
                    record.natural_key
                )));
            }
        };

        self.write(entity, &record.for_target(id.clone())).await?;
        Ok(id)
    }

    async fn delete(&self, entity: EntityType, natural_key: &str) -> Result<()> {
        self.store.delete(&self.object_key(entity, natural_key)).await
    }
}
