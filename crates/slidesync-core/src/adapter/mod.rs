//! Destination adapters: one uniform record interface per concrete store.

mod object;
mod sql;
mod timeout;

pub use object::ObjectAdapter;
pub use sql::SqlAdapter;
pub use timeout::TimeoutAdapter;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{Destination, EntityType, Record, RecordId};
use crate::util::Timestamp;
use crate::Result;

/// Shared handle to an adapter.
pub type SharedAdapter = Arc<dyn DestinationAdapter>;

/// Record operations the reconciler needs from a store.
///
/// Every mutating call commits on its own; a failure never rolls back
/// records already written in the same pass.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Which destination this adapter serves.
    fn destination(&self) -> Destination;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;

    /// Records with any timestamp strictly after `cursor`.
    async fn fetch_changed_since(&self, entity: EntityType, cursor: Timestamp)
        -> Result<Vec<Record>>;

    /// Every natural key with its store-local id.
    async fn fetch_all_keys(&self, entity: EntityType) -> Result<BTreeMap<String, RecordId>>;

    /// Point lookup by natural key.
    async fn find_by_natural_key(&self, entity: EntityType, natural_key: &str)
        -> Result<Option<Record>>;

    /// Point lookup by store-local id.
    ///
    /// The default enumerates keys; stores with an id index override it.
    async fn find_by_id(&self, entity: EntityType, id: &RecordId) -> Result<Option<Record>> {
        let keys = self.fetch_all_keys(entity).await?;
        let Some(key) = keys
            .into_iter()
            .find_map(|(key, found)| (&found == id).then_some(key))
        else {
            return Ok(None);
        };
        Ok(self
            .find_by_natural_key(entity, &key)
            .await?
            .filter(|record| &record.id == id))
    }

    /// Records whose natural key starts with `prefix`.
    async fn fetch_by_key_prefix(&self, entity: EntityType, prefix: &str) -> Result<Vec<Record>>;

    /// Write `record` and return the id it has in this store.
    ///
    /// With `existing_id == None` this is a strict insert that fails with
    /// [`crate::Error::UniqueViolation`] when the natural key is taken.
    /// Otherwise the row with that id is updated in place.
    async fn upsert(
        &self,
        entity: EntityType,
        record: &Record,
        existing_id: Option<&RecordId>,
    ) -> Result<RecordId>;

    /// Hard delete by natural key. Deleting a missing key succeeds.
    async fn delete(&self, entity: EntityType, natural_key: &str) -> Result<()>;
}
