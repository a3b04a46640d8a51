//! Per-call timeout decorator.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{DestinationAdapter, SharedAdapter};
use crate::error::{Error, Result};
use crate::models::{Destination, EntityType, Record, RecordId};
use crate::util::Timestamp;

/// Bounds every call on the wrapped adapter by `limit`.
pub struct TimeoutAdapter {
    inner: SharedAdapter,
    limit: Duration,
}

impl TimeoutAdapter {
    pub fn new(inner: SharedAdapter, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T: Send>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::time::timeout(self.limit, call)
            .await
            .map_err(|_| Error::Timeout {
                destination: self.inner.destination(),
                operation,
            })?
    }
}

#[async_trait]
impl DestinationAdapter for TimeoutAdapter {
    fn destination(&self) -> Destination {
        self.inner.destination()
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", self.inner.ping()).await
    }

    async fn fetch_changed_since(
        &self,
        entity: EntityType,
        cursor: Timestamp,
    ) -> Result<Vec<Record>> {
        self.bounded(
            "fetch_changed_since",
            self.inner.fetch_changed_since(entity, cursor),
        )
        .await
    }

    async fn fetch_all_keys(&self, entity: EntityType) -> Result<BTreeMap<String, RecordId>> {
        self.bounded("fetch_all_keys", self.inner.fetch_all_keys(entity))
            .await
    }

    async fn find_by_natural_key(
        &self,
        entity: EntityType,
        natural_key: &str,
    ) -> Result<Option<Record>> {
        self.bounded(
            "find_by_natural_key",
            self.inner.find_by_natural_key(entity, natural_key),
        )
        .await
    }

    async fn find_by_id(&self, entity: EntityType, id: &RecordId) -> Result<Option<Record>> {
        self.bounded("find_by_id", self.inner.find_by_id(entity, id))
            .await
    }

    async fn fetch_by_key_prefix(&self, entity: EntityType, prefix: &str) -> Result<Vec<Record>> {
        self.bounded(
            "fetch_by_key_prefix",
            self.inner.fetch_by_key_prefix(entity, prefix),
        )
        .await
    }

    async fn upsert(
        &self,
        entity: EntityType,
        record: &Record,
        existing_id: Option<&RecordId>,
    ) -> Result<RecordId> {
        self.bounded("upsert", self.inner.upsert(entity, record, existing_id))
            .await
    }

    async fn delete(&self, entity: EntityType, natural_key: &str) -> Result<()> {
        self.bounded("delete", self.inner.delete(entity, natural_key))
            .await
    }
}
