//! Whole-database snapshots kept in object storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::BlobStore;
use crate::db::Database;
use crate::util::{unix_millis_now, Timestamp};
use crate::{Error, Result};

const SNAPSHOT_CONTENT_TYPE: &str = "application/vnd.sqlite3";

/// A snapshot object and the time it was taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub taken_at: Timestamp,
}

/// Publishes, locates and prunes `<prefix>/snapshots/<millis>.db` objects.
#[derive(Clone)]
pub struct SnapshotArchive {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl SnapshotArchive {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn directory(&self) -> String {
        format!("{}/snapshots/", self.prefix)
    }

    /// Copy `db` into a new snapshot object.
    pub async fn publish(&self, db: &Database) -> Result<SnapshotInfo> {
        let scratch = tempfile::tempdir()?;
        let file = scratch.path().join("snapshot.db");
        db.snapshot_to(&file).await?;
        let bytes = tokio::fs::read(&file).await?;

        let millis = unix_millis_now();
        let key = format!("{}{millis:013}.db", self.directory());
        self.store
            .put(&key, &bytes, Some(SNAPSHOT_CONTENT_TYPE))
            .await?;

        tracing::info!(key = %key, bytes = bytes.len(), "Published database snapshot");
        Ok(SnapshotInfo {
            key,
            taken_at: millis_to_ts(millis),
        })
    }

    /// Every snapshot, oldest first.
    pub async fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots: Vec<SnapshotInfo> = self
            .store
            .list(&self.directory())
            .await?
            .into_iter()
            .filter_map(|key| {
                let millis = parse_snapshot_millis(&key)?;
                Some(SnapshotInfo {
                    key,
                    taken_at: millis_to_ts(millis),
                })
            })
            .collect();
        snapshots.sort_by(|a, b| a.taken_at.total_cmp(&b.taken_at));
        Ok(snapshots)
    }

    pub async fn latest(&self) -> Result<Option<SnapshotInfo>> {
        Ok(self.list().await?.pop())
    }

    /// Download the newest snapshot into `dir`. Returns `None` when the
    /// archive is empty.
    pub async fn download_latest(&self, dir: &Path) -> Result<Option<(SnapshotInfo, PathBuf)>> {
        let Some(info) = self.latest().await? else {
            return Ok(None);
        };
        let bytes = self
            .store
            .get(&info.key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", info.key)))?;

        let path = dir.join("snapshot.db");
        tokio::fs::write(&path, &bytes).await?;
        tracing::debug!(key = %info.key, path = %path.display(), "Downloaded snapshot");
        Ok(Some((info, path)))
    }

    /// Delete all but the newest `retain` snapshots. Returns how many were removed.
    pub async fn prune(&self, retain: usize) -> Result<usize> {
        let snapshots = self.list().await?;
        let excess = snapshots.len().saturating_sub(retain.max(1));
        for snapshot in &snapshots[..excess] {
            self.store.delete(&snapshot.key).await?;
            tracing::debug!(key = %snapshot.key, "Pruned snapshot");
        }
        Ok(excess)
    }
}

fn parse_snapshot_millis(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next()?;
    let digits = name.strip_suffix(".db")?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[allow(clippy::cast_precision_loss)]
fn millis_to_ts(millis: i64) -> Timestamp {
    millis as f64 / 1000.0
}
