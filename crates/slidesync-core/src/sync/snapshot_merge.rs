//! Recovery of backup-only data from the newest object-storage snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use super::outcome::{PassSummary, SyncErrorKind};
use super::policy::AuthoritativeSide;
use super::reconciler::{PassOptions, Reconciler};
use crate::adapter::{DestinationAdapter, SqlAdapter};
use crate::db::Database;
use crate::error::Result;
use crate::models::{Destination, EntityType};
use crate::storage::{SnapshotArchive, SnapshotInfo};

/// Outcome of merging one snapshot into the live local store.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub snapshot: SnapshotInfo,
    pub passes: Vec<PassSummary>,
    /// Snapshot rows left out because LOCAL deleted them after the snapshot
    pub withheld: usize,
}

/// Merges snapshots into LOCAL and forwards what they recovered to EXTERNAL.
///
/// Keys applied by a merge stay queued until a forced LOCAL->EXTERNAL pass
/// has covered them, so recovered rows survive an unreachable external store.
pub struct SnapshotMerger {
    archive: SnapshotArchive,
    reconciler: Reconciler,
    pending: Mutex<BTreeMap<EntityType, BTreeSet<String>>>,
}

impl SnapshotMerger {
    pub fn new(archive: SnapshotArchive, reconciler: Reconciler) -> Self {
        Self {
            archive,
            reconciler,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub const fn archive(&self) -> &SnapshotArchive {
        &self.archive
    }

    /// Number of recovered keys still waiting for the forced pass.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeSet::len)
            .sum()
    }

    /// Reconcile the newest snapshot into `local` for each of `entities`.
    ///
    /// Snapshot ids are LOCAL ids. A snapshot row missing from `local` whose
    /// id the engine had linked to another destination was deleted after the
    /// snapshot was taken, so it is not restored.
    ///
    /// Returns `None` when no snapshot has been published yet.
    pub async fn merge_latest(
        &self,
        local: &dyn DestinationAdapter,
        entities: &[EntityType],
    ) -> Result<Option<MergeReport>> {
        let scratch = tempfile::tempdir()?;
        let Some((snapshot, path)) = self.archive.download_latest(scratch.path()).await? else {
            tracing::debug!("No snapshot published yet; skipping merge");
            return Ok(None);
        };

        let db = Arc::new(Database::open(&path).await?);
        let source = SqlAdapter::new(Destination::Backup, db)?;
        let options = PassOptions::new(AuthoritativeSide::Timestamp).without_id_map();

        let mut passes = Vec::with_capacity(entities.len());
        let mut withheld = 0;
        for &entity in entities {
            let live = local.fetch_all_keys(entity).await?;
            let mut keys = Vec::new();
            for (key, id) in source.fetch_all_keys(entity).await? {
                if !live.contains_key(&key) && self.reconciler.was_linked(entity, Destination::Local, &id).await? {
                    tracing::debug!(entity = %entity, natural_key = %key, "Not restoring locally deleted row");
                    withheld += 1;
                    continue;
                }
                keys.push(key);
            }

            let summary = self
                .reconciler
                .reconcile_keys(&source, local, entity, &keys, options)
                .await?;
            if !summary.applied_keys.is_empty() {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(entity)
                    .or_default()
                    .extend(summary.applied_keys.iter().cloned());
            }
            passes.push(summary);
        }

        let recovered: usize = passes.iter().map(|pass| pass.applied).sum();
        tracing::info!(
            snapshot = %snapshot.key,
            recovered,
            withheld,
            "Merged snapshot into local store"
        );
        Ok(Some(MergeReport {
            snapshot,
            passes,
            withheld,
        }))
    }

    /// Push every queued recovered key from `local` to `external`, with the
    /// source treated as authoritative.
    ///
    /// Keys that fail with a record error stay queued. If `external` becomes
    /// unreachable the remaining keys are put back and the error returned.
    pub async fn flush_forced(
        &self,
        local: &dyn DestinationAdapter,
        external: &dyn DestinationAdapter,
    ) -> Result<Vec<PassSummary>> {
        let queued = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let options = PassOptions::new(AuthoritativeSide::Source);

        let mut passes = Vec::new();
        let mut remaining = queued.into_iter();
        while let Some((entity, keys)) = remaining.next() {
            let list: Vec<String> = keys.iter().cloned().collect();
            match self
                .reconciler
                .reconcile_keys(local, external, entity, &list, options)
                .await
            {
                Ok(summary) => {
                    let retry: BTreeSet<String> = summary
                        .errors
                        .iter()
                        .filter(|error| error.kind == SyncErrorKind::RecordOperationFailed)
                        .filter_map(|error| error.natural_key.clone())
                        .collect();
                    self.requeue(entity, retry);
                    passes.push(summary);
                }
                Err(error) => {
                    self.requeue(entity, keys);
                    for (entity, keys) in remaining {
                        self.requeue(entity, keys);
                    }
                    return Err(error);
                }
            }
        }
        Ok(passes)
    }

    fn requeue(&self, entity: EntityType, keys: BTreeSet<String>) {
        if keys.is_empty() {
            return;
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity)
            .or_default()
            .extend(keys);
    }
}
