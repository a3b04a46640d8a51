//! Diff-and-apply algorithm for one (entity type, direction) pair.

use tokio::sync::watch;

use super::outcome::{DeletionSummary, PassSummary, RecordError, RecordOutcome, SkipReason};
use super::policy::{AuthoritativeSide, DeletionMode};
use crate::adapter::DestinationAdapter;
use crate::db::{ConflictLedger, IdMap};
use crate::error::{Error, Result};
use crate::models::{ConflictReason, Destination, Direction, EntityType, NewConflict, Record, RecordId};
use crate::util::{now_ts, Timestamp};

/// How a pass treats existing target rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOptions {
    pub authoritative: AuthoritativeSide,
    /// Consult and maintain the cross-store id map
    pub use_id_map: bool,
}

impl PassOptions {
    pub const fn new(authoritative: AuthoritativeSide) -> Self {
        Self {
            authoritative,
            use_id_map: true,
        }
    }

    #[must_use]
    pub const fn without_id_map(mut self) -> Self {
        self.use_id_map = false;
        self
    }
}

/// Stateless between invocations; holds only the ledger and id map handles.
#[derive(Clone)]
pub struct Reconciler {
    ledger: ConflictLedger,
    id_map: IdMap,
    shutdown: Option<watch::Receiver<bool>>,
}

enum InsertAttempt {
    Done(RecordOutcome),
    /// The target already holds a row for this record
    Existing(Record),
}

impl Reconciler {
    pub const fn new(ledger: ConflictLedger, id_map: IdMap) -> Self {
        Self {
            ledger,
            id_map,
            shutdown: None,
        }
    }

    /// Stop between records once `shutdown` flips to true.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub const fn ledger(&self) -> &ConflictLedger {
        &self.ledger
    }

    fn check_shutdown(&self) -> Result<()> {
        match &self.shutdown {
            Some(shutdown) if *shutdown.borrow() => Err(Error::ShuttingDown),
            _ => Ok(()),
        }
    }

    /// Whether `id` on `destination` was ever linked to a row elsewhere.
    pub async fn was_linked(&self, entity: EntityType, destination: Destination, id: &RecordId) -> Result<bool> {
        for other in Destination::ALL.into_iter().filter(|other| *other != destination) {
            if self.id_map.lookup(entity, destination, id, other).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reconcile every source record changed after `cursor`.
    ///
    /// Per-record failures are collected in the summary. An unreachable or
    /// timed-out destination aborts the pass with an error, as does shutdown.
    pub async fn run_pass(
        &self,
        source: &dyn DestinationAdapter,
        target: &dyn DestinationAdapter,
        entity: EntityType,
        cursor: Timestamp,
        options: PassOptions,
    ) -> Result<PassSummary> {
        let direction = Direction::new(source.destination(), target.destination());
        let mut summary = PassSummary::new(entity, direction, now_ts());

        let changed = source.fetch_changed_since(entity, cursor).await?;
        summary.fetched = changed.len();

        for record in &changed {
            self.check_shutdown()?;
            match self.reconcile_record(source, target, entity, record, options).await {
                RecordOutcome::Error(error) if error.is_unreachable() => return Err(error),
                outcome => summary.record(record, outcome),
            }
        }

        summary.finished_at = now_ts();
        if summary.fetched > 0 {
            tracing::info!(
                entity = %entity,
                direction = %direction,
                fetched = summary.fetched,
                applied = summary.applied,
                skipped = summary.skipped,
                conflicts = summary.conflicts,
                errors = summary.errors.len(),
                "Reconciler pass finished"
            );
        }
        Ok(summary)
    }

    /// Reconcile the named source records regardless of their timestamps.
    /// Keys missing on the source are ignored.
    pub async fn reconcile_keys(
        &self,
        source: &dyn DestinationAdapter,
        target: &dyn DestinationAdapter,
        entity: EntityType,
        keys: &[String],
        options: PassOptions,
    ) -> Result<PassSummary> {
        let direction = Direction::new(source.destination(), target.destination());
        let mut summary = PassSummary::new(entity, direction, now_ts());

        for key in keys {
            self.check_shutdown()?;
            let Some(record) = source.find_by_natural_key(entity, key).await? else {
                continue;
            };
            summary.fetched += 1;
            match self.reconcile_record(source, target, entity, &record, options).await {
                RecordOutcome::Error(error) if error.is_unreachable() => return Err(error),
                outcome => summary.record(&record, outcome),
            }
        }

        summary.finished_at = now_ts();
        Ok(summary)
    }

    /// Reconcile one source record against the target.
    pub async fn reconcile_record(
        &self,
        source: &dyn DestinationAdapter,
        target: &dyn DestinationAdapter,
        entity: EntityType,
        record: &Record,
        options: PassOptions,
    ) -> RecordOutcome {
        match self
            .try_reconcile(source, target, entity, record, options)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => RecordOutcome::Error(error),
        }
    }

    async fn try_reconcile(
        &self,
        source: &dyn DestinationAdapter,
        target: &dyn DestinationAdapter,
        entity: EntityType,
        record: &Record,
        options: PassOptions,
    ) -> Result<RecordOutcome> {
        let direction = Direction::new(source.destination(), target.destination());

        let existing = match target.find_by_natural_key(entity, &record.natural_key).await? {
            Some(existing) => existing,
            None => match self.insert(target, direction, entity, record, options).await? {
                InsertAttempt::Done(outcome) => return Ok(outcome),
                InsertAttempt::Existing(existing) => existing,
            },
        };

        if options.authoritative == AuthoritativeSide::Target {
            return Ok(RecordOutcome::Skipped(SkipReason::TargetAuthoritative));
        }

        if options.use_id_map && self.mapping_disagrees(direction, entity, record, &existing).await? {
            return self
                .conflict(direction, entity, record, Some(&existing), ConflictReason::IdMappingMismatch)
                .await;
        }

        if existing.same_content(record) {
            if options.use_id_map {
                self.link(direction, entity, record, &existing.id).await?;
            }
            return Ok(RecordOutcome::Skipped(SkipReason::InSync));
        }

        let source_ts = record.effective_ts();
        let target_ts = existing.effective_ts();
        if options.authoritative != AuthoritativeSide::Source {
            if source_ts < target_ts {
                return Ok(RecordOutcome::Skipped(SkipReason::TargetNewer));
            }
            if source_ts.total_cmp(&target_ts).is_eq() {
                return Ok(RecordOutcome::Skipped(SkipReason::SameTimestamp));
            }
        }

        match target.upsert(entity, record, Some(&existing.id)).await {
            Ok(id) => self.applied(direction, entity, record, id, options).await,
            Err(error) => {
                self.write_failure(
                    direction,
                    entity,
                    record,
                    Some(&existing),
                    error,
                    ConflictReason::NaturalKeyCollisionOnUpdate,
                )
                .await
            }
        }
    }

    async fn insert(
        &self,
        target: &dyn DestinationAdapter,
        direction: Direction,
        entity: EntityType,
        record: &Record,
        options: PassOptions,
    ) -> Result<InsertAttempt> {
        // A key renamed on either side still maps to the row we wrote before;
        // that row goes through the same comparison as a key match.
        if options.use_id_map && options.authoritative != AuthoritativeSide::Target {
            if let Some(mapped) = self
                .id_map
                .lookup(entity, direction.source, &record.id, direction.target)
                .await?
            {
                if let Some(current) = target.find_by_id(entity, &mapped).await? {
                    return Ok(InsertAttempt::Existing(current));
                }
            }
        }

        match target.upsert(entity, record, None).await {
            Ok(id) => Ok(InsertAttempt::Done(
                self.applied(direction, entity, record, id, options).await?,
            )),
            Err(error) if error.is_unique_violation() => {
                let existing = target
                    .find_by_natural_key(entity, &record.natural_key)
                    .await?
                    .ok_or_else(|| {
                        Error::Database(format!(
                            "'{}' collided on insert into {} but is no longer present",
                            record.natural_key, direction.target
                        ))
                    })?;

                if options.use_id_map {
                    let linked = self
                        .id_map
                        .lookup(entity, direction.source, &record.id, direction.target)
                        .await?;
                    if linked.as_ref() != Some(&existing.id) {
                        return Ok(InsertAttempt::Done(
                            self.conflict(
                                direction,
                                entity,
                                record,
                                Some(&existing),
                                ConflictReason::NaturalKeyCollisionOnInsert,
                            )
                            .await?,
                        ));
                    }
                }
                Ok(InsertAttempt::Existing(existing))
            }
            Err(error) => Ok(InsertAttempt::Done(
                self.write_failure(
                    direction,
                    entity,
                    record,
                    None,
                    error,
                    ConflictReason::NaturalKeyCollisionOnInsert,
                )
                .await?,
            )),
        }
    }

    async fn mapping_disagrees(
        &self,
        direction: Direction,
        entity: EntityType,
        record: &Record,
        existing: &Record,
    ) -> Result<bool> {
        let forward = self
            .id_map
            .lookup(entity, direction.source, &record.id, direction.target)
            .await?;
        if forward.is_some_and(|id| id != existing.id) {
            return Ok(true);
        }
        let backward = self
            .id_map
            .lookup(entity, direction.target, &existing.id, direction.source)
            .await?;
        Ok(backward.is_some_and(|id| id != record.id))
    }

    async fn link(
        &self,
        direction: Direction,
        entity: EntityType,
        record: &Record,
        target_id: &RecordId,
    ) -> Result<()> {
        self.id_map
            .link(
                entity,
                (direction.source, &record.id),
                (direction.target, target_id),
                &record.natural_key,
            )
            .await
    }

    async fn applied(
        &self,
        direction: Direction,
        entity: EntityType,
        record: &Record,
        target_id: RecordId,
        options: PassOptions,
    ) -> Result<RecordOutcome> {
        if options.use_id_map {
            self.link(direction, entity, record, &target_id).await?;
        }
        tracing::debug!(
            entity = %entity,
            direction = %direction,
            natural_key = %record.natural_key,
            target_id = %target_id,
            "Applied record"
        );
        Ok(RecordOutcome::Applied(target_id))
    }

    /// Route constraint failures to the ledger; anything else stays an error.
    async fn write_failure(
        &self,
        direction: Direction,
        entity: EntityType,
        record: &Record,
        existing: Option<&Record>,
        error: Error,
        unique_reason: ConflictReason,
    ) -> Result<RecordOutcome> {
        if error.is_unique_violation() {
            return self
                .conflict(direction, entity, record, existing, unique_reason)
                .await;
        }
        if error.is_integrity_violation() || matches!(error, Error::InvalidInput(_)) {
            tracing::debug!(natural_key = %record.natural_key, "Integrity failure: {error}");
            return self
                .conflict(direction, entity, record, existing, ConflictReason::IntegrityError)
                .await;
        }
        Err(error)
    }

    async fn conflict(
        &self,
        direction: Direction,
        entity: EntityType,
        record: &Record,
        existing: Option<&Record>,
        reason: ConflictReason,
    ) -> Result<RecordOutcome> {
        let mut payload_snapshot = serde_json::Map::new();
        payload_snapshot.insert("source".into(), serde_json::to_value(record)?);
        payload_snapshot.insert(
            "target".into(),
            existing
                .map(serde_json::to_value)
                .transpose()?
                .unwrap_or_default(),
        );
        let conflict_id = self
            .ledger
            .append(&NewConflict {
                entity_type: entity,
                source_destination: direction.source,
                target_destination: direction.target,
                source_id: Some(record.id.clone()).filter(|id| !id.as_str().is_empty()),
                target_id: existing.map(|existing| existing.id.clone()),
                natural_key_attempted: record.natural_key.clone(),
                reason,
                payload_snapshot: serde_json::Value::Object(payload_snapshot),
            })
            .await?;
        Ok(RecordOutcome::Conflict {
            reason,
            conflict_id,
        })
    }

    /// Remove target rows whose natural key no longer exists on the source.
    ///
    /// Only rows the id map links back to the source are candidates, each
    /// key is re-checked on the source right before acting, and an empty
    /// source enumeration never deletes anything.
    pub async fn propagate_deletions(
        &self,
        source: &dyn DestinationAdapter,
        target: &dyn DestinationAdapter,
        entity: EntityType,
        mode: DeletionMode,
    ) -> Result<DeletionSummary> {
        let direction = Direction::new(source.destination(), target.destination());
        let mut summary = DeletionSummary::default();

        let source_keys = source.fetch_all_keys(entity).await?;
        let orphans: Vec<(String, RecordId)> = target
            .fetch_all_keys(entity)
            .await?
            .into_iter()
            .filter(|(key, _)| !source_keys.contains_key(key))
            .collect();
        summary.orphans = orphans.len();

        if source_keys.is_empty() && !orphans.is_empty() {
            tracing::warn!(
                entity = %entity,
                direction = %direction,
                orphans = orphans.len(),
                "Source enumerated no keys; refusing to propagate deletions"
            );
            summary.guarded = true;
            return Ok(summary);
        }

        for (key, target_id) in orphans {
            self.check_shutdown()?;
            match self.delete_orphan(source, target, direction, entity, mode, &key, &target_id).await {
                Ok(OrphanAction::Deleted) => summary.deleted += 1,
                Ok(OrphanAction::Tombstoned) => summary.tombstoned += 1,
                Ok(OrphanAction::Resurrected) => summary.resurrected += 1,
                Ok(OrphanAction::Unlinked) => summary.unlinked += 1,
                Ok(OrphanAction::Untouched) => {}
                Err(error) if error.is_unreachable() => return Err(error),
                Err(error) => summary.errors.push(RecordError::new(Some(key.as_str()), &error, None)),
            }
        }

        if summary.deleted + summary.tombstoned > 0 || summary.resurrected > 0 {
            tracing::info!(
                entity = %entity,
                direction = %direction,
                deleted = summary.deleted,
                tombstoned = summary.tombstoned,
                resurrected = summary.resurrected,
                unlinked = summary.unlinked,
                "Deletion propagation finished"
            );
        }
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn delete_orphan(
        &self,
        source: &dyn DestinationAdapter,
        target: &dyn DestinationAdapter,
        direction: Direction,
        entity: EntityType,
        mode: DeletionMode,
        key: &str,
        target_id: &RecordId,
    ) -> Result<OrphanAction> {
        if self
            .id_map
            .lookup(entity, direction.target, target_id, direction.source)
            .await?
            .is_none()
        {
            return Ok(OrphanAction::Unlinked);
        }

        if source.find_by_natural_key(entity, key).await?.is_some() {
            return Ok(OrphanAction::Resurrected);
        }

        match mode {
            DeletionMode::Hard => {
                target.delete(entity, key).await?;
                Ok(OrphanAction::Deleted)
            }
            DeletionMode::Tombstone => {
                let Some(current) = target.find_by_natural_key(entity, key).await? else {
                    return Ok(OrphanAction::Untouched);
                };
                if current.soft_deleted {
                    return Ok(OrphanAction::Untouched);
                }
                target
                    .upsert(entity, &current.tombstone(now_ts()), Some(&current.id))
                    .await?;
                Ok(OrphanAction::Tombstoned)
            }
        }
    }
}

enum OrphanAction {
    Deleted,
    Tombstoned,
    Resurrected,
    Unlinked,
    Untouched,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{SharedAdapter, SqlAdapter};
    use crate::db::{ConflictFilter, Database};
    use crate::models::Payload;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Fixture {
        local: SqlAdapter,
        external: SqlAdapter,
        reconciler: Reconciler,
        _state: Arc<Database>,
    }

    async fn fixture() -> Fixture {
        let state = Arc::new(Database::open_in_memory().await.unwrap());
        let local = SqlAdapter::new(Destination::Local, state.clone()).unwrap();
        let external_db = Arc::new(Database::open_in_memory().await.unwrap());
        let external = SqlAdapter::new(Destination::External, external_db).unwrap();
        let reconciler = Reconciler::new(
            ConflictLedger::new(state.connect().unwrap()),
            IdMap::new(state.connect().unwrap()),
        );
        Fixture {
            local,
            external,
            reconciler,
            _state: state,
        }
    }

    fn user(key: &str, updated_at: f64, email: &str) -> Record {
        let mut payload = Payload::new();
        payload.insert("email".into(), json!(email));
        Record {
            created_at: updated_at.min(50.0),
            updated_at,
            last_activity_at: updated_at.min(50.0),
            ..Record::new(key, payload, updated_at)
        }
    }

    const LWW: PassOptions = PassOptions::new(AuthoritativeSide::Timestamp);

    async fn pending_conflicts(reconciler: &Reconciler) -> Vec<crate::models::ConflictEntry> {
        reconciler
            .ledger()
            .list(&ConflictFilter::default())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_local_record_is_copied_to_external() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::User, &user("alice", 100.0, "a@x"), None)
            .await
            .unwrap();

        let summary = fx
            .reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();
        assert_eq!(summary.applied, 1);

        let copied = fx
            .external
            .find_by_natural_key(EntityType::User, "alice")
            .await
            .unwrap()
            .unwrap();
        assert!((copied.updated_at - 100.0).abs() < f64::EPSILON);
        assert_eq!(copied.payload["email"], "a@x");
        assert!(pending_conflicts(&fx.reconciler).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_source_overwrites_in_place() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::User, &user("alice", 200.0, "new@x"), None)
            .await
            .unwrap();
        let external_id = fx
            .external
            .upsert(EntityType::User, &user("alice", 100.0, "old@x"), None)
            .await
            .unwrap();

        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();

        let updated = fx
            .external
            .find_by_natural_key(EntityType::User, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, external_id);
        assert_eq!(updated.payload["email"], "new@x");
        assert!((updated.updated_at - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn older_source_leaves_newer_target_alone() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::User, &user("bob", 50.0, "stale@x"), None)
            .await
            .unwrap();
        fx.external
            .upsert(EntityType::User, &user("bob", 300.0, "fresh@x"), None)
            .await
            .unwrap();

        let summary = fx
            .reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);

        let kept = fx
            .external
            .find_by_natural_key(EntityType::User, "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.payload["email"], "fresh@x");
        assert!(pending_conflicts(&fx.reconciler).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn authoritative_target_is_never_overwritten() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::Template, &user("corporate", 500.0, "new"), None)
            .await
            .unwrap();
        fx.external
            .upsert(EntityType::Template, &user("corporate", 10.0, "old"), None)
            .await
            .unwrap();

        let summary = fx
            .reconciler
            .run_pass(
                &fx.local,
                &fx.external,
                EntityType::Template,
                0.0,
                PassOptions::new(AuthoritativeSide::Target),
            )
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.applied, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn authoritative_source_overwrites_newer_target() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::Template, &user("corporate", 10.0, "from-local"), None)
            .await
            .unwrap();
        fx.external
            .upsert(EntityType::Template, &user("corporate", 500.0, "from-external"), None)
            .await
            .unwrap();

        let summary = fx
            .reconciler
            .run_pass(
                &fx.local,
                &fx.external,
                EntityType::Template,
                0.0,
                PassOptions::new(AuthoritativeSide::Source),
            )
            .await
            .unwrap();
        assert_eq!(summary.applied, 1);
        let stored = fx
            .external
            .find_by_natural_key(EntityType::Template, "corporate")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload["email"], "from-local");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_pass_is_idempotent() {
        let fx = fixture().await;
        for (key, ts) in [("alice", 100.0), ("bob", 120.0)] {
            fx.local
                .upsert(EntityType::User, &user(key, ts, "x@x"), None)
                .await
                .unwrap();
        }

        let first = fx
            .reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();
        let snapshot: BTreeMap<_, _> = fx.external.fetch_all_keys(EntityType::User).await.unwrap();
        let second = fx
            .reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();

        assert_eq!(first.applied, 2);
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(
            fx.external.fetch_all_keys(EntityType::User).await.unwrap(),
            snapshot
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn foreign_row_on_insert_collision_is_logged_once() {
        let fx = fixture().await;
        let carol = user("carol", 100.0, "local@x");
        fx.local.upsert(EntityType::User, &carol, None).await.unwrap();
        let carol = fx
            .local
            .find_by_natural_key(EntityType::User, "carol")
            .await
            .unwrap()
            .unwrap();

        // Out-of-band insert lands between the lookup and the insert.
        fx.external
            .upsert(EntityType::User, &user("carol", 90.0, "external@x"), None)
            .await
            .unwrap();
        let attempt = fx
            .reconciler
            .insert(
                &fx.external,
                Direction::new(Destination::Local, Destination::External),
                EntityType::User,
                &carol,
                LWW,
            )
            .await
            .unwrap();
        assert!(matches!(
            attempt,
            InsertAttempt::Done(RecordOutcome::Conflict {
                reason: ConflictReason::NaturalKeyCollisionOnInsert,
                ..
            })
        ));

        let conflicts = pending_conflicts(&fx.reconciler).await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].payload_snapshot["source"]["payload"]["email"], "local@x");
        assert_eq!(conflicts[0].payload_snapshot["target"]["payload"]["email"], "external@x");

        let keys = fx.external.fetch_all_keys(EntityType::User).await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn id_mapping_mismatch_is_not_merged() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::User, &user("dave", 100.0, "first@x"), None)
            .await
            .unwrap();
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();

        // Local row replaced by a different logical user under the same key.
        fx.local.delete(EntityType::User, "dave").await.unwrap();
        fx.local
            .upsert(EntityType::User, &user("dave", 400.0, "second@x"), None)
            .await
            .unwrap();

        let summary = fx
            .reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();
        assert_eq!(summary.conflicts, 1);

        let conflicts = pending_conflicts(&fx.reconciler).await;
        assert_eq!(conflicts[0].reason, ConflictReason::IdMappingMismatch);
        let external = fx
            .external
            .find_by_natural_key(EntityType::User, "dave")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(external.payload["email"], "first@x");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn renamed_key_updates_previous_row() {
        let fx = fixture().await;
        let id = fx
            .local
            .upsert(EntityType::Document, &user("draft", 100.0, "x"), None)
            .await
            .unwrap();
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::Document, 0.0, LWW)
            .await
            .unwrap();

        fx.local
            .upsert(EntityType::Document, &user("final", 200.0, "x"), Some(&id))
            .await
            .unwrap();
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::Document, 150.0, LWW)
            .await
            .unwrap();

        let keys = fx.external.fetch_all_keys(EntityType::Document).await.unwrap();
        assert_eq!(keys.keys().cloned().collect::<Vec<_>>(), vec!["final".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn renamed_on_target_newer_is_not_overwritten() {
        let fx = fixture().await;
        let local_id = fx
            .local
            .upsert(EntityType::Document, &user("draft", 100.0, "x"), None)
            .await
            .unwrap();
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::Document, 0.0, LWW)
            .await
            .unwrap();

        let external_id = fx
            .external
            .find_by_natural_key(EntityType::Document, "draft")
            .await
            .unwrap()
            .unwrap()
            .id;
        fx.external
            .upsert(
                EntityType::Document,
                &user("final", 300.0, "renamed-remotely"),
                Some(&external_id),
            )
            .await
            .unwrap();
        fx.local
            .upsert(
                EntityType::Document,
                &user("draft", 200.0, "edited-locally"),
                Some(&local_id),
            )
            .await
            .unwrap();

        let summary = fx
            .reconciler
            .run_pass(&fx.local, &fx.external, EntityType::Document, 150.0, LWW)
            .await
            .unwrap();
        assert_eq!(summary.applied, 0);
        assert_eq!(summary.skipped, 1);

        let keys = fx.external.fetch_all_keys(EntityType::Document).await.unwrap();
        assert_eq!(keys.keys().cloned().collect::<Vec<_>>(), vec!["final".to_string()]);
        let kept = fx
            .external
            .find_by_id(EntityType::Document, &external_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.payload["email"], "renamed-remotely");
        assert!((kept.updated_at - 300.0).abs() < f64::EPSILON);
        assert!(pending_conflicts(&fx.reconciler).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_target_aborts_pass() {
        struct Down;

        #[async_trait::async_trait]
        impl DestinationAdapter for Down {
            fn destination(&self) -> Destination {
                Destination::External
            }
            async fn ping(&self) -> Result<()> {
                Err(self.unreachable())
            }
            async fn fetch_changed_since(&self, _: EntityType, _: Timestamp) -> Result<Vec<Record>> {
                Err(self.unreachable())
            }
            async fn fetch_all_keys(&self, _: EntityType) -> Result<BTreeMap<String, RecordId>> {
                Err(self.unreachable())
            }
            async fn find_by_natural_key(&self, _: EntityType, _: &str) -> Result<Option<Record>> {
                Err(self.unreachable())
            }
            async fn fetch_by_key_prefix(&self, _: EntityType, _: &str) -> Result<Vec<Record>> {
                Err(self.unreachable())
            }
            async fn upsert(&self, _: EntityType, _: &Record, _: Option<&RecordId>) -> Result<RecordId> {
                Err(self.unreachable())
            }
            async fn delete(&self, _: EntityType, _: &str) -> Result<()> {
                Err(self.unreachable())
            }
        }

        impl Down {
            fn unreachable(&self) -> Error {
                Error::Timeout {
                    destination: self.destination(),
                    operation: "test",
                }
            }
        }

        let fx = fixture().await;
        fx.local
            .upsert(EntityType::User, &user("erin", 10.0, "e@x"), None)
            .await
            .unwrap();
        let down: SharedAdapter = Arc::new(Down);

        let err = fx
            .reconciler
            .run_pass(&fx.local, down.as_ref(), EntityType::User, 0.0, LWW)
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert!(pending_conflicts(&fx.reconciler).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deletions_remove_only_linked_orphans() {
        let fx = fixture().await;
        for key in ["alice", "bob"] {
            fx.local
                .upsert(EntityType::User, &user(key, 100.0, "x@x"), None)
                .await
                .unwrap();
        }
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();
        // Never came from LOCAL, so it must survive.
        fx.external
            .upsert(EntityType::User, &user("zed", 100.0, "z@x"), None)
            .await
            .unwrap();
        fx.local.delete(EntityType::User, "bob").await.unwrap();

        let summary = fx
            .reconciler
            .propagate_deletions(&fx.local, &fx.external, EntityType::User, DeletionMode::Hard)
            .await
            .unwrap();

        assert_eq!(summary.orphans, 2);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.unlinked, 1);
        let keys = fx.external.fetch_all_keys(EntityType::User).await.unwrap();
        assert_eq!(
            keys.keys().cloned().collect::<Vec<_>>(),
            vec!["alice".to_string(), "zed".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn key_reinserted_during_enumeration_is_not_deleted() {
        // Enumeration misses `hidden`, as if it was deleted and re-created
        // between the key scan and the orphan check.
        struct StaleKeys<'a> {
            inner: &'a SqlAdapter,
            hidden: &'static str,
        }

        #[async_trait::async_trait]
        impl DestinationAdapter for StaleKeys<'_> {
            fn destination(&self) -> Destination {
                self.inner.destination()
            }
            async fn ping(&self) -> Result<()> {
                self.inner.ping().await
            }
            async fn fetch_changed_since(&self, e: EntityType, c: Timestamp) -> Result<Vec<Record>> {
                self.inner.fetch_changed_since(e, c).await
            }
            async fn fetch_all_keys(&self, e: EntityType) -> Result<BTreeMap<String, RecordId>> {
                let mut keys = self.inner.fetch_all_keys(e).await?;
                keys.remove(self.hidden);
                Ok(keys)
            }
            async fn find_by_natural_key(&self, e: EntityType, k: &str) -> Result<Option<Record>> {
                self.inner.find_by_natural_key(e, k).await
            }
            async fn fetch_by_key_prefix(&self, e: EntityType, p: &str) -> Result<Vec<Record>> {
                self.inner.fetch_by_key_prefix(e, p).await
            }
            async fn upsert(&self, e: EntityType, r: &Record, id: Option<&RecordId>) -> Result<RecordId> {
                self.inner.upsert(e, r, id).await
            }
            async fn delete(&self, e: EntityType, k: &str) -> Result<()> {
                self.inner.delete(e, k).await
            }
        }

        let fx = fixture().await;
        for key in ["alice", "bob"] {
            fx.local
                .upsert(EntityType::User, &user(key, 100.0, "x@x"), None)
                .await
                .unwrap();
        }
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();

        let source = StaleKeys {
            inner: &fx.local,
            hidden: "bob",
        };
        let summary = fx
            .reconciler
            .propagate_deletions(&source, &fx.external, EntityType::User, DeletionMode::Hard)
            .await
            .unwrap();

        assert_eq!(summary.orphans, 1);
        assert_eq!(summary.resurrected, 1);
        assert_eq!(summary.deleted, 0);
        assert!(fx
            .external
            .find_by_natural_key(EntityType::User, "bob")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_mode_marks_instead_of_deleting() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::Document, &user("deck", 100.0, "x"), None)
            .await
            .unwrap();
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::Document, 0.0, LWW)
            .await
            .unwrap();
        fx.local.delete(EntityType::Document, "deck").await.unwrap();
        fx.local
            .upsert(EntityType::Document, &user("keep", 100.0, "x"), None)
            .await
            .unwrap();

        let summary = fx
            .reconciler
            .propagate_deletions(
                &fx.local,
                &fx.external,
                EntityType::Document,
                DeletionMode::Tombstone,
            )
            .await
            .unwrap();
        assert_eq!(summary.tombstoned, 1);

        let tombstone = fx
            .external
            .find_by_natural_key(EntityType::Document, "deck")
            .await
            .unwrap()
            .unwrap();
        assert!(tombstone.soft_deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_source_never_wipes_target() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::User, &user("alice", 100.0, "x@x"), None)
            .await
            .unwrap();
        fx.reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap();
        fx.local.delete(EntityType::User, "alice").await.unwrap();

        let summary = fx
            .reconciler
            .propagate_deletions(&fx.local, &fx.external, EntityType::User, DeletionMode::Hard)
            .await
            .unwrap();
        assert!(summary.guarded);
        assert_eq!(summary.deleted, 0);
        assert!(fx
            .external
            .find_by_natural_key(EntityType::User, "alice")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_stops_between_records() {
        let fx = fixture().await;
        fx.local
            .upsert(EntityType::User, &user("alice", 100.0, "x@x"), None)
            .await
            .unwrap();
        let (tx, rx) = watch::channel(true);
        let reconciler = fx.reconciler.clone().with_shutdown(rx);

        let err = reconciler
            .run_pass(&fx.local, &fx.external, EntityType::User, 0.0, LWW)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        drop(tx);
    }
}
