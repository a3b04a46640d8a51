//! Per-record outcomes and pass-level summaries.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::Error;
use crate::models::{ConflictReason, Direction, EntityType, Record, RecordId};
use crate::util::Timestamp;

/// Pass-level error taxonomy surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Ping or timeout failure; the destination is skipped for the cycle
    AdapterUnreachable,
    /// Single-record failure, retried next cycle
    RecordOperationFailed,
    /// Routed to the conflict ledger
    NaturalKeyConflict,
    /// Destination not configured for this deployment
    ConfigurationDisabled,
}

impl SyncErrorKind {
    pub fn classify(error: &Error) -> Self {
        if error.is_unreachable() {
            Self::AdapterUnreachable
        } else if error.is_unique_violation() {
            Self::NaturalKeyConflict
        } else {
            Self::RecordOperationFailed
        }
    }
}

/// Why a record was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The route never overwrites existing target rows
    TargetAuthoritative,
    /// Target already holds identical content
    InSync,
    /// Same effective timestamp, different content
    SameTimestamp,
    /// Target was written more recently
    TargetNewer,
}

/// Result of reconciling one source record against the target.
#[derive(Debug)]
pub enum RecordOutcome {
    Applied(RecordId),
    Skipped(SkipReason),
    Conflict { reason: ConflictReason, conflict_id: i64 },
    Error(Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordError {
    pub natural_key: Option<String>,
    pub kind: SyncErrorKind,
    pub message: String,
    /// Effective timestamp of the failed source record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_ts: Option<Timestamp>,
}

impl RecordError {
    pub fn new(natural_key: Option<&str>, error: &Error, effective_ts: Option<Timestamp>) -> Self {
        Self {
            natural_key: natural_key.map(ToOwned::to_owned),
            kind: SyncErrorKind::classify(error),
            message: error.to_string(),
            effective_ts,
        }
    }
}

/// Aggregated result of one reconciler pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub entity_type: EntityType,
    pub direction: Direction,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: Vec<RecordError>,
    /// Natural keys written to the target during this pass
    #[serde(skip)]
    pub applied_keys: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletions: Option<DeletionSummary>,
}

impl PassSummary {
    pub const fn new(entity_type: EntityType, direction: Direction, started_at: Timestamp) -> Self {
        Self {
            entity_type,
            direction,
            started_at,
            finished_at: started_at,
            fetched: 0,
            applied: 0,
            skipped: 0,
            conflicts: 0,
            errors: Vec::new(),
            applied_keys: BTreeSet::new(),
            deletions: None,
        }
    }

    pub fn record(&mut self, record: &Record, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Applied(_) => {
                self.applied += 1;
                self.applied_keys.insert(record.natural_key.clone());
            }
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Conflict { .. } => self.conflicts += 1,
            RecordOutcome::Error(error) => {
                tracing::warn!(
                    entity = %self.entity_type,
                    direction = %self.direction,
                    natural_key = %record.natural_key,
                    "Record operation failed: {error}"
                );
                self.errors.push(RecordError::new(
                    Some(&record.natural_key),
                    &error,
                    Some(record.effective_ts()),
                ));
            }
        }
    }

    /// Cursor value to persist once this pass has completed.
    ///
    /// Failed records pull the cursor back below their own timestamp so the
    /// next pass fetches them again.
    pub fn next_cursor(&self) -> Timestamp {
        self.errors
            .iter()
            .filter(|error| error.kind == SyncErrorKind::RecordOperationFailed)
            .filter_map(|error| error.effective_ts)
            .map(|ts| ts - 0.001)
            .fold(self.started_at, f64::min)
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.deletions.as_ref().map_or(true, |d| d.errors.is_empty())
    }
}

/// Result of one deletion-propagation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletionSummary {
    /// Target keys absent from the source enumeration
    pub orphans: usize,
    pub deleted: usize,
    pub tombstoned: usize,
    /// Orphans found on the source again when re-checked
    pub resurrected: usize,
    /// Orphans never replicated from this source, left alone
    pub unlinked: usize,
    /// The source enumerated nothing, so nothing was deleted
    pub guarded: bool,
    pub errors: Vec<RecordError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Destination, Payload};

    fn direction() -> Direction {
        Direction::new(Destination::Local, Destination::External)
    }

    #[test]
    fn next_cursor_is_start_without_failures() {
        let mut summary = PassSummary::new(EntityType::User, direction(), 500.0);
        summary.record(
            &Record::new("alice", Payload::new(), 100.0),
            RecordOutcome::Applied(RecordId::from(1)),
        );
        assert!((summary.next_cursor() - 500.0).abs() < f64::EPSILON);
        assert!(summary.is_clean());
    }

    #[test]
    fn next_cursor_rewinds_below_failed_record() {
        let mut summary = PassSummary::new(EntityType::User, direction(), 500.0);
        summary.record(
            &Record::new("bob", Payload::new(), 120.0),
            RecordOutcome::Error(Error::Database("disk I/O error".into())),
        );
        summary.record(
            &Record::new("carol", Payload::new(), 90.0),
            RecordOutcome::Conflict {
                reason: ConflictReason::NaturalKeyCollisionOnInsert,
                conflict_id: 1,
            },
        );

        assert!((summary.next_cursor() - 119.999).abs() < 1e-9);
        assert_eq!(summary.errors[0].kind, SyncErrorKind::RecordOperationFailed);
        assert_eq!(summary.conflicts, 1);
        assert!(!summary.is_clean());
    }
}
