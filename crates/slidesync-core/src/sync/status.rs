//! Operator-facing sync status.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use super::gate::DeploymentMode;
use super::outcome::PassSummary;
use super::policy::Tier;
use crate::error::Error;
use crate::models::{Destination, Direction, EntityType};
use crate::util::Timestamp;

/// Lifecycle of one (entity type, direction) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PairStatus {
    pub state: PairState,
    pub last_started_at: Option<Timestamp>,
    pub last_success_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub last_applied: usize,
    pub last_conflicts: usize,
    pub last_record_errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub direction: Direction,
    #[serde(flatten)]
    pub status: PairStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityStatus {
    pub entity_type: EntityType,
    pub tier: Tier,
    /// Whether at least one route has both ends active in this deployment
    pub enabled: bool,
    /// Oldest last-success time across the entity's routes
    pub last_success_at: Option<Timestamp>,
    pub pending_conflict_count: u64,
    pub routes: Vec<RouteStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: DeploymentMode,
    pub active_destinations: Vec<Destination>,
    pub shutting_down: bool,
    pub hot_entries: usize,
    /// Keys recovered from a snapshot that still await the forced pass
    pub pending_recovered_keys: usize,
    pub entities: Vec<EntityStatus>,
}

/// In-memory pair states shared by every tier task.
#[derive(Default)]
pub(crate) struct StatusBoard {
    pairs: Mutex<BTreeMap<(EntityType, Direction), PairStatus>>,
}

impl StatusBoard {
    /// Move the pair to RUNNING; false if a pass is already in flight.
    pub(crate) fn try_begin(&self, entity: EntityType, direction: Direction, now: Timestamp) -> bool {
        let mut pairs = self.pairs.lock().unwrap_or_else(PoisonError::into_inner);
        let status = pairs.entry((entity, direction)).or_default();
        if status.state == PairState::Running {
            return false;
        }
        status.state = PairState::Running;
        status.last_started_at = Some(now);
        true
    }

    pub(crate) fn finish(
        &self,
        entity: EntityType,
        direction: Direction,
        result: std::result::Result<&PassSummary, &Error>,
    ) {
        let mut pairs = self.pairs.lock().unwrap_or_else(PoisonError::into_inner);
        let status = pairs.entry((entity, direction)).or_default();
        status.state = PairState::Idle;
        match result {
            Ok(summary) => {
                status.last_success_at = Some(summary.finished_at);
                status.last_error = None;
                status.last_applied = summary.applied;
                status.last_conflicts = summary.conflicts;
                status.last_record_errors = summary.errors.len();
            }
            Err(error) => status.last_error = Some(error.to_string()),
        }
    }

    pub(crate) fn get(&self, entity: EntityType, direction: Direction) -> PairStatus {
        self.pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(entity, direction))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_refused_until_finish() {
        let board = StatusBoard::default();
        let direction = Direction::new(Destination::Local, Destination::External);

        assert!(board.try_begin(EntityType::User, direction, 10.0));
        assert!(!board.try_begin(EntityType::User, direction, 11.0));
        assert!(board.try_begin(EntityType::Document, direction, 11.0));

        let error = Error::Timeout {
            destination: Destination::External,
            operation: "upsert",
        };
        board.finish(EntityType::User, direction, Err(&error));
        let status = board.get(EntityType::User, direction);
        assert_eq!(status.state, PairState::Idle);
        assert_eq!(status.last_success_at, None);
        assert_eq!(status.last_error.as_deref(), Some("upsert on EXTERNAL timed out"));
        assert!(board.try_begin(EntityType::User, direction, 12.0));
    }
}
