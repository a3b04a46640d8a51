//! Data models for slidesync

mod conflict;
mod entities;
mod record;

pub use conflict::{ConflictEntry, ConflictReason, NewConflict};
pub use entities::{ConfigItem, Document, Entity, Session, Slide, Template, User};
pub use record::{Destination, Direction, EntityType, Payload, Record, RecordId};

use serde::{Deserialize, Serialize};

use crate::util::Timestamp;

/// Last successful reconciliation of one (entity type, direction) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity_type: EntityType,
    pub direction: Direction,
    pub last_successful_run_at: Timestamp,
}
