//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::record::{Destination, EntityType, RecordId};
use crate::error::{Error, Result};
use crate::util::Timestamp;

/// Why a record was routed to the conflict ledger instead of being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    NaturalKeyCollisionOnInsert,
    NaturalKeyCollisionOnUpdate,
    IntegrityError,
    IdMappingMismatch,
}

impl ConflictReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NaturalKeyCollisionOnInsert => "natural_key_collision_on_insert",
            Self::NaturalKeyCollisionOnUpdate => "natural_key_collision_on_update",
            Self::IntegrityError => "integrity_error",
            Self::IdMappingMismatch => "id_mapping_mismatch",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "natural_key_collision_on_insert" => Ok(Self::NaturalKeyCollisionOnInsert),
            "natural_key_collision_on_update" => Ok(Self::NaturalKeyCollisionOnUpdate),
            "integrity_error" => Ok(Self::IntegrityError),
            "id_mapping_mismatch" => Ok(Self::IdMappingMismatch),
            other => Err(Error::InvalidInput(format!("unknown conflict reason '{other}'"))),
        }
    }
}

/// Conflict awaiting operator review. Only `resolved` is ever mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Ledger row identifier
    pub id: i64,
    pub entity_type: EntityType,
    pub source_destination: Destination,
    pub target_destination: Destination,
    pub source_id: Option<RecordId>,
    pub target_id: Option<RecordId>,
    /// Key that caused the conflict
    pub natural_key_attempted: String,
    pub reason: ConflictReason,
    /// Both sides' data at the time of the conflict
    pub payload_snapshot: serde_json::Value,
    pub created_at: Timestamp,
    pub resolved: bool,
    pub resolved_at: Option<Timestamp>,
}

/// Conflict about to be appended to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewConflict {
    pub entity_type: EntityType,
    pub source_destination: Destination,
    pub target_destination: Destination,
    pub source_id: Option<RecordId>,
    pub target_id: Option<RecordId>,
    pub natural_key_attempted: String,
    pub reason: ConflictReason,
    pub payload_snapshot: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_string_roundtrip() {
        for reason in [
            ConflictReason::NaturalKeyCollisionOnInsert,
            ConflictReason::NaturalKeyCollisionOnUpdate,
            ConflictReason::IntegrityError,
            ConflictReason::IdMappingMismatch,
        ] {
            assert_eq!(reason.as_str().parse::<ConflictReason>().unwrap(), reason);
        }
    }

    #[test]
    fn reason_serializes_snake_case() {
        let json = serde_json::to_string(&ConflictReason::IdMappingMismatch).unwrap();
        assert_eq!(json, "\"id_mapping_mismatch\"");
    }
}
