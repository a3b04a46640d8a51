//! Record model shared by every entity type and destination

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::Timestamp;

/// Opaque entity-specific fields. The reconciler only ever copies them.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A store that records are replicated between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Destination {
    /// Primary local store
    Local,
    /// Optional external relational store
    External,
    /// Optional object-storage backup tier
    Backup,
}

impl Destination {
    pub const ALL: [Self; 3] = [Self::Local, Self::External, Self::Backup];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::External => "EXTERNAL",
            Self::Backup => "BACKUP",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(Self::Local),
            "EXTERNAL" => Ok(Self::External),
            "BACKUP" => Ok(Self::Backup),
            other => Err(Error::InvalidInput(format!("unknown destination '{other}'"))),
        }
    }
}

/// Logical entity types replicated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Document,
    Slide,
    Template,
    ConfigItem,
    Session,
}

impl EntityType {
    pub const ALL: [Self; 6] = [
        Self::User,
        Self::Document,
        Self::Slide,
        Self::Template,
        Self::ConfigItem,
        Self::Session,
    ];

    /// Table name in relational stores; also the object-storage namespace.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Document => "documents",
            Self::Slide => "slides",
            Self::Template => "templates",
            Self::ConfigItem => "config_items",
            Self::Session => "sessions",
        }
    }

    /// Entity types whose rows belong to an instance of this type.
    pub const fn dependents(self) -> &'static [Self] {
        match self {
            Self::Document => &[Self::Slide],
            _ => &[],
        }
    }

    /// Natural-key prefix selecting the dependents of the instance `natural_key`.
    pub fn dependent_key_prefix(self, natural_key: &str) -> String {
        match self {
            Self::Document => format!("{natural_key}/"),
            _ => natural_key.to_string(),
        }
    }

    /// Validate that `key` is a well-formed natural key for this entity type.
    pub fn validate_natural_key(self, key: &str) -> Result<()> {
        let pattern = match self {
            Self::User => r"^[A-Za-z0-9_.-]{1,64}$",
            Self::Document => r"^[a-z0-9][a-z0-9-]{0,127}$",
            Self::Slide => r"^[a-z0-9][a-z0-9-]{0,127}/[0-9]{1,6}$",
            Self::Template => r"^[a-z0-9][a-z0-9_.-]{0,127}$",
            Self::ConfigItem => r"^[A-Za-z0-9_.:-]{1,128}$",
            Self::Session => r"^\S{1,256}$",
        };
        let re = Regex::new(pattern).expect("Invalid regex");
        if re.is_match(key) {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "'{key}' is not a valid natural key for {self}"
            )))
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|entity| {
                entity.as_str() == normalized || entity.as_str().trim_end_matches('s') == normalized
            })
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity type '{s}'")))
    }
}

/// Store-local surrogate identifier. Never assumed stable across stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Integer form for relational stores.
    pub fn as_i64(&self) -> Result<i64> {
        self.0
            .parse()
            .map_err(|_| Error::InvalidInput(format!("record id '{}' is not an integer", self.0)))
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical entity instance as held by exactly one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Store-local surrogate id
    pub id: RecordId,
    /// Stable business identifier matching the same entity across stores
    pub natural_key: String,
    /// Entity-specific fields
    #[serde(default)]
    pub payload: Payload,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_activity_at: Timestamp,
    /// Tombstone marker for entity types that soft-delete
    #[serde(default)]
    pub soft_deleted: bool,
}

impl Record {
    /// Create a fresh record stamped at `now` with an unassigned id.
    pub fn new(natural_key: impl Into<String>, payload: Payload, now: Timestamp) -> Self {
        Self {
            id: RecordId::new(""),
            natural_key: natural_key.into(),
            payload,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            soft_deleted: false,
        }
    }

    /// Latest of the three mutation timestamps.
    pub fn effective_ts(&self) -> Timestamp {
        self.created_at
            .max(self.updated_at)
            .max(self.last_activity_at)
    }

    /// Whether any timestamp is strictly after `cursor`.
    pub fn changed_since(&self, cursor: Timestamp) -> bool {
        self.updated_at > cursor || self.created_at > cursor || self.last_activity_at > cursor
    }

    /// Check the model invariants before a record is written anywhere.
    pub fn validate(&self) -> Result<()> {
        if self.natural_key.trim().is_empty() {
            return Err(Error::InvalidInput("natural key must not be empty".into()));
        }
        if self.updated_at < self.created_at {
            return Err(Error::InvalidInput(format!(
                "record '{}' has updated_at {} before created_at {}",
                self.natural_key, self.updated_at, self.created_at
            )));
        }
        Ok(())
    }

    /// Re-derive the target-side representation carrying `target_id`.
    #[must_use]
    pub fn for_target(&self, target_id: RecordId) -> Self {
        Self {
            id: target_id,
            ..self.clone()
        }
    }

    /// Tombstoned copy of this record, stamped at `now`.
    #[must_use]
    pub fn tombstone(&self, now: Timestamp) -> Self {
        Self {
            soft_deleted: true,
            updated_at: now.max(self.updated_at),
            ..self.clone()
        }
    }

    /// Compare everything except the store-local id.
    pub fn same_content(&self, other: &Self) -> bool {
        self.natural_key == other.natural_key
            && self.payload == other.payload
            && self.created_at.to_bits() == other.created_at.to_bits()
            && self.updated_at.to_bits() == other.updated_at.to_bits()
            && self.last_activity_at.to_bits() == other.last_activity_at.to_bits()
            && self.soft_deleted == other.soft_deleted
    }
}

/// Replication direction for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Direction {
    pub source: Destination,
    pub target: Destination,
}

impl Direction {
    pub const fn new(source: Destination, target: Destination) -> Self {
        Self { source, target }
    }

    #[must_use]
    pub const fn reversed(self) -> Self {
        Self {
            source: self.target,
            target: self.source,
        }
    }

    /// Stable key used by the cursor table.
    pub fn key(self) -> String {
        format!("{}->{}", self.source, self.target)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (source, target) = s
            .split_once("->")
            .ok_or_else(|| Error::InvalidInput(format!("direction '{s}' must look like A->B")))?;
        Ok(Self::new(source.parse()?, target.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(created: f64, updated: f64, activity: f64) -> Record {
        Record {
            id: RecordId::from(1),
            natural_key: "alice".into(),
            payload: Payload::new(),
            created_at: created,
            updated_at: updated,
            last_activity_at: activity,
            soft_deleted: false,
        }
    }

    #[test]
    fn effective_ts_takes_latest_stamp() {
        assert!((record(10.0, 20.0, 15.0).effective_ts() - 20.0).abs() < f64::EPSILON);
        assert!((record(10.0, 20.0, 35.5).effective_ts() - 35.5).abs() < f64::EPSILON);
    }

    #[test]
    fn changed_since_checks_every_timestamp() {
        let rec = record(10.0, 10.0, 50.0);
        assert!(rec.changed_since(40.0));
        assert!(!rec.changed_since(50.0));
    }

    #[test]
    fn validate_rejects_update_before_create() {
        assert!(record(20.0, 10.0, 20.0).validate().is_err());
        assert!(record(10.0, 10.0, 10.0).validate().is_ok());
    }

    #[test]
    fn for_target_keeps_content_and_swaps_id() {
        let rec = record(1.0, 2.0, 3.0);
        let target = rec.for_target(RecordId::from(99));
        assert_eq!(target.id.as_str(), "99");
        assert!(target.same_content(&rec));
    }

    #[test]
    fn tombstone_never_moves_updated_at_backwards() {
        let rec = record(1.0, 500.0, 3.0);
        let tomb = rec.tombstone(100.0);
        assert!(tomb.soft_deleted);
        assert!((tomb.updated_at - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn entity_type_parses_singular_and_plural() {
        assert_eq!("users".parse::<EntityType>().unwrap(), EntityType::User);
        assert_eq!("document".parse::<EntityType>().unwrap(), EntityType::Document);
        assert_eq!(
            "config_items".parse::<EntityType>().unwrap(),
            EntityType::ConfigItem
        );
        assert!("widgets".parse::<EntityType>().is_err());
    }

    #[test]
    fn natural_key_validation_per_entity() {
        assert!(EntityType::Document.validate_natural_key("q3-review").is_ok());
        assert!(EntityType::Document.validate_natural_key("Q3 Review").is_err());
        assert!(EntityType::Slide.validate_natural_key("q3-review/4").is_ok());
        assert!(EntityType::Slide.validate_natural_key("q3-review").is_err());
        assert!(EntityType::User.validate_natural_key("alice.smith").is_ok());
    }

    #[test]
    fn direction_roundtrips_through_key() {
        let direction = Direction::new(Destination::Local, Destination::External);
        assert_eq!(direction.key(), "LOCAL->EXTERNAL");
        assert_eq!(direction.key().parse::<Direction>().unwrap(), direction);
        assert_eq!(
            direction.reversed(),
            Direction::new(Destination::External, Destination::Local)
        );
    }
}
