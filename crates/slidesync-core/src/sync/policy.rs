//! Which entity types replicate where, and how often.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Destination, Direction, EntityType};

/// Priority class sharing one scheduling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Critical,
    High,
    Medium,
    Low,
    OnDemand,
    LocalOnly,
}

impl Tier {
    /// Tiers driven by their own timer loop.
    pub const TIMED: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::OnDemand => "on_demand",
            Self::LocalOnly => "local_only",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "on_demand" => Ok(Self::OnDemand),
            "local_only" => Ok(Self::LocalOnly),
            other => Err(Error::InvalidInput(format!("unknown tier '{other}'"))),
        }
    }
}

/// Which side wins when both hold the natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthoritativeSide {
    /// Source overwrites regardless of timestamps
    Source,
    /// Existing target rows are never overwritten
    Target,
    /// Most recent effective timestamp wins
    Timestamp,
}

/// How orphaned target rows are removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionMode {
    #[default]
    Hard,
    Tombstone,
}

/// One replication direction for an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub source: Destination,
    pub target: Destination,
    pub authoritative: AuthoritativeSide,
    /// Run deletion propagation every N completed passes; 0 disables it.
    #[serde(default)]
    pub deletions_every_cycles: u32,
}

impl Route {
    pub const fn new(source: Destination, target: Destination, authoritative: AuthoritativeSide) -> Self {
        Self {
            source,
            target,
            authoritative,
            deletions_every_cycles: 0,
        }
    }

    #[must_use]
    pub const fn with_deletions_every(mut self, cycles: u32) -> Self {
        self.deletions_every_cycles = cycles;
        self
    }

    pub const fn direction(&self) -> Direction {
        Direction::new(self.source, self.target)
    }
}

/// Replication settings for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPolicy {
    pub entity_type: EntityType,
    pub tier: Tier,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Pull into LOCAL before the timer loops start
    #[serde(default)]
    pub startup_sync: bool,
    #[serde(default)]
    pub deletion_mode: DeletionMode,
}

impl EntityPolicy {
    pub const fn syncs(&self) -> bool {
        !matches!(self.tier, Tier::LocalOnly)
    }
}

/// Complete replication policy, validated once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub entities: Vec<EntityPolicy>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        use AuthoritativeSide::Timestamp;
        use Destination::{Backup, External, Local};

        let entity = |entity_type, tier, routes: Vec<Route>| EntityPolicy {
            entity_type,
            tier,
            routes,
            startup_sync: false,
            deletion_mode: DeletionMode::Hard,
        };

        Self {
            entities: vec![
                EntityPolicy {
                    startup_sync: true,
                    deletion_mode: DeletionMode::Tombstone,
                    ..entity(
                        EntityType::User,
                        Tier::Critical,
                        vec![
                            Route::new(Local, External, Timestamp).with_deletions_every(10),
                            Route::new(External, Local, Timestamp),
                        ],
                    )
                },
                EntityPolicy {
                    startup_sync: true,
                    ..entity(
                        EntityType::ConfigItem,
                        Tier::Critical,
                        vec![
                            Route::new(Local, External, Timestamp).with_deletions_every(10),
                            Route::new(External, Local, Timestamp),
                        ],
                    )
                },
                EntityPolicy {
                    deletion_mode: DeletionMode::Tombstone,
                    ..entity(
                        EntityType::Document,
                        Tier::High,
                        vec![
                            Route::new(Local, External, Timestamp).with_deletions_every(6),
                            Route::new(External, Local, Timestamp),
                            Route::new(Local, Backup, Timestamp).with_deletions_every(24),
                        ],
                    )
                },
                entity(
                    EntityType::Slide,
                    Tier::Medium,
                    vec![
                        Route::new(Local, External, Timestamp).with_deletions_every(4),
                        Route::new(Local, Backup, Timestamp).with_deletions_every(12),
                    ],
                ),
                entity(
                    EntityType::Template,
                    Tier::Low,
                    vec![
                        Route::new(Backup, Local, Timestamp),
                        Route::new(Local, Backup, Timestamp),
                        Route::new(Local, External, AuthoritativeSide::Source)
                            .with_deletions_every(2),
                    ],
                ),
                entity(EntityType::Session, Tier::LocalOnly, Vec::new()),
            ],
        }
    }
}

impl SyncPolicy {
    /// Parse a JSON policy document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject policies the scheduler must never run.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for policy in &self.entities {
            if !seen.insert(policy.entity_type) {
                return Err(Error::InvariantViolation(format!(
                    "{} is assigned to more than one tier",
                    policy.entity_type
                )));
            }

            if policy.tier == Tier::LocalOnly {
                if !policy.routes.is_empty() || policy.startup_sync {
                    return Err(Error::InvariantViolation(format!(
                        "{} is LOCAL_ONLY but has replication routes",
                        policy.entity_type
                    )));
                }
                continue;
            }

            let mut directions = BTreeSet::new();
            for route in &policy.routes {
                if route.source == route.target {
                    return Err(Error::InvariantViolation(format!(
                        "{} route {} replicates a destination onto itself",
                        policy.entity_type,
                        route.direction()
                    )));
                }
                if route.source != Destination::Local && route.target != Destination::Local {
                    return Err(Error::InvariantViolation(format!(
                        "{} route {} does not involve LOCAL",
                        policy.entity_type,
                        route.direction()
                    )));
                }
                if !directions.insert(route.direction()) {
                    return Err(Error::InvariantViolation(format!(
                        "{} declares route {} twice",
                        policy.entity_type,
                        route.direction()
                    )));
                }
            }
            if policy.startup_sync && !policy.routes.iter().any(|route| route.target == Destination::Local) {
                return Err(Error::InvariantViolation(format!(
                    "{} requests startup sync without a route into LOCAL",
                    policy.entity_type
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, entity: EntityType) -> Option<&EntityPolicy> {
        self.entities
            .iter()
            .find(|policy| policy.entity_type == entity)
    }

    /// Entity policies assigned to `tier`, in declaration order.
    pub fn for_tier(&self, tier: Tier) -> impl Iterator<Item = &EntityPolicy> {
        self.entities
            .iter()
            .filter(move |policy| policy.tier == tier)
    }

    /// Whether the scheduler may ever reconcile `entity`.
    pub fn syncs(&self, entity: EntityType) -> bool {
        self.get(entity).is_some_and(EntityPolicy::syncs)
    }
}
