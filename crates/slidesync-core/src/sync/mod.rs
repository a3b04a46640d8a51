//! Reconciliation, tiering and the sync engine.

mod engine;
mod gate;
mod hot;
mod outcome;
mod policy;
mod reconciler;
mod snapshot_merge;
mod status;

pub use engine::{CycleReport, EngineSettings, RouteFailure, SyncEngine, SyncEngineBuilder};
pub use gate::{DeploymentGate, DeploymentMode, StaticGate};
pub use hot::HotSet;
pub use outcome::{DeletionSummary, PassSummary, RecordError, RecordOutcome, SkipReason, SyncErrorKind};
pub use policy::{AuthoritativeSide, DeletionMode, EntityPolicy, Route, SyncPolicy, Tier};
pub use reconciler::{PassOptions, Reconciler};
pub use snapshot_merge::{MergeReport, SnapshotMerger};
pub use status::{EngineStatus, EntityStatus, PairState, PairStatus, RouteStatus};
