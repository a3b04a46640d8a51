//! slidesync-core - Core library for slidesync
//!
//! Records, destination adapters, the reconciler and the tier scheduler
//! that keep the local store, an optional external relational store and an
//! optional object-storage backup in agreement.

pub mod adapter;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod storage;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Destination, Direction, EntityType, Record, RecordId};
pub use sync::{SyncEngine, SyncPolicy};
