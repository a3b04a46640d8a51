//! Database layer for slidesync

mod conflict_ledger;
mod connection;
mod cursor_store;
mod id_map;
mod migrations;

pub use conflict_ledger::{ConflictFilter, ConflictLedger};
pub use connection::{Database, RemoteConfig};
pub use cursor_store::CursorStore;
pub use id_map::IdMap;
