//! Persistent sync cursors, one per (entity type, direction)

use libsql::Connection;

use crate::error::Result;
use crate::models::{Direction, EntityType, SyncCursor};
use crate::util::Timestamp;

/// libSQL-backed cursor table. Writes are single upserts, so concurrent
/// tiers only contend on their own rows.
#[derive(Clone)]
pub struct CursorStore {
    conn: Connection,
}

impl CursorStore {
    /// Create a new store with the given connection
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, entity: EntityType, direction: Direction) -> Result<Option<SyncCursor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_successful_run_at FROM sync_cursors
                 WHERE entity_type = ? AND direction = ?",
                [entity.as_str().to_string(), direction.key()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(SyncCursor {
                entity_type: entity,
                direction,
                last_successful_run_at: row.get::<f64>(0)?,
            })),
            None => Ok(None),
        }
    }

    /// Cursor time for the pair, or the epoch when no pass has completed yet.
    pub async fn position(&self, entity: EntityType, direction: Direction) -> Result<Timestamp> {
        Ok(self
            .get(entity, direction)
            .await?
            .map_or(0.0, |cursor| cursor.last_successful_run_at))
    }

    /// Record a completed pass.
    pub async fn advance(
        &self,
        entity: EntityType,
        direction: Direction,
        run_at: Timestamp,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_cursors (entity_type, direction, last_successful_run_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(entity_type, direction)
                 DO UPDATE SET last_successful_run_at = excluded.last_successful_run_at",
                libsql::params![entity.as_str(), direction.key(), run_at],
            )
            .await?;
        Ok(())
    }

    /// Every cursor recorded so far.
    pub async fn list(&self) -> Result<Vec<SyncCursor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, direction, last_successful_run_at
                 FROM sync_cursors ORDER BY entity_type, direction",
                (),
            )
            .await?;

        let mut cursors = Vec::new();
        while let Some(row) = rows.next().await? {
            let entity: String = row.get(0)?;
            let direction: String = row.get(1)?;
            cursors.push(SyncCursor {
                entity_type: entity.parse()?,
                direction: direction.parse()?,
                last_successful_run_at: row.get::<f64>(2)?,
            });
        }
        Ok(cursors)
    }
}
