//! Cross-destination surrogate id correspondence

use libsql::Connection;

use crate::error::Result;
use crate::models::{Destination, EntityType, RecordId};
use crate::util::now_ts;

/// Remembers which id on one destination the engine has written as the
/// counterpart of an id on another destination.
#[derive(Clone)]
pub struct IdMap {
    conn: Connection,
}

impl IdMap {
    /// Create a new map with the given connection
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Record that `from` and `to` hold the same logical entity.
    ///
    /// Both orientations are stored so lookups work for either direction.
    pub async fn link(
        &self,
        entity: EntityType,
        from: (Destination, &RecordId),
        to: (Destination, &RecordId),
        natural_key: &str,
    ) -> Result<()> {
        let now = now_ts();
        for ((from_dest, from_id), (to_dest, to_id)) in [(from, to), (to, from)] {
            self.conn
                .execute(
                    "INSERT INTO sync_id_map
                        (entity_type, from_destination, from_id, to_destination, to_id, natural_key, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(entity_type, from_destination, from_id, to_destination)
                     DO UPDATE SET to_id = excluded.to_id,
                                   natural_key = excluded.natural_key,
                                   updated_at = excluded.updated_at",
                    libsql::params![
                        entity.as_str(),
                        from_dest.as_str(),
                        from_id.as_str(),
                        to_dest.as_str(),
                        to_id.as_str(),
                        natural_key,
                        now
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Id on `to_dest` previously linked to `from_id` on `from_dest`.
    pub async fn lookup(
        &self,
        entity: EntityType,
        from_dest: Destination,
        from_id: &RecordId,
        to_dest: Destination,
    ) -> Result<Option<RecordId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT to_id FROM sync_id_map
                 WHERE entity_type = ? AND from_destination = ? AND from_id = ? AND to_destination = ?",
                libsql::params![
                    entity.as_str(),
                    from_dest.as_str(),
                    from_id.as_str(),
                    to_dest.as_str()
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(RecordId::new(row.get::<String>(0)?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn link_is_visible_from_both_sides() {
        let db = Database::open_in_memory().await.unwrap();
        let map = IdMap::new(db.connect().unwrap());
        let local = RecordId::from(7);
        let external = RecordId::from(1042);

        map.link(
            EntityType::User,
            (Destination::Local, &local),
            (Destination::External, &external),
            "alice",
        )
        .await
        .unwrap();

        assert_eq!(
            map.lookup(EntityType::User, Destination::Local, &local, Destination::External)
                .await
                .unwrap(),
            Some(external.clone())
        );
        assert_eq!(
            map.lookup(EntityType::User, Destination::External, &external, Destination::Local)
                .await
                .unwrap(),
            Some(local)
        );
        assert!(map
            .lookup(EntityType::Document, Destination::Local, &RecordId::from(7), Destination::External)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn relinking_replaces_previous_counterpart() {
        let db = Database::open_in_memory().await.unwrap();
        let map = IdMap::new(db.connect().unwrap());
        let local = RecordId::from(1);

        for external in [RecordId::from(10), RecordId::from(11)] {
            map.link(
                EntityType::Template,
                (Destination::Local, &local),
                (Destination::External, &external),
                "corporate",
            )
            .await
            .unwrap();
        }

        assert_eq!(
            map.lookup(EntityType::Template, Destination::Local, &local, Destination::External)
                .await
                .unwrap(),
            Some(RecordId::from(11))
        );
    }
}
