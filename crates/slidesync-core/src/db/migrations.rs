//! Database migrations

use crate::error::Result;
use crate::models::EntityType;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Apply a list of statements atomically and record the version
async fn apply(conn: &Connection, version: i32, statements: &[String]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            [i64::from(version)],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: one record table per entity type
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec!["CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
    .to_string()];

    for entity in EntityType::ALL {
        let table = entity.as_str();
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                natural_key TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL DEFAULT '{{}}',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                last_activity_at REAL NOT NULL,
                soft_deleted INTEGER NOT NULL DEFAULT 0,
                CHECK (updated_at >= created_at)
            )"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_activity ON {table}(last_activity_at)"
        ));
    }

    apply(conn, 1, &statements).await
}

/// Migration to version 2: cursors, id map and the conflict ledger
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_cursors (
            entity_type TEXT NOT NULL,
            direction TEXT NOT NULL,
            last_successful_run_at REAL NOT NULL,
            PRIMARY KEY (entity_type, direction)
        )",
        "CREATE TABLE IF NOT EXISTS sync_id_map (
            entity_type TEXT NOT NULL,
            from_destination TEXT NOT NULL,
            from_id TEXT NOT NULL,
            to_destination TEXT NOT NULL,
            to_id TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            updated_at REAL NOT NULL,
            PRIMARY KEY (entity_type, from_destination, from_id, to_destination)
        )",
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            source_destination TEXT NOT NULL,
            target_destination TEXT NOT NULL,
            source_id TEXT,
            target_id TEXT,
            natural_key_attempted TEXT NOT NULL,
            reason TEXT NOT NULL,
            payload_snapshot TEXT NOT NULL,
            created_at REAL NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_at REAL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_pending ON sync_conflicts(entity_type, resolved)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_key ON sync_conflicts(natural_key_attempted)",
        // Ledger rows are append-only; operators may only flip `resolved`.
        "CREATE TRIGGER IF NOT EXISTS sync_conflicts_append_only BEFORE UPDATE ON sync_conflicts
         FOR EACH ROW
         WHEN NEW.entity_type IS NOT OLD.entity_type
           OR NEW.source_destination IS NOT OLD.source_destination
           OR NEW.target_destination IS NOT OLD.target_destination
           OR NEW.source_id IS NOT OLD.source_id
           OR NEW.target_id IS NOT OLD.target_id
           OR NEW.natural_key_attempted IS NOT OLD.natural_key_attempted
           OR NEW.reason IS NOT OLD.reason
           OR NEW.payload_snapshot IS NOT OLD.payload_snapshot
           OR NEW.created_at IS NOT OLD.created_at
         BEGIN
             SELECT RAISE(ABORT, 'sync_conflicts is append-only');
         END",
        "CREATE TRIGGER IF NOT EXISTS sync_conflicts_no_delete BEFORE DELETE ON sync_conflicts
         BEGIN
             SELECT RAISE(ABORT, 'sync_conflicts is append-only');
         END",
    ]
    .map(str::to_string);

    apply(conn, CURRENT_VERSION, &statements).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
                [name],
            )
            .await
            .unwrap();
        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_entity_and_state_table_exists() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for entity in EntityType::ALL {
            assert!(table_exists(&conn, entity.as_str()).await, "{entity}");
        }
        for table in ["sync_cursors", "sync_id_map", "sync_conflicts"] {
            assert!(table_exists(&conn, table).await, "{table}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_tables_reject_update_before_create() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let result = conn
            .execute(
                "INSERT INTO users (natural_key, created_at, updated_at, last_activity_at)
                 VALUES ('bob', 10.0, 5.0, 10.0)",
                (),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_rows_cannot_be_deleted() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO sync_conflicts (entity_type, source_destination, target_destination,
                natural_key_attempted, reason, payload_snapshot, created_at)
             VALUES ('users', 'LOCAL', 'EXTERNAL', 'carol', 'integrity_error', '{}', 1.0)",
            (),
        )
        .await
        .unwrap();

        assert!(conn.execute("DELETE FROM sync_conflicts", ()).await.is_err());
        assert!(conn
            .execute("UPDATE sync_conflicts SET reason = 'id_mapping_mismatch'", ())
            .await
            .is_err());
        conn.execute("UPDATE sync_conflicts SET resolved = 1, resolved_at = 2.0", ())
            .await
            .unwrap();
    }
}
