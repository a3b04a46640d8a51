//! Database connection management

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::fmt;
use std::path::{Path, PathBuf};

use super::migrations;
use crate::error::{Error, Result};

/// Connection settings for a remote libSQL (Turso) database
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Remote database URL (e.g., `libsql://your-db.turso.io`)
    pub url: String,
    /// Authentication token for remote database
    pub auth_token: String,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
    Remote(String),
}

/// Database wrapper for libSQL connections
pub struct Database {
    db: LibSqlDatabase,
    conn: Connection,
    location: Location,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new_local(&path).build().await?;
        let conn = db.connect()?;

        let database = Self {
            db,
            conn,
            location: Location::File(path),
        };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        let database = Self {
            db,
            conn,
            location: Location::Memory,
        };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Open a remote libSQL database used as the external destination
    pub async fn open_remote(config: &RemoteConfig) -> Result<Self> {
        let db = Builder::new_remote(config.url.clone(), config.auth_token.clone())
            .build()
            .await?;
        let conn = db.connect()?;

        let database = Self {
            db,
            conn,
            location: Location::Remote(config.url.clone()),
        };
        database.configure().await?;
        database.migrate().await?;
        tracing::debug!("Connected to remote database {}", config.url);
        Ok(database)
    }

    /// Configure `SQLite` for concurrent readers during sync writes
    async fn configure(&self) -> Result<()> {
        if matches!(self.location, Location::Remote(_)) {
            return Ok(());
        }
        // Pragmas that report their new value come back as rows, so use query.
        self.conn.query("PRAGMA journal_mode = WAL;", ()).await.ok();
        self.conn.query("PRAGMA busy_timeout = 5000;", ()).await.ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Get a reference to the primary connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Open an additional connection to the same database.
    ///
    /// In-memory databases are private to their connection, so the primary
    /// connection is shared instead.
    pub fn connect(&self) -> Result<Connection> {
        match self.location {
            Location::Memory => Ok(self.conn.clone()),
            Location::File(_) | Location::Remote(_) => Ok(self.db.connect()?),
        }
    }

    /// Filesystem path for file-backed databases.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory | Location::Remote(_) => None,
        }
    }

    pub const fn is_remote(&self) -> bool {
        matches!(self.location, Location::Remote(_))
    }

    /// Write a consistent point-in-time copy of this database to `target`.
    pub async fn snapshot_to(&self, target: &Path) -> Result<()> {
        if self.is_remote() {
            return Err(Error::InvalidInput(
                "snapshots can only be taken of local databases".into(),
            ));
        }
        if target.exists() {
            std::fs::remove_file(target)?;
        }
        let escaped = target.to_string_lossy().replace('\'', "''");
        self.conn
            .execute(&format!("VACUUM INTO '{escaped}'"), ())
            .await?;
        Ok(())
    }
}
