//! Environment-driven engine configuration and bootstrap.
//!
//! Every destination except LOCAL is optional. Which ones are present decides
//! the deployment mode unless `SLIDESYNC_DEPLOYMENT_MODE` narrows it.

use std::collections::{BTreeSet, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::adapter::{ObjectAdapter, SharedAdapter, SqlAdapter};
use crate::db::{Database, RemoteConfig};
use crate::models::Destination;
use crate::storage::{BlobStore, FsBlobStore, R2BlobStore, R2Config, SnapshotArchive};
use crate::sync::{DeploymentMode, EngineSettings, StaticGate, SyncEngine, SyncPolicy};

const DEFAULT_BACKUP_PREFIX: &str = "slidesync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

/// Where the EXTERNAL relational store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStoreConfig {
    Remote(RemoteConfig),
    /// Local file standing in for the external store
    File(PathBuf),
}

/// Where BACKUP objects and snapshots are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStoreConfig {
    R2(R2Config),
    /// Directory-backed blob store
    Filesystem(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub local_db_path: Option<PathBuf>,
    pub external: Option<ExternalStoreConfig>,
    pub backup: Option<BackupStoreConfig>,
    pub backup_prefix: String,
    pub deployment_mode: Option<DeploymentMode>,
    pub policy_path: Option<PathBuf>,
    pub settings: EngineSettings,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let local_db_path = optional_trimmed(&lookup, "SLIDESYNC_LOCAL_DB_PATH").map(PathBuf::from);

        let external = parse_external(&lookup)?;
        let backup = parse_backup(&lookup)?;
        let backup_prefix = value_or_default(&lookup, "SLIDESYNC_BACKUP_PREFIX", DEFAULT_BACKUP_PREFIX)
            .trim_matches('/')
            .to_string();
        if backup_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "SLIDESYNC_BACKUP_PREFIX must not be empty".to_string(),
            ));
        }

        let deployment_mode = optional_trimmed(&lookup, "SLIDESYNC_DEPLOYMENT_MODE")
            .map(|mode| {
                mode.parse::<DeploymentMode>()
                    .map_err(|error| ConfigError::Invalid(format!("SLIDESYNC_DEPLOYMENT_MODE: {error}")))
            })
            .transpose()?;
        let policy_path = optional_trimmed(&lookup, "SLIDESYNC_POLICY_PATH").map(PathBuf::from);

        let settings = EngineSettings {
            call_timeout: secs_in_range(&lookup, "SLIDESYNC_CALL_TIMEOUT_SECS", 30, 1, 300)?,
            critical_interval: secs_in_range(&lookup, "SLIDESYNC_CRITICAL_INTERVAL_SECS", 120, 1, 86_400)?,
            high_interval: secs_in_range(&lookup, "SLIDESYNC_HIGH_INTERVAL_SECS", 300, 1, 86_400)?,
            medium_interval: secs_in_range(&lookup, "SLIDESYNC_MEDIUM_INTERVAL_SECS", 900, 1, 86_400)?,
            low_interval: secs_in_range(&lookup, "SLIDESYNC_LOW_INTERVAL_SECS", 3_600, 1, 86_400)?,
            on_demand_interval: secs_in_range(&lookup, "SLIDESYNC_ON_DEMAND_INTERVAL_SECS", 15, 1, 3_600)?,
            hot_ttl: secs_in_range(&lookup, "SLIDESYNC_HOT_TTL_SECS", 300, 10, 86_400)?,
            tier_concurrency: usize::try_from(integer_in_range(
                &lookup,
                "SLIDESYNC_TIER_CONCURRENCY",
                1,
                1,
                16,
            )?)
            .unwrap_or(1),
            snapshot_interval: secs_in_range(&lookup, "SLIDESYNC_SNAPSHOT_INTERVAL_SECS", 86_400, 60, 604_800)?,
            snapshot_merge_interval: secs_in_range(
                &lookup,
                "SLIDESYNC_SNAPSHOT_MERGE_INTERVAL_SECS",
                21_600,
                60,
                604_800,
            )?,
            snapshot_retention: usize::try_from(integer_in_range(
                &lookup,
                "SLIDESYNC_SNAPSHOT_RETENTION",
                7,
                1,
                365,
            )?)
            .unwrap_or(7),
        };

        Ok(Self {
            local_db_path,
            external,
            backup,
            backup_prefix,
            deployment_mode,
            policy_path,
            settings,
        })
    }

    /// The configured policy file, or the built-in policy.
    pub fn load_policy(&self) -> crate::Result<SyncPolicy> {
        match &self.policy_path {
            Some(path) => {
                let policy = SyncPolicy::load(path)?;
                tracing::info!(path = %path.display(), "Loaded sync policy");
                Ok(policy)
            }
            None => Ok(SyncPolicy::default()),
        }
    }

    /// Open every configured store and build the engine around `local_db_path`.
    ///
    /// An external store that cannot be opened is left out with a warning so
    /// the local store keeps serving.
    pub async fn open_engine(&self, local_db_path: &Path) -> crate::Result<SyncEngine> {
        let policy = self.load_policy()?;
        let local = Arc::new(Database::open(local_db_path).await?);
        let mut builder = SyncEngine::builder(local)
            .policy(policy)
            .settings(self.settings.clone());
        let mut configured = BTreeSet::from([Destination::Local]);

        if let Some(external) = &self.external {
            match open_external(external).await {
                Ok(adapter) => {
                    builder = builder.external(adapter);
                    configured.insert(Destination::External);
                }
                Err(error) => tracing::warn!("External store unavailable at startup: {error}"),
            }
        }

        if let Some(backup) = &self.backup {
            let store: Arc<dyn BlobStore> = match backup {
                BackupStoreConfig::R2(config) => Arc::new(R2BlobStore::new(config.clone())),
                BackupStoreConfig::Filesystem(root) => Arc::new(FsBlobStore::new(root)?),
            };
            tracing::info!(backend = store.backend(), prefix = %self.backup_prefix, "Backup tier configured");
            builder = builder
                .backup(Arc::new(ObjectAdapter::new(store.clone(), &self.backup_prefix)))
                .snapshots(SnapshotArchive::new(store, &self.backup_prefix));
            configured.insert(Destination::Backup);
        }

        builder
            .gate(Arc::new(StaticGate::new(configured, self.deployment_mode)))
            .build()
    }
}

async fn open_external(config: &ExternalStoreConfig) -> crate::Result<SharedAdapter> {
    let db = match config {
        ExternalStoreConfig::Remote(remote) => Database::open_remote(remote).await?,
        ExternalStoreConfig::File(path) => Database::open(path).await?,
    };
    Ok(Arc::new(SqlAdapter::new(Destination::External, Arc::new(db))?))
}

fn parse_external(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<ExternalStoreConfig>, ConfigError> {
    let url = optional_trimmed(&lookup, "SLIDESYNC_EXTERNAL_DB_URL");
    let token = optional_trimmed(&lookup, "SLIDESYNC_EXTERNAL_AUTH_TOKEN");
    let path = optional_trimmed(&lookup, "SLIDESYNC_EXTERNAL_DB_PATH");

    match (url, token, path) {
        (None, None, None) => Ok(None),
        (Some(_), _, Some(_)) => Err(ConfigError::Invalid(
            "SLIDESYNC_EXTERNAL_DB_URL and SLIDESYNC_EXTERNAL_DB_PATH are mutually exclusive"
                .to_string(),
        )),
        (Some(url), Some(token), None) => {
            if !url.starts_with("libsql://") && !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(ConfigError::Invalid(
                    "SLIDESYNC_EXTERNAL_DB_URL must start with libsql://, https:// or http://"
                        .to_string(),
                ));
            }
            Ok(Some(ExternalStoreConfig::Remote(RemoteConfig::new(url, token))))
        }
        (Some(_), None, None) => Err(ConfigError::MissingVar("SLIDESYNC_EXTERNAL_AUTH_TOKEN")),
        (None, Some(_), None) => Err(ConfigError::MissingVar("SLIDESYNC_EXTERNAL_DB_URL")),
        (None, token, Some(path)) => {
            if token.is_some() {
                tracing::warn!("SLIDESYNC_EXTERNAL_AUTH_TOKEN is ignored for a file-backed external store");
            }
            Ok(Some(ExternalStoreConfig::File(PathBuf::from(path))))
        }
    }
}

fn parse_backup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<BackupStoreConfig>, ConfigError> {
    let r2 = R2Config::from_lookup(&lookup).map_err(|error| ConfigError::Invalid(error.to_string()))?;
    let fs_root = optional_trimmed(&lookup, "SLIDESYNC_BACKUP_FS_ROOT");

    match (r2, fs_root) {
        (Some(_), Some(_)) => Err(ConfigError::Invalid(
            "R2 credentials and SLIDESYNC_BACKUP_FS_ROOT are mutually exclusive".to_string(),
        )),
        (Some(r2), None) => Ok(Some(BackupStoreConfig::R2(r2))),
        (None, Some(root)) => Ok(Some(BackupStoreConfig::Filesystem(PathBuf::from(root)))),
        (None, None) => Ok(None),
    }
}

fn integer_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
        })?,
        None => default,
    };
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn secs_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<Duration, ConfigError> {
    integer_in_range(lookup, name, default, min, max).map(Duration::from_secs)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
