//! Deployment mode gate

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Destination;

/// Which destinations a deployment runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    LocalOnly,
    LocalExternal,
    LocalBackup,
    LocalExternalBackup,
}

impl DeploymentMode {
    /// Mode implied by the destinations that are configured.
    pub const fn from_configured(external: bool, backup: bool) -> Self {
        match (external, backup) {
            (false, false) => Self::LocalOnly,
            (true, false) => Self::LocalExternal,
            (false, true) => Self::LocalBackup,
            (true, true) => Self::LocalExternalBackup,
        }
    }

    pub const fn destinations(self) -> &'static [Destination] {
        match self {
            Self::LocalOnly => &[Destination::Local],
            Self::LocalExternal => &[Destination::Local, Destination::External],
            Self::LocalBackup => &[Destination::Local, Destination::Backup],
            Self::LocalExternalBackup => &[
                Destination::Local,
                Destination::External,
                Destination::Backup,
            ],
        }
    }

    pub fn includes(self, destination: Destination) -> bool {
        self.destinations().contains(&destination)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::LocalExternal => "local_external",
            Self::LocalBackup => "local_backup",
            Self::LocalExternalBackup => "local_external_backup",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local_only" => Ok(Self::LocalOnly),
            "local_external" => Ok(Self::LocalExternal),
            "local_backup" => Ok(Self::LocalBackup),
            "local_external_backup" => Ok(Self::LocalExternalBackup),
            other => Err(Error::InvalidInput(format!(
                "unknown deployment mode '{other}'"
            ))),
        }
    }
}

/// Answers which destinations are active for the current deployment.
pub trait DeploymentGate: Send + Sync {
    fn current_mode(&self) -> DeploymentMode;

    /// Destinations that have an adapter configured.
    fn configured(&self) -> BTreeSet<Destination>;

    /// Destinations both enabled by the mode and configured.
    fn active(&self) -> BTreeSet<Destination> {
        let mode = self.current_mode();
        self.configured()
            .into_iter()
            .filter(|destination| mode.includes(*destination))
            .collect()
    }
}

/// Gate fixed at startup from configuration.
#[derive(Debug, Clone)]
pub struct StaticGate {
    mode: DeploymentMode,
    configured: BTreeSet<Destination>,
}

impl StaticGate {
    /// Build a gate for the configured destinations, with an optional
    /// explicit mode that may narrow (but never widen) them.
    pub fn new(configured: BTreeSet<Destination>, mode: Option<DeploymentMode>) -> Self {
        let derived = DeploymentMode::from_configured(
            configured.contains(&Destination::External),
            configured.contains(&Destination::Backup),
        );
        let mode = mode.unwrap_or(derived);
        for destination in mode.destinations() {
            if !configured.contains(destination) {
                tracing::warn!(
                    mode = %mode,
                    destination = %destination,
                    "Deployment mode names an unconfigured destination; it stays disabled"
                );
            }
        }
        Self { mode, configured }
    }
}

impl DeploymentGate for StaticGate {
    fn current_mode(&self) -> DeploymentMode {
        self.mode
    }

    fn configured(&self) -> BTreeSet<Destination> {
        self.configured.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_is_derived_from_configured_destinations() {
        let gate = StaticGate::new(
            BTreeSet::from([Destination::Local, Destination::Backup]),
            None,
        );
        assert_eq!(gate.current_mode(), DeploymentMode::LocalBackup);
        assert_eq!(
            gate.active(),
            BTreeSet::from([Destination::Local, Destination::Backup])
        );
    }

    #[test]
    fn explicit_mode_narrows_active_destinations() {
        let gate = StaticGate::new(
            BTreeSet::from(Destination::ALL),
            Some(DeploymentMode::LocalExternal),
        );
        assert_eq!(
            gate.active(),
            BTreeSet::from([Destination::Local, Destination::External])
        );
    }

    #[test]
    fn explicit_mode_cannot_enable_missing_destination() {
        let gate = StaticGate::new(
            BTreeSet::from([Destination::Local]),
            Some(DeploymentMode::LocalExternalBackup),
        );
        assert_eq!(gate.active(), BTreeSet::from([Destination::Local]));
    }

    #[test]
    fn mode_parses() {
        assert_eq!(
            "LOCAL_EXTERNAL_BACKUP".parse::<DeploymentMode>().unwrap(),
            DeploymentMode::LocalExternalBackup
        );
        assert!("cloud".parse::<DeploymentMode>().is_err());
    }
}
