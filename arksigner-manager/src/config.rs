//! Per-invocation configuration and the optional defaults file.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_DEB: &str = "https://downloads.arksigner.com/files/arksigner-pub-2.3.12.deb";
pub const DEFAULT_SUITE: &str = "bullseye";
pub const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";
pub const DEFAULT_MACHINE: &str = "debian-arksigner";

/// Deployment strategy. Each mode owns a disjoint set of host paths and units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Container,
    Native,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMode::Container => "container",
            DeploymentMode::Native => "native",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    Install,
    Upgrade,
    Status,
    Repair,
    Uninstall,
    Purge,
}

impl Action {
    /// Everything except `status` changes host state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Action::Status)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Status => "status",
            Action::Repair => "repair",
            Action::Uninstall => "uninstall",
            Action::Purge => "purge",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an install or upgrade needs, fixed for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    pub mode: DeploymentMode,
    pub package_source: String,
    pub machine_name: String,
    pub suite: String,
    pub mirror: String,
    pub recreate: bool,
    pub native_rpath_opt_in: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::Container,
            package_source: DEFAULT_DEB.to_string(),
            machine_name: DEFAULT_MACHINE.to_string(),
            suite: DEFAULT_SUITE.to_string(),
            mirror: DEFAULT_MIRROR.to_string(),
            recreate: false,
            native_rpath_opt_in: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOptions {
    /// Send SIGKILL to the container before the normal teardown.
    pub force_terminate: bool,
    /// Drop and rewrite the persisted mount-table line.
    pub recreate_mounts: bool,
    /// Reload the unit cache and clear failed state.
    pub clear_cache: bool,
}

/// Whose Firefox profiles receive the PKCS#11 module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirefoxTarget {
    pub user: String,
    pub home: PathBuf,
}

/// A fully resolved backend invocation.
#[derive(Debug, Clone)]
pub struct Request {
    pub action: Action,
    pub install: InstallConfig,
    pub repair: RepairOptions,
    pub firefox: Option<FirefoxTarget>,
    pub json: bool,
}

impl Request {
    pub fn new(action: Action, install: InstallConfig) -> Self {
        Self {
            action,
            install,
            repair: RepairOptions::default(),
            firefox: None,
            json: false,
        }
    }

    pub fn mode(&self) -> DeploymentMode {
        self.install.mode
    }
}

/// Site defaults read from a JSON file.
///
/// ```json
/// { "deb": "auto", "machine": "debian-arksigner" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub deb: Option<String>,
    pub suite: Option<String>,
    pub mirror: Option<String>,
    pub machine: Option<String>,
    pub index_url: Option<String>,
}

impl ManagerConfig {
    pub const DEFAULT_PATH: &'static str = "/etc/arksigner-manager/config.json";
    pub const PATH_ENV: &'static str = "ARKSIGNER_MANAGER_CONFIG";

    /// Load from `$ARKSIGNER_MANAGER_CONFIG` or the default path.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(Self::PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_PATH));
        Self::load_optional(&path)
    }

    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load_optional(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config from {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read config from {}", path.display()))
            }
        }
    }

    pub fn deb(&self) -> &str {
        self.deb.as_deref().unwrap_or(DEFAULT_DEB)
    }

    pub fn suite(&self) -> &str {
        self.suite.as_deref().unwrap_or(DEFAULT_SUITE)
    }

    pub fn mirror(&self) -> &str {
        self.mirror.as_deref().unwrap_or(DEFAULT_MIRROR)
    }

    pub fn machine(&self) -> &str {
        self.machine.as_deref().unwrap_or(DEFAULT_MACHINE)
    }

    pub fn index_url(&self) -> &str {
        self.index_url
            .as_deref()
            .unwrap_or(arksigner_fetch::resolver::DEFAULT_INDEX_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig::load_optional(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.deb(), DEFAULT_DEB);
        assert_eq!(config.machine(), "debian-arksigner");
        assert_eq!(config.index_url(), "https://downloads.arksigner.com/files/");
    }

    #[test]
    fn partial_config_overrides_only_given_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"deb": "auto", "suite": "bookworm"}"#).unwrap();
        let config = ManagerConfig::load_optional(&path).unwrap();
        assert_eq!(config.deb(), "auto");
        assert_eq!(config.suite(), "bookworm");
        assert_eq!(config.mirror(), DEFAULT_MIRROR);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ deb: ").unwrap();
        let err = ManagerConfig::load_optional(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mode": "native"}"#).unwrap();
        assert!(ManagerConfig::load_optional(&path).is_err());
    }

    #[test]
    fn only_status_is_read_only() {
        assert!(!Action::Status.is_mutating());
        for action in [
            Action::Install,
            Action::Upgrade,
            Action::Repair,
            Action::Uninstall,
            Action::Purge,
        ] {
            assert!(action.is_mutating(), "{action}");
        }
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DeploymentMode::Native).unwrap(),
            "\"native\""
        );
        assert_eq!(DeploymentMode::default().to_string(), "container");
    }
}
