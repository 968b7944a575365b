//! Configuration inputs for the upgrade checker.
//!
//! Splits into the static per-build [`CheckerConfig`] (distribution channel,
//! upgrade sources, shared data directory) and the cross-process
//! [`SharedPreferences`] file, which is re-read from disk on every policy
//! evaluation because the main application process may rewrite it at any
//! time.

use crate::error::{Result, UpgradeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How this installation was distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionChannel {
    /// Downloaded directly from the project and able to replace itself.
    Direct,
    /// Installed through an app storefront. Storefront builds must not
    /// self-upgrade.
    Storefront,
}

/// Static configuration for the checker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Distribution channel of this build.
    pub distribution: DistributionChannel,
    /// Upgrade source URLs embedded in this build. Empty means there is
    /// nowhere to download an upgrade from.
    pub upgrade_sources: Vec<String>,
    /// Directory shared by both writer processes for upgrade state.
    pub data_dir: PathBuf,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            distribution: DistributionChannel::Direct,
            upgrade_sources: Vec::new(),
            data_dir: default_data_dir().unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

impl CheckerConfig {
    /// Returns `true` when this build is permitted to upgrade itself.
    ///
    /// Requires at least one configured upgrade source and a direct
    /// distribution; storefront installs always answer `false`.
    pub fn allows_self_upgrade(&self) -> bool {
        if self.upgrade_sources.is_empty() {
            // We don't know where to find an upgrade.
            return false;
        }
        self.distribution == DistributionChannel::Direct
    }

    /// Directory holding the shared upgrade artifact files.
    pub fn upgrade_dir(&self) -> PathBuf {
        self.data_dir.join("upgrade")
    }

    /// Path of the cross-process preference file.
    pub fn preferences_path(&self) -> PathBuf {
        self.data_dir.join("preferences.json")
    }

    /// Path of the recurring-trigger registration record.
    pub fn trigger_registration_path(&self) -> PathBuf {
        self.data_dir.join("upgrade-trigger.json")
    }
}

/// Default shared data directory (`~/.local/share/burrow` or the platform
/// equivalent).
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("burrow"))
}

/// User preferences shared across both writer processes.
///
/// Both the main application and the checker read and write this file, so
/// values are never cached across wake-ups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedPreferences {
    /// Restrict upgrade downloads to unmetered networks.
    pub unmetered_only: bool,
    /// Disable transport-level timeouts (passed through to the tunnel).
    pub disable_timeouts: bool,
}

impl SharedPreferences {
    /// Load preferences from disk. Returns defaults if the file is missing
    /// or cannot be parsed.
    pub fn load(path: &Path) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => return Self::default(),
        };

        serde_json::from_slice(&bytes).unwrap_or_default()
    }

    /// Persist preferences to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpgradeError::Config(format!(
                    "cannot create preferences directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| UpgradeError::Config(format!("cannot serialize preferences: {e}")))?;

        std::fs::write(path, json).map_err(|e| {
            UpgradeError::Config(format!("cannot write preferences to {}: {e}", path.display()))
        })?;

        Ok(())
    }
}

/// Broad class of the currently active network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Wi-Fi, ethernet, or another connection without usage charges.
    Unmetered,
    /// Cellular or another connection where downloads cost the user.
    Metered,
}

/// Source of the current network type, implemented by the host platform
/// layer.
pub trait NetworkStatus: Send + Sync {
    /// Returns the class of the currently active network.
    fn network_type(&self) -> NetworkType;
}
