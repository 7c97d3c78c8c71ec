use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub const DEFAULT_TOWER_ADDRESS: &str = "127.0.0.1:8080";

/// Settings shared between the monitor and whoever edits them.
pub type SharedConfig = Arc<RwLock<UserConfig>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserConfig {
    /// Lighthouse (tower) address, `host:port`
    pub tower_address: String,
    /// Invite code used to join an organization
    pub invite_code: String,
    /// Host name requested when redeeming an invite
    pub host_name: Option<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            tower_address: DEFAULT_TOWER_ADDRESS.to_string(),
            invite_code: String::new(),
            host_name: None,
        }
    }
}

impl UserConfig {
    /// $NEBULA_TOWER_CONFIG_DIR/config.toml or ~/.config/nebula-tower/config.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_file()
    }

    /// Reads settings, writing defaults when the file does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading user config");

        if !path.exists() {
            tracing::debug!("Config file does not exist, writing defaults");
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(tower_address = %config.tower_address, "User config loaded");
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        tracing::trace!(path = %path.display(), "Saving user config");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        tracing::trace!("User config saved");
        Ok(())
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}
