//! Agent configuration: control-plane endpoint, identity, and the knobs the
//! self-update subsystem needs. Grounded in the teacher's
//! `config/loader.rs` persistence pattern (secure file permissions,
//! load-existing-or-create-default, TOCTOU-safe load), adapted from JSON to
//! TOML and from the team/hooks shape to the agent's own.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::{DEFAULT_INSTALL_PATH, DEFAULT_SERVICE_NAME, project_config_dir};

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the control plane, e.g. `https://cp.example.com`.
    pub control_plane_url: String,

    /// This host's agent identity, used in the update-check path and
    /// signed-header set.
    pub agent_id: String,

    /// Name of the systemd unit this agent runs under.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Path the running binary is installed at and the upgrader replaces.
    #[serde(default = "default_install_path")]
    pub install_path: String,

    /// Seconds between `SelfUpdateJob` poll attempts.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// URL the health checker polls after a restart.
    #[serde(default)]
    pub health_url: String,
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

fn default_install_path() -> String {
    DEFAULT_INSTALL_PATH.to_string()
}

const fn default_poll_interval_secs() -> u64 {
    60 * 60
}

impl AgentConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn load_existing(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("unable to parse {}", path.display()))
    }

    /// Loads the config from the project config directory, creating a blank
    /// default if none exists yet. Existing files get their permissions
    /// upgraded to 0600 lazily (for installations predating that lockdown).
    pub fn load() -> Result<Self> {
        let config_dir = project_config_dir()?;
        let config_file = config_dir.join(CONFIG_FILE_NAME);

        debug!("loading agent config from {}", config_file.display());

        match Self::load_existing(&config_file) {
            Ok(config) => {
                fix_permissions(&config_file)?;
                Ok(config)
            }
            Err(e) if !config_file.exists() => {
                debug!("no config file at {}, using defaults: {e}", config_file.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_dir = project_config_dir()?;
        self.save_to_path(&config_dir.join(CONFIG_FILE_NAME))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let serialized = toml::to_string_pretty(self).context("unable to serialize agent config")?;
        write_0600(path, serialized.as_bytes())
            .with_context(|| format!("unable to write {}", path.display()))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_plane_url: String::new(),
            agent_id: String::new(),
            service_name: default_service_name(),
            install_path: default_install_path(),
            poll_interval_secs: default_poll_interval_secs(),
            health_url: String::new(),
        }
    }
}

#[cfg(unix)]
fn write_0600(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_0600(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

#[cfg(unix)]
fn fix_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).with_context(|| format!("unable to stat {}", path.display()))?;
    if metadata.permissions().mode() & 0o777 != 0o600 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("unable to fix permissions on {}", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn fix_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
