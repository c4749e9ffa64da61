use std::{env, fs, path::PathBuf, sync::OnceLock};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};

pub const PROJECT_NAME: &str = env!("CARGO_PKG_NAME");
pub const PROJECT_VERSION: &str = env!("GIT_VERSION");
pub const PROJECT_VERSION_HASH: &str = env!("GIT_HASH");

/// Default systemd service name managed by this agent.
pub const DEFAULT_SERVICE_NAME: &str = "hostlink";

/// Default install path for the agent binary on Linux-like systems.
#[cfg(unix)]
pub const DEFAULT_INSTALL_PATH: &str = "/usr/bin/hostlink";
#[cfg(windows)]
pub const DEFAULT_INSTALL_PATH: &str = "C:\\Program Files\\hostlink\\hostlink.exe";

/// Default base directory for update state (lock, state file, staging, backup).
#[cfg(unix)]
pub const DEFAULT_UPDATES_DIR: &str = "/var/lib/hostlink/updates";
#[cfg(windows)]
pub const DEFAULT_UPDATES_DIR: &str = "C:\\ProgramData\\hostlink\\updates";

pub const AGENT_TARBALL_NAME: &str = "hostlink.tar.gz";
pub const AGENT_BINARY_NAME: &str = "hostlink";

/// Returns the User-Agent header for HTTP requests: "hostlink/VERSION (OS; ARCH)"
pub fn user_agent() -> &'static str {
    static USER_AGENT: OnceLock<String> = OnceLock::new();
    USER_AGENT.get_or_init(|| {
        format!(
            "{}/{} ({}; {})",
            PROJECT_NAME,
            PROJECT_VERSION,
            std::env::consts::OS,
            std::env::consts::ARCH
        )
    })
}

pub fn print_header() {
    println!("{PROJECT_NAME} {PROJECT_VERSION}");
}

/// Environment variable to override the config directory.
///
/// Opt-in escape hatch for testing and CI environments where platform
/// config APIs ignore env var overrides like `XDG_CONFIG_HOME`. In
/// production, leave this unset to use the secure default.
const ENV_CONFIG_DIR_OVERRIDE: &str = "HOSTLINK_CONFIG_DIR";

/// Environment variable to override the updates directory (the root that
/// holds the lock file, state file, staging, and backup directories).
///
/// Same rationale as `HOSTLINK_CONFIG_DIR`.
const ENV_UPDATES_DIR_OVERRIDE: &str = "HOSTLINK_UPDATES_DIR";

/// Environment variable to override the data directory used for logs.
const ENV_DATA_DIR_OVERRIDE: &str = "HOSTLINK_DATA_DIR";

/// Validate an override path from an environment variable.
///
/// Ensures the path is absolute and contains no parent directory
/// references (path traversal prevention).
fn validate_dir_override(env_name: &str, value: &str) -> Result<PathBuf> {
    let path = PathBuf::from(value);

    if !path.is_absolute() {
        bail!("{env_name} must be an absolute path: {value}");
    }

    for component in path.components() {
        if let std::path::Component::ParentDir = component {
            bail!("{env_name} contains parent directory references: {value}");
        }
    }

    Ok(path)
}

/// Resolves the project config directory path without creating it.
///
/// If `HOSTLINK_CONFIG_DIR` is set, uses that path directly (validated for
/// safety). Otherwise falls back to `dirs::config_dir()/hostlink`.
pub fn project_config_dir_path() -> Result<PathBuf> {
    if let Ok(override_dir) = env::var(ENV_CONFIG_DIR_OVERRIDE) {
        let path = validate_dir_override(ENV_CONFIG_DIR_OVERRIDE, &override_dir)?;
        info!("Using config directory override from {ENV_CONFIG_DIR_OVERRIDE}: {}", path.display());
        Ok(path)
    } else {
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Unable to determine config directory. Ensure XDG_CONFIG_HOME or HOME environment variable is set"))?;
        Ok(config_dir.join(PROJECT_NAME))
    }
}

/// Returns the project config directory, creating it with secure permissions if needed.
pub fn project_config_dir() -> Result<PathBuf> {
    let dir = project_config_dir_path()?;
    create_secure_directory(&dir)?;
    Ok(dir)
}

/// Resolves the project data directory path (used for log files) without
/// creating it.
///
/// If `HOSTLINK_DATA_DIR` is set, uses that path directly (validated for
/// safety). Otherwise falls back to `dirs::data_dir()/hostlink`.
pub fn project_data_dir_path() -> Result<PathBuf> {
    if let Ok(override_dir) = env::var(ENV_DATA_DIR_OVERRIDE) {
        let path = validate_dir_override(ENV_DATA_DIR_OVERRIDE, &override_dir)?;
        info!("Using data directory override from {ENV_DATA_DIR_OVERRIDE}: {}", path.display());
        Ok(path)
    } else {
        let data_dir = dirs::data_dir().ok_or_else(|| anyhow!("Unable to determine data directory. Ensure XDG_DATA_HOME or HOME environment variable is set"))?;
        Ok(data_dir.join(PROJECT_NAME))
    }
}

/// Returns the project data directory, creating it with secure permissions if needed.
pub fn project_data_dir() -> Result<PathBuf> {
    let dir = project_data_dir_path()?;
    create_secure_directory(&dir)?;
    Ok(dir)
}

/// Resolves the base updates directory path (lock/state/staging/backup root)
/// without creating it.
///
/// If `HOSTLINK_UPDATES_DIR` is set, uses that path directly (validated for
/// safety). Otherwise falls back to [`DEFAULT_UPDATES_DIR`].
pub fn updates_dir_path() -> Result<PathBuf> {
    if let Ok(override_dir) = env::var(ENV_UPDATES_DIR_OVERRIDE) {
        let path = validate_dir_override(ENV_UPDATES_DIR_OVERRIDE, &override_dir)?;
        info!("Using updates directory override from {ENV_UPDATES_DIR_OVERRIDE}: {}", path.display());
        Ok(path)
    } else {
        Ok(PathBuf::from(DEFAULT_UPDATES_DIR))
    }
}

/// Returns the base updates directory, creating it with secure (0700)
/// permissions if needed.
pub fn updates_dir() -> Result<PathBuf> {
    let dir = updates_dir_path()?;
    create_secure_directory(&dir)?;
    Ok(dir)
}

/// Creates a directory with secure permissions (0700 on Unix).
///
/// Creates the directory if it doesn't exist, and fixes permissions to
/// owner-only even if the directory already existed with different ones.
#[cfg(unix)]
pub fn create_secure_directory(dir: &std::path::Path) -> Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;
    use std::os::unix::fs::PermissionsExt;

    let dir_exists = dir.exists();
    debug!(
        "Creating secure directory: {} (exists={dir_exists})",
        dir.display()
    );

    let mut builder = DirBuilder::new();
    builder.recursive(true).mode(0o700);

    builder
        .create(dir)
        .with_context(|| format!("Unable to create directory: {}", dir.display()))?;

    let perms = fs::Permissions::from_mode(0o700);
    fs::set_permissions(dir, perms)
        .with_context(|| format!("Unable to set permissions on directory: {}", dir.display()))?;

    Ok(())
}

/// Creates a directory (non-Unix version without special permissions).
#[cfg(not(unix))]
pub fn create_secure_directory(dir: &std::path::Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Unable to create directory: {}", dir.display()))?;
    Ok(())
}

/// Global mutex for tests that mutate process-wide env vars
/// (`HOSTLINK_CONFIG_DIR`, `HOSTLINK_UPDATES_DIR`).
///
/// `cargo test` runs `#[test]` functions in parallel. Since `set_var`/`remove_var`
/// mutate process-global state, tests sharing the same env var race unless serialized.
#[cfg(test)]
pub(crate) static ENV_TEST_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
