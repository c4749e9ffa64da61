//! Disk-space, writability, and install-path checks run before any
//! destructive action. All three checks run regardless of earlier
//! failures so the operator sees every problem in one pass.

use std::path::{Path, PathBuf};

use super::model::PreflightResult;

const PREFLIGHT_BUFFER_BYTES: u64 = 10 * 1024 * 1024;

/// Injectable free-space probe so tests can simulate low-disk conditions
/// without needing an actual constrained filesystem.
pub trait FreeSpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> std::io::Result<u64>;
}

/// Default probe backed by the real filesystem via `statvfs`-equivalent
/// stdlib facilities where available; on platforms without a portable
/// stdlib API this reports an optimistic "plenty of space" rather than
/// failing preflight outright.
pub struct SystemFreeSpaceProbe;

impl FreeSpaceProbe for SystemFreeSpaceProbe {
    #[cfg(unix)]
    fn free_space(&self, path: &Path) -> std::io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn free_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(u64::MAX)
    }
}

pub struct PreflightChecker {
    install_path: PathBuf,
    updates_dir: PathBuf,
    probe: Box<dyn FreeSpaceProbe>,
}

impl PreflightChecker {
    #[must_use]
    pub fn new(install_path: PathBuf, updates_dir: PathBuf) -> Self {
        Self {
            install_path,
            updates_dir,
            probe: Box::new(SystemFreeSpaceProbe),
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn FreeSpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Runs all three checks, aggregating failures rather than
    /// short-circuiting: install-path parent writability, updates-directory
    /// writability, and free space at the updates directory against
    /// `required_space + 10 MiB`.
    #[must_use]
    pub fn check(&self, required_space: u64) -> PreflightResult {
        let mut result = PreflightResult::ok();

        if let Err(e) = self.check_install_path() {
            result.push_error(e);
        }

        if let Err(e) = self.check_updates_dir_writable() {
            result.push_error(e);
        }

        if let Err(e) = self.check_disk_space(required_space) {
            result.push_error(e);
        }

        result
    }

    fn check_install_path(&self) -> Result<(), String> {
        if !self.install_path.exists() {
            return Err(format!("install path does not exist: {}", self.install_path.display()));
        }
        let parent = self
            .install_path
            .parent()
            .ok_or_else(|| format!("install path has no parent directory: {}", self.install_path.display()))?;
        check_dir_writable(parent)
            .map_err(|e| format!("install path parent {} is not writable: {e}", parent.display()))
    }

    fn check_updates_dir_writable(&self) -> Result<(), String> {
        check_dir_writable(&self.updates_dir)
            .map_err(|e| format!("updates directory {} is not writable: {e}", self.updates_dir.display()))
    }

    fn check_disk_space(&self, required_space: u64) -> Result<(), String> {
        let needed = required_space.saturating_add(PREFLIGHT_BUFFER_BYTES);
        let free = self
            .probe
            .free_space(&self.updates_dir)
            .map_err(|e| format!("unable to determine free space at {}: {e}", self.updates_dir.display()))?;

        if free < needed {
            return Err(format!(
                "insufficient disk space at {}: need {needed} bytes, have {free}",
                self.updates_dir.display()
            ));
        }
        Ok(())
    }
}

fn check_dir_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe_path = dir.join(format!(".preflight-{}", uuid::Uuid::new_v4()));
    std::fs::write(&probe_path, b"")?;
    std::fs::remove_file(&probe_path)?;
    Ok(())
}
