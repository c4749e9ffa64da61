//! The upgrade state machine: lock, backup, stop, install, start, verify,
//! and (on failure) rollback. Invoked inside the staged binary via
//! `upgrade --install-path ... --update-id ... --source-version ...`.
//!
//! The atomic-replace recipe (temp-file-copy, fsync, rename onto the
//! destination) is carried over from the teacher's
//! `upgrade/poll.rs::atomic_replace_binary`; everything else here —
//! the ordered state machine, rollback, and cancellation discipline — is
//! new surface this crate's scope requires.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;
use uuid::Uuid;

use super::cancel::Cancellation;
use super::error::UpdateError;
use super::health::HealthChecker;
use super::lock::LockManager;
use super::model::{StateData, UpdateState};
use super::service::ServiceController;
use super::state::StateWriter;

const LOCK_EXPIRATION: Duration = Duration::from_secs(5 * 60);
const LOCK_RETRIES: u32 = 3;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const ROLLBACK_STOP_ATTEMPTS: u32 = 3;
const ROLLBACK_STOP_INTERVAL: Duration = Duration::from_secs(1);

pub struct UpgradeParams {
    pub install_path: PathBuf,
    pub backup_dir: PathBuf,
    pub update_id: String,
    pub source_version: String,
    pub target_version: String,
}

pub struct Upgrader<'a> {
    params: UpgradeParams,
    lock: LockManager,
    state: StateWriter,
    service: &'a dyn ServiceController,
    health: &'a HealthChecker,
    /// Optional post-rollback health check hook. Nil (`None`) means skip.
    post_rollback_health: Option<&'a HealthChecker>,
    service_stopped: bool,
}

impl<'a> Upgrader<'a> {
    pub fn new(
        params: UpgradeParams,
        lock: LockManager,
        state: StateWriter,
        service: &'a dyn ServiceController,
        health: &'a HealthChecker,
    ) -> Self {
        Self {
            params,
            lock,
            state,
            service,
            health,
            post_rollback_health: None,
            service_stopped: false,
        }
    }

    #[must_use]
    pub fn with_post_rollback_health(mut self, checker: &'a HealthChecker) -> Self {
        self.post_rollback_health = Some(checker);
        self
    }

    /// Runs the full state machine. `Ok(())` on successful upgrade or a
    /// clean no-op abort before anything was touched; `Err` otherwise
    /// (possibly joining an install/start/health error with a rollback
    /// error).
    pub fn run(mut self, cancel: &Cancellation) -> anyhow::Result<()> {
        pre_clean(&self.params.install_path);

        self.lock
            .try_lock_with_retry(cancel, LOCK_EXPIRATION, LOCK_RETRIES, LOCK_RETRY_INTERVAL)?;
        let result = self.run_locked(cancel);
        if let Err(e) = self.lock.unlock() {
            warn!("best-effort lock release failed: {e}");
        }
        result
    }

    fn run_locked(&mut self, cancel: &Cancellation) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled.into());
        }

        let binary_name = self
            .params
            .install_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hostlink".to_string());
        let backup_path = self.params.backup_dir.join(&binary_name);

        if let Err(e) = self.backup(&backup_path) {
            return self.abort(anyhow::anyhow!("backup failed: {e}"));
        }

        if cancel.is_cancelled() {
            return self.abort(UpdateError::Cancelled.into());
        }

        self.service_stopped = false;
        match self.service.stop(cancel) {
            Ok(()) => self.service_stopped = true,
            Err(e) if e.is_cancelled() => {
                // The stop call may have taken effect before cancellation was
                // observed, so restart-on-abort must still fire.
                self.service_stopped = true;
                return self.abort(e.into());
            }
            Err(e) => return self.abort(anyhow::anyhow!("service stop failed: {e}")),
        }

        if cancel.is_cancelled() {
            return self.abort(UpdateError::Cancelled.into());
        }

        if let Err(e) = self.install() {
            let rollback_err = self.rollback(&backup_path);
            return Err(join_errors(anyhow::anyhow!("install failed: {e}"), rollback_err));
        }

        // Load-bearing: after install, never return without starting the
        // service, even if the caller cancelled in between.
        let cancelled_after_install = cancel.is_cancelled();

        let background = Cancellation::background();
        if let Err(e) = self.service.start(&background) {
            let rollback_err = self.rollback(&backup_path);
            return Err(join_errors(anyhow::anyhow!("service start failed: {e}"), rollback_err));
        }

        if cancelled_after_install {
            return Err(UpdateError::Cancelled.into());
        }
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled.into());
        }

        match self.health.wait_for_health(cancel, &self.params.target_version) {
            Ok(()) => {
                self.write_state(UpdateState::Completed, None);
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(UpdateError::Cancelled.into()),
            Err(e) => {
                let rollback_err = self.rollback(&backup_path);
                Err(join_errors(anyhow::anyhow!("health verification failed: {e}"), rollback_err))
            }
        }
    }

    /// Restarts the service if we had stopped it (no-op otherwise) and
    /// returns the given error, for abort paths before install.
    fn abort(&self, err: anyhow::Error) -> anyhow::Result<()> {
        if self.service_stopped {
            let background = Cancellation::background();
            if let Err(e) = self.service.start(&background) {
                warn!("unable to restart service during abort: {e}");
            }
        }
        Err(err)
    }

    fn backup(&self, backup_path: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(&self.params.backup_dir)?;
        atomic_copy(&self.params.install_path, backup_path)
    }

    /// Self-copy install: the staged binary copies its own running image
    /// onto the install path. Safe on POSIX because a running executable's
    /// inode is decoupled from its directory entry.
    fn install(&self) -> anyhow::Result<()> {
        let running_image = std::env::current_exe()?;
        atomic_copy_with_mode(&running_image, &self.params.install_path, 0o755)?;
        self.write_state(UpdateState::Installed, None);
        Ok(())
    }

    /// Rollback, ignoring cancellation — it must finish once started.
    fn rollback(&self, backup_path: &Path) -> anyhow::Result<()> {
        self.write_state(UpdateState::Rollback, None);

        let background = Cancellation::background();
        let mut stop_err = None;
        for attempt in 0..ROLLBACK_STOP_ATTEMPTS {
            match self.service.stop(&background) {
                Ok(()) => {
                    stop_err = None;
                    break;
                }
                Err(e) => stop_err = Some(e),
            }
            if attempt + 1 < ROLLBACK_STOP_ATTEMPTS {
                std::thread::sleep(ROLLBACK_STOP_INTERVAL);
            }
        }
        if let Some(e) = stop_err {
            warn!("rollback: all {ROLLBACK_STOP_ATTEMPTS} stop attempts failed ({e}), proceeding with restore anyway");
        }

        self.restore_backup(backup_path)?;

        if let Err(e) = self.service.start(&background) {
            warn!("rollback: unable to start service after restore: {e}");
        }

        let mut health_err = None;
        if let Some(checker) = self.post_rollback_health {
            if let Err(e) = checker.wait_for_health(&background, &self.params.source_version) {
                health_err = Some(e);
            }
        }

        self.write_state(UpdateState::RolledBack, None);
        pre_clean(&self.params.install_path);

        if let Some(e) = health_err {
            anyhow::bail!("rolled back, but post-rollback health check failed: {e}");
        }
        Ok(())
    }

    fn restore_backup(&self, backup_path: &Path) -> anyhow::Result<()> {
        atomic_copy_with_mode(backup_path, &self.params.install_path, 0o755)
    }

    fn write_state(&self, state: UpdateState, error: Option<String>) {
        let now = now_secs();
        let completed_at = matches!(state, UpdateState::Completed | UpdateState::RolledBack).then_some(now);
        self.state.write(&StateData {
            update_id: self.params.update_id.clone(),
            state,
            source_version: self.params.source_version.clone(),
            target_version: self.params.target_version.clone(),
            started_at: now,
            completed_at,
            error,
        });
    }
}

fn join_errors(primary: anyhow::Error, rollback: anyhow::Result<()>) -> anyhow::Error {
    match rollback {
        Ok(()) => primary,
        Err(rollback_err) => anyhow::anyhow!("{primary}; rollback also failed: {rollback_err}"),
    }
}

/// Removes any leftover `<install_path>.tmp.*` files in the install
/// directory, run both before the state machine starts and again after a
/// rollback completes.
fn pre_clean(install_path: &Path) {
    let Some(parent) = install_path.parent() else {
        return;
    };
    let Some(name) = install_path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let prefix = format!("{name}.tmp.");

    let Ok(entries) = fs::read_dir(parent) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn atomic_copy(src: &Path, dst: &Path) -> anyhow::Result<()> {
    atomic_copy_with_mode(src, dst, 0o644)
}

/// Opens `src`, writes to a uniquely-named temp sibling of `dst`, then
/// renames onto `dst`. Preserves any existing file at `dst` if the copy
/// fails partway.
fn atomic_copy_with_mode(src: &Path, dst: &Path, mode: u32) -> anyhow::Result<()> {
    let dst_dir = dst
        .parent()
        .ok_or_else(|| anyhow::anyhow!("destination has no parent directory"))?;
    let temp_path = dst_dir.join(format!("{}.tmp.{}", dst.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(), Uuid::new_v4()));

    let copy_result = fs::copy(src, &temp_path);
    if let Err(e) = copy_result {
        let _ = fs::remove_file(&temp_path);
        return Err(anyhow::anyhow!("unable to copy {} to {}: {e}", src.display(), temp_path.display()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(&temp_path, fs::Permissions::from_mode(mode)) {
            let _ = fs::remove_file(&temp_path);
            return Err(anyhow::anyhow!("unable to set permissions on {}: {e}", temp_path.display()));
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    if let Ok(file) = fs::File::open(&temp_path) {
        let _ = file.sync_all();
    }

    if let Err(e) = fs::rename(&temp_path, dst) {
        let _ = fs::remove_file(&temp_path);
        return Err(anyhow::anyhow!("unable to rename {} to {}: {e}", temp_path.display(), dst.display()));
    }

    Ok(())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selfupdate::service::MockServiceController;

    fn make_params(dir: &Path) -> UpgradeParams {
        UpgradeParams {
            install_path: dir.join("hostlink"),
            backup_dir: dir.join("backup"),
            update_id: "update-1".to_string(),
            source_version: "1.0.0".to_string(),
            target_version: "2.0.0".to_string(),
        }
    }

    #[test]
    fn pre_clean_removes_leftover_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let install_path = dir.path().join("hostlink");
        fs::write(&install_path, b"binary").unwrap();
        let leftover = dir.path().join("hostlink.tmp.abandoned");
        fs::write(&leftover, b"stale").unwrap();

        pre_clean(&install_path);
        assert!(!leftover.exists());
        assert!(install_path.exists());
    }

    #[test]
    fn atomic_copy_preserves_existing_dest_on_source_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("hostlink");
        fs::write(&dst, b"original").unwrap();

        let missing_src = dir.path().join("does-not-exist");
        let result = atomic_copy(&missing_src, &dst);
        assert!(result.is_err());
        assert_eq!(fs::read(&dst).unwrap(), b"original");
    }

    #[test]
    fn abort_restarts_service_only_if_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let params = make_params(dir.path());
        let lock = LockManager::new(dir.path().join("update.lock"));
        let state = StateWriter::new(dir.path().join("state.json"));
        let service = MockServiceController::always_ok();
        let health = HealthChecker::new("http://127.0.0.1:1/health");

        let mut upgrader = Upgrader::new(params, lock, state, &service, &health);
        upgrader.service_stopped = false;
        let _ = upgrader.abort(anyhow::anyhow!("boom"));
        assert_eq!(service.start_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        upgrader.service_stopped = true;
        let _ = upgrader.abort(anyhow::anyhow!("boom"));
        assert_eq!(service.start_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// Starts a background thread serving a single fixed JSON body on every
    /// connection to a loopback port, for driving `HealthChecker` without a
    /// real control plane. Returns the `http://127.0.0.1:<port>/health` URL.
    fn spawn_fake_health_server(body: &'static str) -> String {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        format!("http://{addr}/health")
    }

    fn fast_health_checker(url: &str) -> HealthChecker {
        HealthChecker::new(url)
            .with_initial_wait(Duration::from_millis(1))
            .with_max_retries(1)
            .with_retry_interval(Duration::from_millis(1))
    }

    /// Invariant 9: on a successful run, the install path ends up holding the
    /// staged binary's bytes at mode 0755, and the backup directory holds the
    /// pre-upgrade bytes.
    #[cfg(unix)]
    #[test]
    fn run_completes_and_installs_self_with_mode_0755_on_health_success() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let install_path = dir.path().join("hostlink");
        let original_bytes = b"old-version-bytes".to_vec();
        fs::write(&install_path, &original_bytes).unwrap();

        let mut params = make_params(dir.path());
        params.install_path = install_path.clone();
        let backup_dir = params.backup_dir.clone();

        let lock = LockManager::new(dir.path().join("update.lock"));
        let state = StateWriter::new(dir.path().join("state.json"));
        let service = MockServiceController::always_ok();
        let health_url = spawn_fake_health_server(r#"{"ok":true,"version":"2.0.0"}"#);
        let health = fast_health_checker(&health_url);

        let upgrader = Upgrader::new(params, lock, state, &service, &health);
        let cancel = Cancellation::new();
        let result = upgrader.run(&cancel);

        assert!(result.is_ok(), "run() failed: {result:?}");

        let running_image = fs::read(std::env::current_exe().unwrap()).unwrap();
        assert_eq!(fs::read(&install_path).unwrap(), running_image);
        let mode = fs::metadata(&install_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);

        assert_eq!(fs::read(backup_dir.join("hostlink")).unwrap(), original_bytes);

        assert_eq!(service.stop_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(service.start_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!dir.path().join("update.lock").exists());
    }

    /// Invariant 10: when the post-install health check never reports the
    /// target version, `run` rolls the install path back to its pre-upgrade
    /// bytes and reports an error.
    #[test]
    fn run_rolls_back_to_pre_upgrade_bytes_when_health_check_fails() {
        let dir = tempfile::tempdir().unwrap();
        let install_path = dir.path().join("hostlink");
        let original_bytes = b"old-version-bytes".to_vec();
        fs::write(&install_path, &original_bytes).unwrap();

        let mut params = make_params(dir.path());
        params.install_path = install_path.clone();

        let lock = LockManager::new(dir.path().join("update.lock"));
        let state = StateWriter::new(dir.path().join("state.json"));
        let service = MockServiceController::always_ok();
        // Reports a stale version forever, so wait_for_health never matches
        // "2.0.0" and exhausts its retry budget.
        let health_url = spawn_fake_health_server(r#"{"ok":true,"version":"1.0.0"}"#);
        let health = fast_health_checker(&health_url);

        let upgrader = Upgrader::new(params, lock, state, &service, &health);
        let cancel = Cancellation::new();
        let result = upgrader.run(&cancel);

        assert!(result.is_err());
        assert_eq!(fs::read(&install_path).unwrap(), original_bytes);
        // stop+start once for the install attempt, then stop (best-effort,
        // may fail) + start again during rollback.
        assert!(service.start_calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert!(!dir.path().join("update.lock").exists());
    }
}
