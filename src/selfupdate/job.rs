//! The periodic check-download-stage pipeline the running agent registers
//! on startup, grounded in the teacher's `upgrade/config.rs`
//! `UpgradeConfig` persistence pattern, generalized into a background
//! worker with a cancellable trigger loop.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::archive;
use super::cancel::Cancellation;
use super::checker::UpdateChecker;
use super::error::{UpdateError, UpdateResult};
use super::lock::LockManager;
use super::model::UpdateState;
use super::preflight::PreflightChecker;
use super::spawn::spawn_detached;
use super::staging::StagingManager;
use super::state::StateWriter;
use crate::common::AGENT_BINARY_NAME;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);
const LOCK_EXPIRATION: Duration = Duration::from_secs(5 * 60);
const LOCK_RETRIES: u32 = 3;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Small persisted `last_poll`/`last_upgrade` bookkeeping so a short-lived
/// `run` invocation does not immediately re-hit the control plane moments
/// after a previous instance already polled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PollState {
    #[serde(default)]
    pub last_poll: i64,
    #[serde(default)]
    pub last_upgrade: i64,
}

impl PollState {
    fn read(path: &std::path::Path) -> PollState {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => PollState::default(),
        }
    }

    fn write(&self, path: &std::path::Path) {
        let Some(parent) = path.parent() else {
            return;
        };
        if let Err(e) = crate::common::create_secure_directory(parent) {
            warn!("unable to create poll state directory: {e}");
            return;
        }
        let Ok(json) = serde_json::to_string(self) else {
            return;
        };
        let temp_path = parent.join(format!(".poll-state-{}.tmp", Uuid::new_v4()));
        if fs::write(&temp_path, json).is_ok() {
            let _ = fs::rename(&temp_path, path);
        }
    }
}

pub struct SelfUpdateJob {
    checker: UpdateChecker,
    preflight: PreflightChecker,
    lock: LockManager,
    state: StateWriter,
    staging: StagingManager,
    install_path: PathBuf,
    source_version: String,
    interval: Duration,
    poll_state_path: PathBuf,
}

/// Returned by `register`; cancels and joins the background worker.
pub struct JobHandle {
    cancel: Cancellation,
    last_error_epoch: Arc<AtomicI64>,
    join: Option<JoinHandle<()>>,
}

impl JobHandle {
    #[must_use]
    pub fn cancel_handle(&self) -> Cancellation {
        self.cancel.clone()
    }

    /// Unix timestamp of the most recent `runUpdate` failure, or 0 if none
    /// has occurred yet. Exposed for health/diagnostics surfaces.
    #[must_use]
    pub fn last_error_epoch(&self) -> i64 {
        self.last_error_epoch.load(Ordering::SeqCst)
    }

    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl SelfUpdateJob {
    #[must_use]
    pub fn new(
        checker: UpdateChecker,
        preflight: PreflightChecker,
        lock: LockManager,
        state: StateWriter,
        staging: StagingManager,
        install_path: PathBuf,
        source_version: String,
        poll_state_path: PathBuf,
    ) -> Self {
        Self {
            checker,
            preflight,
            lock,
            state,
            staging,
            install_path,
            source_version,
            interval: DEFAULT_INTERVAL,
            poll_state_path,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Derives a child cancellation from `parent`, spawns the background
    /// worker, and returns a handle to shut it down.
    pub fn register(self, parent: &Cancellation) -> JobHandle
    where
        Self: Send + 'static,
    {
        let cancel = parent.child();
        let worker_cancel = cancel.clone();
        let last_error_epoch = Arc::new(AtomicI64::new(0));
        let worker_last_error = Arc::clone(&last_error_epoch);

        let join = std::thread::spawn(move || {
            loop {
                if let Err(e) = self.run_update(&worker_cancel) {
                    if !e.is_cancelled() {
                        error!("runUpdate failed: {e}");
                        worker_last_error.store(now_secs(), Ordering::SeqCst);
                    }
                }
                if worker_cancel.sleep(self.interval).is_err() {
                    break;
                }
            }
            info!("self-update job worker exiting");
        });

        JobHandle {
            cancel,
            last_error_epoch,
            join: Some(join),
        }
    }

    /// Runs one check→stage attempt per §4.1. Any step failure aborts the
    /// rest but always releases the lock if it was acquired.
    pub fn run_update(&self, cancel: &Cancellation) -> UpdateResult<()> {
        let mut poll_state = PollState::read(&self.poll_state_path);
        poll_state.last_poll = now_secs();
        poll_state.write(&self.poll_state_path);

        let info = match self.checker.check() {
            Ok(info) => info,
            Err(UpdateError::UnsupportedPlatform) => {
                warn!("control plane reports this platform is unsupported; skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !info.update_available {
            return Ok(());
        }

        let update_id = Uuid::new_v4().to_string();

        let required_space = if info.agent_size > 0 {
            info.agent_size as u64
        } else {
            super::DEFAULT_AGENT_SIZE_FALLBACK
        };
        let preflight_result = self.preflight.check(required_space);
        if !preflight_result.passed {
            return Err(UpdateError::PreflightFailed(preflight_result.errors));
        }

        self.lock
            .try_lock_with_retry(cancel, LOCK_EXPIRATION, LOCK_RETRIES, LOCK_RETRY_INTERVAL)?;

        let staged = self.run_locked(cancel, &update_id, &info);
        if let Err(e) = self.lock.unlock() {
            warn!("best-effort lock release failed: {e}");
        }

        // The upgrader re-acquires the lock itself; it must never be spawned
        // while this process still holds it, so the spawn happens only after
        // the unlock above has completed.
        self.spawn_upgrader(&update_id, &staged?)
    }

    fn run_locked(
        &self,
        cancel: &Cancellation,
        update_id: &str,
        info: &super::model::UpdateInfo,
    ) -> UpdateResult<PathBuf> {
        self.write_state(update_id, UpdateState::Initialized, &info.target_version, None);

        cancel.check()?;
        self.staging.prepare()?;

        let download = self
            .staging
            .stage_agent(cancel, &info.agent_url, &info.agent_sha256)
            .inspect_err(|e| self.write_state(update_id, UpdateState::Initialized, &info.target_version, Some(e.to_string())))?;

        cancel.check()?;

        let staged_binary = self.staging.dir().join(AGENT_BINARY_NAME);
        archive::extract_file(&download.file_path, AGENT_BINARY_NAME, &staged_binary)
            .inspect_err(|e| self.write_state(update_id, UpdateState::Initialized, &info.target_version, Some(e.to_string())))?;

        self.write_state(update_id, UpdateState::Staged, &info.target_version, None);
        Ok(staged_binary)
    }

    fn spawn_upgrader(&self, update_id: &str, staged_binary: &std::path::Path) -> UpdateResult<()> {
        let install_path = self.install_path.to_string_lossy().into_owned();
        spawn_detached(
            staged_binary,
            &[
                "upgrade",
                "--install-path",
                &install_path,
                "--update-id",
                update_id,
                "--source-version",
                &self.source_version,
            ],
        )?;

        let mut poll_state = PollState::read(&self.poll_state_path);
        poll_state.last_upgrade = now_secs();
        poll_state.write(&self.poll_state_path);
        Ok(())
    }

    fn write_state(&self, update_id: &str, state: UpdateState, target_version: &str, error: Option<String>) {
        self.state.write(&super::model::StateData {
            update_id: update_id.to_string(),
            state,
            source_version: self.source_version.clone(),
            target_version: target_version.to_string(),
            started_at: now_secs(),
            completed_at: None,
            error,
        });
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poll_state.json");

        let mut state = PollState::default();
        state.last_poll = 100;
        state.write(&path);

        let read = PollState::read(&path);
        assert_eq!(read.last_poll, 100);
        assert_eq!(read.last_upgrade, 0);
    }

    #[test]
    fn poll_state_read_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let state = PollState::read(&path);
        assert_eq!(state.last_poll, 0);
    }

    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    use sha2::{Digest, Sha256};

    use super::super::preflight::FreeSpaceProbe;
    use super::super::signing::NullSigner;

    struct FixedProbe(u64);
    impl FreeSpaceProbe for FixedProbe {
        fn free_space(&self, _path: &std::path::Path) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }

    /// Minimal JSON update-check response body.
    fn check_body(agent_url: &str, sha256: &str, size: u64) -> String {
        format!(
            r#"{{"update_available":true,"target_version":"2.0.0","agent_url":"{agent_url}","agent_sha256":"{sha256}","agent_size":{size}}}"#
        )
    }

    fn write_http_json(stream: &mut std::net::TcpStream, body: &str) {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
    }

    fn write_http_bytes(stream: &mut std::net::TcpStream, content_type: &str, bytes: &[u8]) {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            bytes.len()
        );
        let _ = stream.write_all(head.as_bytes());
        let _ = stream.write_all(bytes);
        let _ = stream.flush();
    }

    fn request_path(stream: &mut std::net::TcpStream) -> String {
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).unwrap_or(0);
        let request = String::from_utf8_lossy(&buf[..n]);
        request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string()
    }

    /// Builds a single-entry gzipped tar whose one file is a `#!/bin/sh`
    /// script that records whether `lock_path` still exists at the moment it
    /// runs, proving the "unlock strictly before spawn" ordering end to end
    /// via a real spawned subprocess rather than an assertion on call order.
    fn make_probe_tarball(inner_name: &str, lock_path: &std::path::Path, evidence_path: &std::path::Path) -> Vec<u8> {
        let script = format!(
            "#!/bin/sh\nif [ -e \"{}\" ]; then\n  echo LOCKED > \"{}\"\nelse\n  echo UNLOCKED > \"{}\"\nfi\n",
            lock_path.display(),
            evidence_path.display(),
            evidence_path.display()
        );

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, inner_name, script.as_bytes()).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    /// Invariant 1: `run_update` releases the lock strictly before spawning
    /// the staged upgrader binary. Verified by having the spawned process
    /// itself (a real subprocess extracted from the staged tarball) record
    /// whether the lock file still exists at the instant it runs.
    #[cfg(unix)]
    #[test]
    fn run_update_unlocks_before_spawn_and_stages_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("update.lock");
        let evidence_path = dir.path().join("evidence.txt");

        let tarball = make_probe_tarball(AGENT_BINARY_NAME, &lock_path, &evidence_path);
        let sha256 = format!("{:x}", Sha256::digest(&tarball));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");
        let agent_url = format!("{base_url}/agent.tar.gz");
        let info_body = check_body(&agent_url, &sha256, tarball.len() as u64);

        let tarball_for_server = tarball.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let path = request_path(&mut stream);
                if path.starts_with("/agent.tar.gz") {
                    write_http_bytes(&mut stream, "application/gzip", &tarball_for_server);
                } else {
                    write_http_json(&mut stream, &info_body);
                }
            }
        });

        let checker = UpdateChecker::new(base_url, "agent-1", Arc::new(NullSigner)).unwrap();
        let install_path = dir.path().join("hostlink-install");
        fs::write(&install_path, b"placeholder").unwrap();
        let updates_dir = dir.path().join("updates");
        fs::create_dir_all(&updates_dir).unwrap();
        let preflight =
            PreflightChecker::new(install_path.clone(), updates_dir).with_probe(Box::new(FixedProbe(u64::MAX)));
        let lock = LockManager::new(lock_path.clone());
        let state = StateWriter::new(dir.path().join("state.json"));
        let staging = StagingManager::new(dir.path().join("staging"));

        let job = SelfUpdateJob::new(
            checker,
            preflight,
            lock,
            state,
            staging,
            install_path,
            "1.0.0".to_string(),
            dir.path().join("poll_state.json"),
        );

        let cancel = Cancellation::new();
        let result = job.run_update(&cancel);
        assert!(result.is_ok(), "run_update failed: {result:?}");
        assert!(!lock_path.exists(), "lock must be released before returning");

        let mut evidence = String::new();
        for _ in 0..50 {
            if let Ok(contents) = fs::read_to_string(&evidence_path) {
                evidence = contents;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(evidence.trim(), "UNLOCKED", "spawned process observed the lock still held");

        let final_state = StateWriter::new(dir.path().join("state.json")).read().unwrap();
        assert_eq!(final_state.state, UpdateState::Staged);

        let poll_state = PollState::read(&dir.path().join("poll_state.json"));
        assert!(poll_state.last_poll > 0);
        assert!(poll_state.last_upgrade > 0);
    }

    /// Invariant 2: a failure after the lock is acquired still releases it
    /// exactly once. `run_update` has a single `unlock()` call site after
    /// `run_locked`, so driving any post-lock failure through it and
    /// observing the lock file gone exercises that guarantee.
    #[test]
    fn run_update_releases_lock_on_staging_prepare_failure() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("update.lock");

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");
        let info_body = check_body("http://127.0.0.1:1/agent.tar.gz", &"0".repeat(64), 10);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let _ = request_path(&mut stream);
                write_http_json(&mut stream, &info_body);
            }
        });

        let checker = UpdateChecker::new(base_url, "agent-1", Arc::new(NullSigner)).unwrap();
        let install_path = dir.path().join("hostlink-install");
        fs::write(&install_path, b"placeholder").unwrap();
        let updates_dir = dir.path().join("updates");
        fs::create_dir_all(&updates_dir).unwrap();
        let preflight =
            PreflightChecker::new(install_path.clone(), updates_dir).with_probe(Box::new(FixedProbe(u64::MAX)));
        let lock = LockManager::new(lock_path.clone());
        let state = StateWriter::new(dir.path().join("state.json"));

        // Occupy the staging directory's path with a plain file so
        // `StagingManager::prepare()` fails deterministically, before any
        // network access, forcing `run_update` down its post-lock failure
        // path.
        let staging_dir = dir.path().join("staging");
        fs::write(&staging_dir, b"not a directory").unwrap();
        let staging = StagingManager::new(staging_dir);

        let job = SelfUpdateJob::new(
            checker,
            preflight,
            lock,
            state,
            staging,
            install_path,
            "1.0.0".to_string(),
            dir.path().join("poll_state.json"),
        );

        let cancel = Cancellation::new();
        let result = job.run_update(&cancel);

        assert!(result.is_err());
        assert!(!lock_path.exists(), "lock must still be released on failure");

        let final_state = StateWriter::new(dir.path().join("state.json")).read().unwrap();
        assert_eq!(final_state.state, UpdateState::Initialized);
    }
}
