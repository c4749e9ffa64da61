//! Cross-process advisory lock guarding a single update attempt on a host.
//!
//! The teacher's own upgrade lock (`upgrade/poll.rs::UpgradeLock`) relies on
//! `flock()` via `fs2`, which only works within a single filesystem lease and
//! gives no portable way to detect a lock abandoned by a killed process
//! beyond "is the fd still held". This crate needs stronger, survivable
//! staleness detection (a crashed owner must not lock out successors
//! forever), so the lock is instead a JSON payload placed via the portable
//! "atomic create-if-absent" recipe: write a unique temp file, then
//! `link()` it onto the lock path (`link` fails if the target exists,
//! unlike `rename`), with the payload carrying a start-time fingerprint
//! to rule out PID reuse.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use uuid::Uuid;

use super::cancel::Cancellation;
use super::error::{UpdateError, UpdateResult};
use super::model::LockData;
use crate::common::create_secure_directory;

pub struct LockManager {
    lock_path: PathBuf,
}

impl LockManager {
    #[must_use]
    pub fn new(lock_path: PathBuf) -> Self {
        Self { lock_path }
    }

    /// Attempts to acquire the lock once, with the given expiration window.
    /// Returns `LockBusy` if another live, non-expired owner holds it.
    pub fn try_lock(&self, expiration: Duration) -> UpdateResult<()> {
        let parent = self
            .lock_path
            .parent()
            .ok_or_else(|| UpdateError::Other(anyhow::anyhow!("lock path has no parent directory")))?;
        create_secure_directory(parent).map_err(UpdateError::Other)?;

        let now = now_secs();
        let data = LockData {
            pid: std::process::id() as i32,
            expire_at: now + expiration.as_secs() as i64,
            owner_start_time: process_start_time(std::process::id())?,
        };

        let attempt = self.attempt_link(&data, parent)?;
        if attempt {
            info!("acquired update lock at {}", self.lock_path.display());
            return Ok(());
        }

        // link failed because lock_path exists; inspect for staleness.
        if self.is_stale(now)? {
            let _ = fs::remove_file(&self.lock_path);
            if self.attempt_link(&data, parent)? {
                info!("reclaimed stale update lock at {}", self.lock_path.display());
                return Ok(());
            }
            // Another contender raced us for the reclaim.
            return Err(UpdateError::LockBusy);
        }

        Err(UpdateError::LockBusy)
    }

    /// Repeatedly calls `try_lock`, sleeping `interval` between attempts
    /// (observing cancellation), retrying only on `LockBusy`. Other errors
    /// propagate immediately.
    pub fn try_lock_with_retry(
        &self,
        cancel: &Cancellation,
        expiration: Duration,
        retries: u32,
        interval: Duration,
    ) -> UpdateResult<()> {
        let mut last_err = UpdateError::LockBusy;
        for attempt in 0..=retries {
            match self.try_lock(expiration) {
                Ok(()) => return Ok(()),
                Err(UpdateError::LockBusy) => {
                    last_err = UpdateError::LockBusy;
                    if attempt < retries {
                        cancel.sleep(interval)?;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(UpdateError::LockAcquireFailed(Box::new(last_err)))
    }

    /// Unconditionally removes any existing lock file, then acquires fresh.
    /// For the `upgrade --force` operator override only — bypasses the
    /// normal staleness rules entirely, so a genuinely live owner can be
    /// preempted. Never used by the unattended periodic pipeline.
    pub fn force_lock(&self, expiration: Duration) -> UpdateResult<()> {
        let _ = fs::remove_file(&self.lock_path);
        self.try_lock(expiration)
    }

    /// Releases the lock. Idempotent if the file is already gone; refuses
    /// (without deleting) if the stored PID isn't ours, since that would
    /// release someone else's lock.
    pub fn unlock(&self) -> UpdateResult<()> {
        let contents = match fs::read_to_string(&self.lock_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(UpdateError::Other(anyhow::anyhow!("unable to read lock file: {e}"))),
        };

        let data: LockData = match serde_json::from_str(&contents) {
            Ok(d) => d,
            Err(_) => {
                // Corrupt lock file: treat as ours to clean up and return success.
                let _ = fs::remove_file(&self.lock_path);
                return Ok(());
            }
        };

        if data.pid != std::process::id() as i32 {
            return Err(UpdateError::LockNotOwned);
        }

        fs::remove_file(&self.lock_path)
            .or_else(|e| if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) })
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to remove lock file: {e}")))?;
        Ok(())
    }

    fn attempt_link(&self, data: &LockData, parent: &Path) -> UpdateResult<bool> {
        let payload = serde_json::to_string(data)
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to serialize lock data: {e}")))?;
        let temp_path = parent.join(format!(".lock-{}.tmp", Uuid::new_v4()));

        write_0600(&temp_path, payload.as_bytes())
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to write temp lock file: {e}")))?;

        let link_result = fs::hard_link(&temp_path, &self.lock_path);
        let _ = fs::remove_file(&temp_path);

        match link_result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(UpdateError::Other(anyhow::anyhow!("unable to link lock file: {e}"))),
        }
    }

    /// True iff the existing lock file represents a stale owner: corrupt,
    /// expired, dead PID, or a PID whose observed start time no longer
    /// matches (reused).
    fn is_stale(&self, now: i64) -> UpdateResult<bool> {
        let contents = match fs::read_to_string(&self.lock_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(UpdateError::Other(anyhow::anyhow!("unable to read lock file: {e}"))),
        };

        let data: LockData = match serde_json::from_str(&contents) {
            Ok(d) => d,
            Err(_) => return Ok(true),
        };

        if data.expire_at < now {
            return Ok(true);
        }

        #[allow(clippy::cast_sign_loss)]
        let pid = data.pid as u32;
        if !is_process_running(pid) {
            return Ok(true);
        }

        match process_start_time(pid) {
            Ok(observed) if observed == data.owner_start_time => Ok(false),
            _ => {
                warn!("lock owner pid {pid} appears reused, treating as stale");
                Ok(true)
            }
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
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
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_0600(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

/// Signal-0 liveness probe: does not send a signal, only checks existence.
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    unsafe {
        libc::kill(pid as libc::pid_t, 0) == 0
    }
}

#[cfg(windows)]
fn is_process_running(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::OpenProcess;

    const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return false;
    }
    unsafe {
        CloseHandle(handle);
    }
    true
}

/// Reads field 22 (starttime, in clock ticks since boot) from
/// `/proc/<pid>/stat`. The second field (comm) may itself contain spaces or
/// parens, so this parses from the last `)` rather than splitting naively.
#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> UpdateResult<i64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to read /proc/{pid}/stat: {e}")))?;

    let after_comm = stat
        .rfind(')')
        .map(|idx| &stat[idx + 1..])
        .ok_or_else(|| UpdateError::Other(anyhow::anyhow!("malformed /proc/{pid}/stat")))?;

    // Fields after the comm field: state(3) ppid(4) ... starttime(22).
    // after_comm starts at field 3, so starttime is the 20th field here.
    let field = after_comm
        .split_whitespace()
        .nth(19)
        .ok_or_else(|| UpdateError::Other(anyhow::anyhow!("missing starttime field in /proc/{pid}/stat")))?;

    field
        .parse::<i64>()
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to parse starttime: {e}")))
}

/// Non-Linux platforms have no portable process-start-time source. Per the
/// design notes this falls back to a deterministic dummy derived from the
/// pid, weakening staleness detection to time-expiry only (any live process
/// with that pid is assumed to be the same owner).
#[cfg(not(target_os = "linux"))]
fn process_start_time(pid: u32) -> UpdateResult<i64> {
    Ok(i64::from(pid))
}
