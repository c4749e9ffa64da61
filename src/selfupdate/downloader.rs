//! Streaming download with checksum verification and retry.
//!
//! Grounded in the teacher's `upgrade/poll.rs::download_file` +
//! `verify_checksum`, generalized with cancellation, exponential backoff,
//! and 4xx/5xx classification per the control-plane contract.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use sha2::{Digest, Sha256};

use super::cancel::Cancellation;
use super::error::{UpdateError, UpdateResult};
use super::model::DownloadResult;
use crate::common::user_agent;

const DEFAULT_MAX_RETRIES: u32 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const BACKOFF_SCHEDULE_SECS: [u64; 5] = [5, 10, 20, 40, 60];

/// Streams a URL to `dest_path` and verifies its SHA-256 digest, retrying
/// transient failures with exponential backoff.
pub struct Downloader {
    max_retries: u32,
}

impl Downloader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Downloads `url` to `dest_path`, verifies it matches `expected_sha256`,
    /// and removes the destination file on any failure (including a
    /// checksum mismatch).
    pub fn download_and_verify(
        &self,
        cancel: &Cancellation,
        url: &str,
        dest_path: &Path,
        expected_sha256: &str,
    ) -> UpdateResult<DownloadResult> {
        self.download(cancel, url, dest_path)?;

        match verify_sha256(dest_path, expected_sha256) {
            Ok(()) => Ok(DownloadResult {
                file_path: dest_path.to_path_buf(),
                sha256: expected_sha256.to_string(),
            }),
            Err(e) => {
                let _ = fs::remove_file(dest_path);
                Err(e)
            }
        }
    }

    /// Attempt loop with exponential backoff, capped at 60s. HTTP 4xx is
    /// non-retryable; network errors and 5xx are retried up to
    /// `max_retries` times.
    fn download(&self, cancel: &Cancellation, url: &str, dest_path: &Path) -> UpdateResult<()> {
        let parent = dest_path
            .parent()
            .ok_or_else(|| UpdateError::Other(anyhow::anyhow!("dest_path has no parent directory")))?;
        fs::create_dir_all(parent)
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to create {}: {e}", parent.display())))?;

        let mut attempt: u32 = 0;
        loop {
            cancel.check()?;

            match attempt_download(url, parent) {
                Ok(temp_path) => {
                    return finalize_download(&temp_path, dest_path);
                }
                Err(AttemptError::NonRetryable(msg)) => {
                    return Err(UpdateError::DownloadFailed(msg));
                }
                Err(AttemptError::Retryable(msg)) => {
                    if attempt >= self.max_retries {
                        return Err(UpdateError::DownloadFailed(format!(
                            "exhausted {} retries: {msg}",
                            self.max_retries
                        )));
                    }
                    let backoff = BACKOFF_SCHEDULE_SECS
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or(60);
                    warn!("download attempt {} failed ({msg}), retrying in {backoff}s", attempt + 1);
                    cancel.sleep(Duration::from_secs(backoff))?;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

enum AttemptError {
    Retryable(String),
    NonRetryable(String),
}

/// Streams the response body into a uniquely named temp file in `parent`,
/// returning its path on success. Never leaves the temp file behind on
/// failure.
fn attempt_download(url: &str, parent: &Path) -> Result<PathBuf, AttemptError> {
    let response = minreq::get(url)
        .with_header("User-Agent", user_agent())
        .with_timeout(REQUEST_TIMEOUT_SECS)
        .send()
        .map_err(|e| AttemptError::Retryable(format!("request error: {e}")))?;

    let status = response.status_code;
    if (400..500).contains(&status) {
        return Err(AttemptError::NonRetryable(format!("HTTP {status}")));
    }
    if !(200..300).contains(&status) {
        return Err(AttemptError::Retryable(format!("HTTP {status}")));
    }

    let temp_path = parent.join(format!(".download-{}.tmp", uuid::Uuid::new_v4()));

    let write_result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(response.as_bytes())?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(AttemptError::NonRetryable(format!("disk write error: {e}")));
    }

    Ok(temp_path)
}

fn finalize_download(temp_path: &Path, dest_path: &Path) -> UpdateResult<()> {
    match fs::rename(temp_path, dest_path) {
        Ok(()) => {
            info!("downloaded to {}", dest_path.display());
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(temp_path);
            Err(UpdateError::DownloadFailed(format!(
                "unable to rename {} to {}: {e}",
                temp_path.display(),
                dest_path.display()
            )))
        }
    }
}

/// Streams `file_path` through SHA-256 and compares the hex digest against
/// `expected`.
pub fn verify_sha256(file_path: &Path, expected: &str) -> UpdateResult<()> {
    let mut file = fs::File::open(file_path)
        .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to open {}: {e}", file_path.display())))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("read error: {e}")))?;
        if n == 0 {
            break;
        }
        if let Some(chunk) = buffer.get(..n) {
            hasher.update(chunk);
        }
    }

    let actual = format!("{:x}", hasher.finalize());
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(UpdateError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
