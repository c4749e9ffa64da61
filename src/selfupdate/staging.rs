//! Owns the 0700 staging directory that holds the in-flight download and
//! extracted binary for a single update attempt.

use std::path::{Path, PathBuf};

use super::cancel::Cancellation;
use super::downloader::Downloader;
use super::error::{UpdateError, UpdateResult};
use super::model::DownloadResult;
use crate::common::{AGENT_TARBALL_NAME, create_secure_directory};

pub struct StagingManager {
    dir: PathBuf,
    downloader: Downloader,
}

impl StagingManager {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            downloader: Downloader::new(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the staging directory idempotently, enforcing 0700 even if
    /// it already existed.
    pub fn prepare(&self) -> UpdateResult<()> {
        create_secure_directory(&self.dir).map_err(UpdateError::Other)
    }

    /// Downloads and verifies the agent tarball into the staging directory
    /// under its canonical filename.
    pub fn stage_agent(
        &self,
        cancel: &Cancellation,
        url: &str,
        sha256: &str,
    ) -> UpdateResult<DownloadResult> {
        let dest = self.dir.join(AGENT_TARBALL_NAME);
        self.downloader.download_and_verify(cancel, url, &dest, sha256)
    }

    /// Removes the staging directory tree. Idempotent if already absent.
    pub fn cleanup(&self) -> UpdateResult<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpdateError::Other(anyhow::anyhow!(
                "unable to remove staging directory {}: {e}",
                self.dir.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_directory_with_secure_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let staging_dir = dir.path().join("staging");
        let mgr = StagingManager::new(staging_dir.clone());
        mgr.prepare().unwrap();

        assert!(staging_dir.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&staging_dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn cleanup_is_idempotent_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let staging_dir = dir.path().join("staging");
        let mgr = StagingManager::new(staging_dir);
        assert!(mgr.cleanup().is_ok());
        assert!(mgr.cleanup().is_ok());
    }

    #[test]
    fn prepare_is_idempotent_on_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let staging_dir = dir.path().join("staging");
        let mgr = StagingManager::new(staging_dir);
        mgr.prepare().unwrap();
        mgr.prepare().unwrap();
    }
}
