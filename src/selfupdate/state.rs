//! Durable, human-readable, best-effort observability state file.
//!
//! Grounded in the teacher's `upgrade/config.rs` persistence pattern
//! (atomic write via temp-file-plus-rename, 0600 permissions,
//! missing-file-is-not-an-error reads), generalized to the richer
//! `StateData` enum this crate needs. State writes are advisory only —
//! failures are logged and swallowed, never propagated, per the
//! "never branch correctness on this" invariant.

use std::fs;
use std::path::PathBuf;

use log::warn;
use uuid::Uuid;

use super::model::StateData;
use crate::common::create_secure_directory;

pub struct StateWriter {
    state_path: PathBuf,
}

impl StateWriter {
    #[must_use]
    pub fn new(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    /// Writes `data` atomically. Best-effort: logs a warning and returns
    /// normally on failure rather than propagating, since the state file is
    /// observability only.
    pub fn write(&self, data: &StateData) {
        if let Err(e) = self.write_inner(data) {
            warn!("unable to write state file {}: {e}", self.state_path.display());
        }
    }

    fn write_inner(&self, data: &StateData) -> anyhow::Result<()> {
        let parent = self
            .state_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("state path has no parent directory"))?;
        create_secure_directory(parent)?;

        let json = serde_json::to_string_pretty(data)?;
        let temp_path = parent.join(format!(".state-{}.tmp", Uuid::new_v4()));
        write_0600(&temp_path, json.as_bytes())?;

        fs::rename(&temp_path, &self.state_path).inspect_err(|_| {
            let _ = fs::remove_file(&temp_path);
        })?;
        Ok(())
    }

    /// Returns the zero-value (`NotStarted`) state if the file is missing —
    /// that is a legitimate "no update in progress" reading, not an error.
    /// Parse failures on an existing file are surfaced.
    pub fn read(&self) -> anyhow::Result<StateData> {
        match fs::read_to_string(&self.state_path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateData::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn write_0600(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
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
fn write_0600(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selfupdate::model::UpdateState;

    #[test]
    fn read_missing_file_returns_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateWriter::new(dir.path().join("state.json"));
        let data = writer.read().unwrap();
        assert_eq!(data.state, UpdateState::NotStarted);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateWriter::new(dir.path().join("state.json"));

        let data = StateData {
            update_id: "abc-123".to_string(),
            state: UpdateState::Staged,
            source_version: "1.0.0".to_string(),
            target_version: "2.0.0".to_string(),
            started_at: 1000,
            completed_at: None,
            error: None,
        };
        writer.write(&data);

        let read = writer.read().unwrap();
        assert_eq!(read.update_id, "abc-123");
        assert_eq!(read.state, UpdateState::Staged);
    }

    #[test]
    fn write_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateWriter::new(dir.path().join("state.json"));
        writer.write(&StateData::default());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".state-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn write_sets_0600_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = StateWriter::new(path.clone());
        writer.write(&StateData::default());

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
