//! Detached process launch, carried over from the teacher's
//! `upgrade/poll.rs::spawn_detached`: the staged binary must survive the
//! supervisor stopping the current agent, so it is placed in its own
//! session/process group and given no inherited stdio.

use std::path::Path;
use std::process::{Command, Stdio};

use super::error::{UpdateError, UpdateResult};

/// Launches `binary` with `args` as a detached, fire-and-forget process.
/// Does not wait for it to exit. Errors from the spawn itself (e.g. the
/// binary is missing) are surfaced; anything after that point is the
/// spawned process's own concern.
pub fn spawn_detached(binary: &Path, args: &[&str]) -> UpdateResult<()> {
    imp::spawn_detached(binary, args)
}

#[cfg(unix)]
mod imp {
    use super::{Command, Path, Stdio, UpdateError, UpdateResult};
    use std::os::unix::process::CommandExt;

    pub(super) fn spawn_detached(binary: &Path, args: &[&str]) -> UpdateResult<()> {
        unsafe {
            Command::new(binary)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .pre_exec(|| {
                    libc::setsid();
                    Ok(())
                })
                .spawn()
                .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to spawn {}: {e}", binary.display())))?;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use super::{Command, Path, Stdio, UpdateError, UpdateResult};
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;

    pub(super) fn spawn_detached(binary: &Path, args: &[&str]) -> UpdateResult<()> {
        Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(DETACHED_PROCESS)
            .spawn()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to spawn {}: {e}", binary.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_detached_surfaces_missing_binary_error() {
        let missing = Path::new("/nonexistent/definitely-not-a-binary");
        let err = spawn_detached(missing, &["upgrade"]).unwrap_err();
        assert!(matches!(err, UpdateError::Other(_)));
    }
}
