use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Locates executables, optionally against a caller-supplied search path.
pub struct WhichUtil;

impl WhichUtil {
    /// Locate `command` on the process `PATH`.
    pub fn which(command: &str) -> Result<PathBuf> {
        which::which(command)
            .with_context(|| format!("{command}: command not found on PATH"))
    }

    /// Locate `command` using `search_path` instead of the process `PATH`.
    ///
    /// Commands containing a path separator are resolved relative to `cwd`
    /// and returned as-is when they exist.
    pub fn which_in(command: &str, search_path: &OsStr, cwd: &Path) -> Result<PathBuf> {
        anyhow::ensure!(!command.is_empty(), "command must not be empty");
        which::which_in(command, Some(search_path), cwd).with_context(|| {
            format!(
                "{command}: command not found in search path '{}'",
                search_path.to_string_lossy()
            )
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn which_in_prefers_earlier_entries() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for dir in [first.path(), second.path()] {
            let exe = dir.join("run-suite");
            std::fs::write(&exe, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let search = std::env::join_paths([first.path(), second.path()]).unwrap();
        let found = WhichUtil::which_in("run-suite", &search, first.path()).unwrap();
        assert_eq!(found, first.path().join("run-suite"));
    }

    #[test]
    fn which_in_missing_command_errors() {
        let dir = tempfile::tempdir().unwrap();
        let search = dir.path().as_os_str().to_owned();
        assert!(WhichUtil::which_in("no-such-suite", &search, dir.path()).is_err());
        assert!(WhichUtil::which_in("", &search, dir.path()).is_err());
    }
}
