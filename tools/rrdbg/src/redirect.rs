//! Resolution of stdio redirects for the recorded program.
//!
//! A [`RedirectSpec`] either lends already-open handles (owned by the caller,
//! never closed here) or names paths that this module opens. Files opened
//! here are tracked by a [`RedirectGuard`] and closed exactly once by
//! [`RedirectGuard::release`], including when resolution fails part way.

use crate::errors::RrError;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

#[derive(Debug)]
pub enum RedirectSpec<'a> {
    Handles {
        stdin: Option<&'a File>,
        stdout: Option<&'a File>,
        stderr: Option<&'a File>,
    },
    Paths {
        stdin: Option<PathBuf>,
        stdout: Option<PathBuf>,
        stderr: Option<PathBuf>,
    },
}

impl Default for RedirectSpec<'_> {
    fn default() -> Self {
        Self::Paths {
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }
}

#[derive(Debug)]
pub enum StdioTarget {
    Inherit,
    Null,
    File(File),
}

impl StdioTarget {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Self::Inherit)
    }
}

impl From<StdioTarget> for Stdio {
    fn from(value: StdioTarget) -> Self {
        match value {
            StdioTarget::Inherit => Stdio::inherit(),
            StdioTarget::Null => Stdio::null(),
            StdioTarget::File(file) => Stdio::from(file),
        }
    }
}

#[derive(Debug)]
pub struct ResolvedStdio {
    pub stdin: StdioTarget,
    pub stdout: StdioTarget,
    pub stderr: StdioTarget,
}

/// Owns the files opened while resolving a path-mode redirect.
#[derive(Debug, Default)]
pub struct RedirectGuard {
    opened: Vec<File>,
}

impl RedirectGuard {
    pub fn tracked(&self) -> usize {
        self.opened.len()
    }

    /// Closes every tracked handle and returns how many were closed. Later
    /// calls close nothing.
    pub fn release(&mut self) -> usize {
        let closed = self.opened.len();
        self.opened.clear();
        closed
    }

    fn track(&mut self, file: File) -> Result<StdioTarget, RrError> {
        // The subprocess gets a duplicate; the original stays here until release.
        let dup = file.try_clone()?;
        self.opened.push(file);
        Ok(StdioTarget::File(dup))
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Turns `spec` into concrete stdio targets. Handles opened for path-mode
/// entries are left in `guard`; on error the guard holds whatever was opened
/// before the failure and the caller must release it.
pub fn resolve(
    spec: &RedirectSpec<'_>,
    quiet: bool,
    guard: &mut RedirectGuard,
) -> Result<ResolvedStdio, RrError> {
    match spec {
        RedirectSpec::Handles {
            stdin,
            stdout,
            stderr,
        } => Ok(ResolvedStdio {
            stdin: borrowed(*stdin, StdioTarget::Inherit)?,
            stdout: borrowed(*stdout, StdioTarget::Null)?,
            stderr: borrowed(*stderr, StdioTarget::Null)?,
        }),
        RedirectSpec::Paths {
            stdin,
            stdout,
            stderr,
        } => {
            let stdin = match non_empty(stdin) {
                Some(path) => guard.track(open_input(path)?)?,
                None if quiet => StdioTarget::Inherit,
                None => StdioTarget::Null,
            };
            let stdout = match non_empty(stdout) {
                Some(path) => guard.track(create_output(path)?)?,
                None => StdioTarget::Inherit,
            };
            let stderr = match non_empty(stderr) {
                Some(path) => guard.track(create_output(path)?)?,
                None => StdioTarget::Inherit,
            };
            Ok(ResolvedStdio {
                stdin,
                stdout,
                stderr,
            })
        }
    }
}

fn borrowed(handle: Option<&File>, fallback: StdioTarget) -> Result<StdioTarget, RrError> {
    match handle {
        Some(file) => Ok(StdioTarget::File(file.try_clone()?)),
        None => Ok(fallback),
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

fn open_input(path: &Path) -> Result<File, RrError> {
    File::open(path).map_err(|e| {
        RrError::Io(format!("failed to open stdin redirect {}: {e}", path.display()))
    })
}

fn create_output(path: &Path) -> Result<File, RrError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| RrError::Io(format!("failed to create redirect {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::{resolve, RedirectGuard, RedirectSpec, StdioTarget};
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn default_paths_use_process_streams() {
        let mut guard = RedirectGuard::default();
        let stdio = resolve(&RedirectSpec::default(), false, &mut guard).expect("resolve");
        assert!(matches!(stdio.stdin, StdioTarget::Null));
        assert!(stdio.stdout.is_inherit());
        assert!(stdio.stderr.is_inherit());
        assert_eq!(guard.release(), 0);
    }

    #[test]
    fn quiet_default_stdin_inherits() {
        let mut guard = RedirectGuard::default();
        let stdio = resolve(&RedirectSpec::default(), true, &mut guard).expect("resolve");
        assert!(stdio.stdin.is_inherit());
    }

    #[test]
    fn path_mode_tracks_every_opened_file_and_releases_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "hello").expect("seed stdin");
        let out = dir.path().join("out.txt");
        std::fs::write(&out, "stale contents").expect("seed stdout");

        let spec = RedirectSpec::Paths {
            stdin: Some(input),
            stdout: Some(out.clone()),
            stderr: Some(dir.path().join("err.txt")),
        };
        let mut guard = RedirectGuard::default();
        let stdio = resolve(&spec, false, &mut guard).expect("resolve");
        assert!(matches!(stdio.stdout, StdioTarget::File(_)));
        assert_eq!(guard.tracked(), 3);
        assert_eq!(std::fs::read_to_string(&out).expect("read"), "");
        assert!(dir.path().join("err.txt").exists());

        assert_eq!(guard.release(), 3);
        assert_eq!(guard.release(), 0);
    }

    #[test]
    fn empty_paths_count_as_defaults() {
        let spec = RedirectSpec::Paths {
            stdin: Some("".into()),
            stdout: Some("".into()),
            stderr: None,
        };
        let mut guard = RedirectGuard::default();
        let stdio = resolve(&spec, false, &mut guard).expect("resolve");
        assert!(matches!(stdio.stdin, StdioTarget::Null));
        assert!(stdio.stdout.is_inherit());
        assert_eq!(guard.tracked(), 0);
    }

    #[test]
    fn unreadable_stdin_fails_before_anything_is_opened() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = RedirectSpec::Paths {
            stdin: Some(dir.path().join("missing.txt")),
            stdout: Some(dir.path().join("out.txt")),
            stderr: None,
        };
        let mut guard = RedirectGuard::default();
        resolve(&spec, false, &mut guard).expect_err("missing stdin");
        assert_eq!(guard.release(), 0);
        assert!(!dir.path().join("out.txt").exists());
    }

    #[test]
    fn failure_after_partial_open_leaves_earlier_handles_for_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = RedirectSpec::Paths {
            stdin: None,
            stdout: Some(dir.path().join("out.txt")),
            stderr: Some(dir.path().join("no-such-dir").join("err.txt")),
        };
        let mut guard = RedirectGuard::default();
        resolve(&spec, false, &mut guard).expect_err("stderr dir missing");
        assert_eq!(guard.release(), 1);
    }

    #[test]
    fn handle_mode_duplicates_caller_handles_and_tracks_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.txt");
        let mut out = File::create(&path).expect("create");
        let spec = RedirectSpec::Handles {
            stdin: None,
            stdout: Some(&out),
            stderr: None,
        };
        let mut guard = RedirectGuard::default();
        let stdio = resolve(&spec, false, &mut guard).expect("resolve");
        assert!(stdio.stdin.is_inherit());
        assert!(matches!(stdio.stderr, StdioTarget::Null));
        assert_eq!(guard.release(), 0);

        drop(stdio);
        out.write_all(b"still open").expect("caller handle survives");
    }
}
