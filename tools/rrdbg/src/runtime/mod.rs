use crate::errors::RrError;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Host facts the availability preflight depends on.
pub trait SystemProbe: Send + Sync {
    fn find_executable(&self, program: &str) -> Option<PathBuf>;
    fn read_to_string(&self, path: &Path) -> Result<String, RrError>;
}

pub struct ProductionSystemProbe;

impl SystemProbe for ProductionSystemProbe {
    fn find_executable(&self, program: &str) -> Option<PathBuf> {
        if program.contains('/') {
            let candidate = PathBuf::from(program);
            return is_executable(&candidate).then_some(candidate);
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }

    fn read_to_string(&self, path: &Path) -> Result<String, RrError> {
        std::fs::read_to_string(path).map_err(|e| RrError::Io(e.to_string()))
    }
}

fn is_executable(candidate: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(candidate) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[derive(Default, Clone)]
pub struct FakeSystemProbe {
    executables: Arc<Mutex<HashMap<String, PathBuf>>>,
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl FakeSystemProbe {
    pub fn with_executable(self, program: &str, path: impl Into<PathBuf>) -> Self {
        self.executables
            .lock()
            .expect("executables lock")
            .insert(program.to_string(), path.into());
        self
    }

    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().expect("lookups lock").clone()
    }
}

impl SystemProbe for FakeSystemProbe {
    fn find_executable(&self, program: &str) -> Option<PathBuf> {
        self.lookups
            .lock()
            .expect("lookups lock")
            .push(program.to_string());
        self.executables
            .lock()
            .expect("executables lock")
            .get(program)
            .cloned()
    }

    fn read_to_string(&self, path: &Path) -> Result<String, RrError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| RrError::Io(format!("missing file {}", path.display())))
    }
}

/// Creates an anonymous pipe with close-on-exec set atomically on both ends,
/// so neither end leaks into children spawned by other threads. Returns
/// `(reader, writer)`.
pub fn pipe_cloexec() -> Result<(File, File), RrError> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(RrError::Io(format!(
            "failed to create pipe: {}",
            std::io::Error::last_os_error()
        )));
    }
    let reader = unsafe { File::from_raw_fd(fds[0]) };
    let writer = unsafe { File::from_raw_fd(fds[1]) };
    Ok((reader, writer))
}

/// Pipe for capturing a subprocess's output through
/// `RedirectSpec::Handles`: hand the writer to the redirect, read the reader.
pub fn output_pipe() -> Result<(File, File), RrError> {
    pipe_cloexec()
}

pub fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), RrError> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| RrError::Process(format!("pid {pid} out of range")))?;
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(RrError::Process(format!(
            "failed to signal pid {pid}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
