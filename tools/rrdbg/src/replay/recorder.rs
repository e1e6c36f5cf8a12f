//! `rr record` driver.

use crate::availability::ensure_available;
use crate::errors::RrError;
use crate::logging::append_run_log;
use crate::redirect::{resolve, RedirectGuard, RedirectSpec};
use crate::replay::recording::RecordOutcome;
use crate::replay::RrBackend;
use crate::runtime::{pipe_cloexec, send_signal};
use serde_json::json;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;

/// Descriptor number rr is told to print the trace directory to.
pub const TRACE_DIR_FD: RawFd = 3;

#[derive(Default)]
struct SessionFlags {
    reaped: AtomicBool,
    stop_requested: AtomicBool,
}

/// A running `rr record`. Call [`RecordingSession::run`] to reap it and
/// collect the trace directory; dropping it instead kills rr.
pub struct RecordingSession {
    child: Option<Child>,
    trace_dir_writer: Option<File>,
    trace_dir_rx: Option<oneshot::Receiver<String>>,
    drain: Option<thread::JoinHandle<()>>,
    redirects: RedirectGuard,
    flags: Arc<SessionFlags>,
}

/// Asks a running recording to terminate early.
#[derive(Clone)]
pub struct StopHandle {
    pid: u32,
    flags: Arc<SessionFlags>,
}

impl StopHandle {
    /// Sends SIGTERM to rr and returns without waiting. Whether a trace
    /// directory is still produced is up to rr.
    pub fn stop(&self) -> Result<(), RrError> {
        self.flags.stop_requested.store(true, Ordering::SeqCst);
        if self.flags.reaped.load(Ordering::SeqCst) {
            return Ok(());
        }
        append_run_log("info", "rr.record.stop", json!({ "pid": self.pid }));
        send_signal(self.pid, libc::SIGTERM)
    }
}

impl RrBackend<'_> {
    pub fn record_async(
        &self,
        argv: &[String],
        work_dir: &Path,
        quiet: bool,
        redirects: &RedirectSpec<'_>,
    ) -> Result<(RecordingSession, StopHandle), RrError> {
        if argv.is_empty() {
            return Err(RrError::InvalidConfig(
                "record needs a program to run".to_string(),
            ));
        }
        ensure_available(self.probe, self.tool)?;

        let (mut reader, writer) = pipe_cloexec()?;
        let (trace_dir_tx, trace_dir_rx) = oneshot::channel();
        let drain = thread::spawn(move || {
            let mut raw = Vec::new();
            let _ = reader.read_to_end(&mut raw);
            let _ = trace_dir_tx.send(String::from_utf8_lossy(&raw).trim().to_string());
        });

        let mut guard = RedirectGuard::default();
        let spawned = resolve(redirects, quiet, &mut guard).and_then(|stdio| {
            let mut cmd = Command::new(&self.tool.program);
            cmd.arg("record")
                .arg(format!("--print-trace-dir={TRACE_DIR_FD}"))
                .args(argv)
                .current_dir(work_dir)
                .stdin(stdio.stdin)
                .stdout(stdio.stdout)
                .stderr(stdio.stderr);
            let write_fd = writer.as_raw_fd();
            // SAFETY: the hook only calls async-signal-safe dup2/fcntl.
            unsafe {
                cmd.pre_exec(move || install_fd(write_fd, TRACE_DIR_FD));
            }
            cmd.spawn().map_err(|e| {
                RrError::Process(format!("failed to start {}: {e}", self.tool.program))
            })
        });

        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                guard.release();
                drop(writer);
                let _ = drain.join();
                append_run_log(
                    "error",
                    "rr.record.spawn_failed",
                    json!({ "argv": argv, "error": err.to_string() }),
                );
                return Err(err);
            }
        };

        let pid = child.id();
        append_run_log(
            "info",
            "rr.record.spawned",
            json!({
                "pid": pid,
                "argv": argv,
                "work_dir": work_dir.display().to_string(),
                "quiet": quiet,
            }),
        );

        let flags = Arc::new(SessionFlags::default());
        let session = RecordingSession {
            child: Some(child),
            trace_dir_writer: Some(writer),
            trace_dir_rx: Some(trace_dir_rx),
            drain: Some(drain),
            redirects: guard,
            flags: Arc::clone(&flags),
        };
        Ok((session, StopHandle { pid, flags }))
    }

    /// Records `argv` to completion. A failing target is not an error here:
    /// check `trace_dir` first, `exit` second.
    pub fn record(
        &self,
        argv: &[String],
        work_dir: &Path,
        quiet: bool,
        redirects: &RedirectSpec<'_>,
    ) -> Result<RecordOutcome, RrError> {
        let (session, _stop) = self.record_async(argv, work_dir, quiet, redirects)?;
        Ok(session.run())
    }
}

impl RecordingSession {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Waits for rr to exit and returns the trace directory it reported.
    pub fn run(mut self) -> RecordOutcome {
        let exit = match self.child.take() {
            Some(mut child) => match child.wait() {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(RrError::Process(format!("rr record exited with {status}"))),
                Err(e) => Err(RrError::Process(format!("failed to wait for rr record: {e}"))),
            },
            None => Err(RrError::Process("recording already reaped".to_string())),
        };
        self.flags.reaped.store(true, Ordering::SeqCst);
        self.redirects.release();

        // rr's copy of the write end is gone; closing ours lets the drain hit EOF.
        drop(self.trace_dir_writer.take());
        let raw = self
            .trace_dir_rx
            .take()
            .and_then(|rx| rx.blocking_recv().ok())
            .unwrap_or_default();
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }

        let trace_dir = (!raw.is_empty()).then(|| PathBuf::from(raw));
        let stop_requested = self.flags.stop_requested.load(Ordering::SeqCst);
        append_run_log(
            if trace_dir.is_some() { "info" } else { "warn" },
            "rr.record.finished",
            json!({
                "trace_dir": trace_dir.as_ref().map(|d| d.display().to_string()),
                "exit_error": exit.as_ref().err().map(ToString::to_string),
                "stop_requested": stop_requested,
            }),
        );
        RecordOutcome {
            trace_dir,
            exit,
            stop_requested,
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            self.flags.reaped.store(true, Ordering::SeqCst);
        }
        drop(self.trace_dir_writer.take());
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
    }
}

/// Runs in the forked child: makes `src` available as `dst` across exec.
fn install_fd(src: RawFd, dst: RawFd) -> std::io::Result<()> {
    if src == dst {
        // dup2 onto itself keeps FD_CLOEXEC, so clear it directly.
        let flags = unsafe { libc::fcntl(src, libc::F_GETFD) };
        if flags < 0 || unsafe { libc::fcntl(src, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        return Ok(());
    }
    if unsafe { libc::dup2(src, dst) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::RrToolConfig;
    use crate::errors::RrError;
    use crate::redirect::RedirectSpec;
    use crate::replay::RrBackend;
    use crate::runtime::FakeSystemProbe;
    use std::path::Path;

    #[test]
    fn empty_argv_is_rejected_before_preflight() {
        let probe = FakeSystemProbe::default();
        let tool = RrToolConfig::default();
        let err = RrBackend::new(&probe, &tool)
            .record_async(&[], Path::new("."), true, &RedirectSpec::default())
            .err()
            .expect("empty argv");
        assert!(matches!(err, RrError::InvalidConfig(_)));
        assert!(probe.lookups().is_empty());
    }

    #[test]
    fn missing_rr_is_backend_unavailable() {
        let probe = FakeSystemProbe::default();
        let tool = RrToolConfig::default();
        let err = RrBackend::new(&probe, &tool)
            .record_async(&["true".to_string()], Path::new("."), true, &RedirectSpec::default())
            .err()
            .expect("no rr");
        assert!(err.is_backend_unavailable());
    }

    #[test]
    fn unreadable_stdin_redirect_fails_without_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let probe = FakeSystemProbe::default().with_executable("rr", "/bin/sh");
        let tool = RrToolConfig::default();
        let spec = RedirectSpec::Paths {
            stdin: Some(dir.path().join("missing")),
            stdout: None,
            stderr: None,
        };
        let err = RrBackend::new(&probe, &tool)
            .record_async(&["true".to_string()], dir.path(), false, &spec)
            .err()
            .expect("redirect failure");
        assert!(matches!(err, RrError::Io(_)));
    }
}
