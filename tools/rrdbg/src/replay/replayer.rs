use crate::availability::ensure_available;
use crate::errors::RrError;
use crate::gdb_command::{parse_gdb_command, ConnectionDescriptor, GDB_COMMAND_PREFIX, GDB_LAUNCH_PREFIX};
use crate::logging::append_run_log;
use crate::redirect::RedirectSpec;
use crate::replay::recording::{Connector, DialRequest, LaunchOrigin, TargetSession};
use crate::replay::RrBackend;
use crate::trace_dir::safe_remove_all;
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use tokio::sync::oneshot;

type DescriptorResult = Result<ConnectionDescriptor, RrError>;

/// The `rr replay` gdb stub backing a [`ReplayTarget`].
pub struct ReplayProcess {
    child: Option<Child>,
    pid: u32,
    trace_dir: PathBuf,
    on_detach: Option<Box<dyn FnOnce() + Send>>,
    scanner: Option<thread::JoinHandle<()>>,
}

impl ReplayProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn trace_dir(&self) -> &Path {
        &self.trace_dir
    }

    /// Kills and reaps rr. Safe to call more than once.
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let _ = child.kill();
        let status = child.wait();
        append_run_log(
            "debug",
            "rr.replay.reaped",
            json!({
                "pid": self.pid,
                "status": status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string()),
            }),
        );
        if let Some(scanner) = self.scanner.take() {
            let _ = scanner.join();
        }
    }

    fn run_detach_hook(&mut self) {
        if let Some(hook) = self.on_detach.take() {
            hook();
        }
    }
}

impl Drop for ReplayProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A connected replay: the session produced by the connector plus the rr
/// process serving it.
pub struct ReplayTarget<S> {
    session: S,
    process: ReplayProcess,
}

impl<S: TargetSession> ReplayTarget<S> {
    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn process(&self) -> &ReplayProcess {
        &self.process
    }

    /// Detaches the session, stops rr, then runs the on-detach hook (trace
    /// removal when requested). The hook runs even if the session detach fails.
    pub fn detach(mut self, kill: bool) -> Result<(), RrError> {
        let result = self.session.detach(kill);
        self.process.terminate();
        self.process.run_detach_hook();
        append_run_log(
            "info",
            "rr.replay.detached",
            json!({
                "trace_dir": self.process.trace_dir.display().to_string(),
                "kill": kill,
                "error": result.as_ref().err().map(ToString::to_string),
            }),
        );
        result
    }
}

/// A replay of a recording made on the spot.
pub struct RecordedReplay<S> {
    pub target: ReplayTarget<S>,
    pub trace_dir: PathBuf,
}

impl RrBackend<'_> {
    pub fn replay<C: Connector>(
        &self,
        trace_dir: &Path,
        quiet: bool,
        delete_on_detach: bool,
        debug_info_dirs: &[PathBuf],
        connector: &C,
    ) -> Result<ReplayTarget<C::Session>, RrError> {
        ensure_available(self.probe, self.tool)?;

        // The scanner starts after the spawn; rr's stderr buffers in the pipe
        // until it reads, and a full pipe only stalls rr, it loses nothing.
        let mut child = Command::new(&self.tool.program)
            .arg("replay")
            .arg("--dbgport=0")
            .arg(trace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| RrError::Process(format!("failed to start {}: {e}", self.tool.program)))?;
        let pid = child.id();
        append_run_log(
            "info",
            "rr.replay.spawned",
            json!({ "pid": pid, "trace_dir": trace_dir.display().to_string() }),
        );

        let Some(stderr) = child.stderr.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RrError::Process("rr replay stderr was not captured".to_string()));
        };
        let (descriptor_tx, descriptor_rx) = oneshot::channel();
        let scanner = thread::spawn(move || {
            scan_diagnostics(stderr, &mut std::io::stderr(), quiet, descriptor_tx);
        });

        let mut process = ReplayProcess {
            child: Some(child),
            pid,
            trace_dir: trace_dir.to_path_buf(),
            on_detach: None,
            scanner: Some(scanner),
        };

        let descriptor = descriptor_rx.blocking_recv().unwrap_or_else(|_| {
            Err(RrError::Process(
                "rr replay output scanner stopped without a result".to_string(),
            ))
        });
        let descriptor = match descriptor {
            Ok(descriptor) => descriptor,
            Err(err) => {
                append_run_log(
                    "error",
                    "rr.replay.descriptor_failed",
                    json!({ "pid": pid, "error": err.to_string() }),
                );
                process.terminate();
                return Err(err);
            }
        };

        if delete_on_detach {
            let dir = trace_dir.to_path_buf();
            process.on_detach = Some(Box::new(move || safe_remove_all(&dir)));
        }

        let request = DialRequest {
            port: &descriptor.port,
            executable: &descriptor.executable,
            pid: None,
            debug_info_dirs,
            origin: LaunchOrigin::Launched,
            use_x_command: true,
        };
        match connector.dial(&process, &request) {
            Ok(session) => Ok(ReplayTarget { session, process }),
            Err(err) => {
                append_run_log(
                    "error",
                    "rr.replay.dial_failed",
                    json!({ "pid": pid, "port": descriptor.port, "error": err.to_string() }),
                );
                process.terminate();
                Err(err)
            }
        }
    }

    /// Records `argv` and immediately replays the new trace, which is removed
    /// again when the replay detaches.
    pub fn record_and_replay<C: Connector>(
        &self,
        argv: &[String],
        work_dir: &Path,
        quiet: bool,
        debug_info_dirs: &[PathBuf],
        redirects: &RedirectSpec<'_>,
        connector: &C,
    ) -> Result<RecordedReplay<C::Session>, RrError> {
        let outcome = self.record(argv, work_dir, quiet, redirects)?;
        let Some(trace_dir) = outcome.trace_dir else {
            return Err(match outcome.exit {
                Err(err) => err,
                Ok(()) => RrError::Process("rr record did not report a trace directory".to_string()),
            });
        };
        match self.replay(&trace_dir, quiet, true, debug_info_dirs, connector) {
            Ok(target) => Ok(RecordedReplay { target, trace_dir }),
            Err(source) => Err(RrError::Replay {
                trace_dir,
                source: Box::new(source),
            }),
        }
    }
}

/// Reads rr's stderr until the gdb command line appears, sends the parsed
/// descriptor (or the reason there is none) exactly once, then passes the
/// rest of the stream through to `echo`.
fn scan_diagnostics<R: Read, W: Write>(
    stream: R,
    echo: &mut W,
    quiet: bool,
    descriptor_tx: oneshot::Sender<DescriptorResult>,
) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                let _ = descriptor_tx.send(Err(RrError::Process(
                    "rr replay exited before printing a gdb command".to_string(),
                )));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = descriptor_tx.send(Err(RrError::Io(format!(
                    "failed to read rr replay output: {e}"
                ))));
                return;
            }
        }

        let text = String::from_utf8_lossy(&line);
        if text.starts_with(GDB_COMMAND_PREFIX) {
            let _ = descriptor_tx.send(parse_gdb_command(text.trim_end_matches(['\r', '\n'])));
            break;
        }
        if text.starts_with(GDB_LAUNCH_PREFIX) {
            continue;
        }
        if !quiet {
            let _ = echo.write_all(&line);
        }
    }
    let _ = std::io::copy(&mut reader, echo);
}

#[cfg(test)]
mod tests {
    use super::scan_diagnostics;
    use crate::errors::RrError;
    use std::io::Cursor;
    use std::path::PathBuf;
    use tokio::sync::oneshot;

    fn scan(input: &str, quiet: bool) -> (Result<super::ConnectionDescriptor, RrError>, String) {
        let (tx, rx) = oneshot::channel();
        let mut echoed = Vec::new();
        scan_diagnostics(Cursor::new(input.as_bytes().to_vec()), &mut echoed, quiet, tx);
        let result = rx.blocking_recv().expect("scanner sent a result");
        (result, String::from_utf8(echoed).expect("utf8"))
    }

    #[test]
    fn descriptor_is_parsed_and_remaining_output_passes_through() {
        let (result, echoed) = scan(
            "rr: Saving execution to trace directory\n\
             Launch gdb with\n  gdb '-l' '10000' '-ex' 'target extended-remote 127.0.0.1:4000' /bin/true\n\
             later diagnostic\n",
            false,
        );
        let descriptor = result.expect("descriptor");
        assert_eq!(descriptor.port, "127.0.0.1:4000");
        assert_eq!(descriptor.executable, PathBuf::from("/bin/true"));
        assert_eq!(
            echoed,
            "rr: Saving execution to trace directory\nlater diagnostic\n"
        );
    }

    #[test]
    fn quiet_suppresses_lines_before_command_only() {
        let (result, echoed) = scan(
            "noise\n  gdb -ex 'target extended-remote :1' exe\ntail\n",
            true,
        );
        assert!(result.is_ok());
        assert_eq!(echoed, "tail\n");
    }

    #[test]
    fn eof_before_command_is_an_error() {
        let (result, echoed) = scan("rr: trace is corrupt\n", false);
        assert!(matches!(result, Err(RrError::Process(_))));
        assert_eq!(echoed, "rr: trace is corrupt\n");
    }

    #[test]
    fn malformed_command_is_reported_and_stream_still_drains() {
        let (result, echoed) = scan("  gdb -l 1 exe\nafter\n", true);
        assert!(matches!(result, Err(RrError::MalformedGdbCommand { .. })));
        assert_eq!(echoed, "after\n");
    }
}
