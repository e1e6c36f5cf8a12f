//! Types shared by the recorder, the replayer and whatever process-control
//! core consumes a replay.

use crate::errors::RrError;
use crate::replay::replayer::ReplayProcess;
use std::path::{Path, PathBuf};

/// Result of one recording. `trace_dir` and `exit` are independent: a target
/// that crashes still leaves a replayable trace.
#[derive(Debug)]
pub struct RecordOutcome {
    pub trace_dir: Option<PathBuf>,
    pub exit: Result<(), RrError>,
    /// Whether `StopHandle::stop` was called before the recording was reaped.
    pub stop_requested: bool,
}

impl RecordOutcome {
    pub fn trace_dir(&self) -> Option<&Path> {
        self.trace_dir.as_deref()
    }
}

/// How the debug target came to exist, reported to the core on dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOrigin {
    Launched,
}

#[derive(Debug, Clone)]
pub struct DialRequest<'a> {
    pub port: &'a str,
    pub executable: &'a Path,
    /// `None` when the stub is expected to report the pid itself.
    pub pid: Option<u32>,
    pub debug_info_dirs: &'a [PathBuf],
    pub origin: LaunchOrigin,
    /// Write memory with `X` packets instead of `M`; rr rejects `M`.
    pub use_x_command: bool,
}

/// A live connection produced by a [`Connector`].
pub trait TargetSession: Send {
    fn detach(&mut self, kill: bool) -> Result<(), RrError>;
}

/// The process-control core's connect operation.
pub trait Connector {
    type Session: TargetSession;

    fn dial(
        &self,
        process: &ReplayProcess,
        request: &DialRequest<'_>,
    ) -> Result<Self::Session, RrError>;
}
