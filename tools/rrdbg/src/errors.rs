use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RrError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("rr backend unavailable: rr could not be found on PATH")]
    BackendUnavailable,
    #[error("rr needs /proc/sys/kernel/perf_event_paranoid <= 1, but it is {actual}")]
    PerfEventParanoid { actual: i64 },
    #[error("malformed gdb command {line:?}: {reason}")]
    MalformedGdbCommand { line: String, reason: String },
    #[error("remote protocol error: {0}")]
    Protocol(String),
    #[error("replay of {} failed: {source}", trace_dir.display())]
    Replay {
        trace_dir: PathBuf,
        #[source]
        source: Box<RrError>,
    },
}

impl RrError {
    /// True when the caller should fall back to another backend rather than
    /// report a failure.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable)
    }
}

impl From<std::io::Error> for RrError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
