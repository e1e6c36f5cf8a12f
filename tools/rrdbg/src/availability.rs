//! Preflight checks run before every record or replay.

use crate::config::RrToolConfig;
use crate::errors::RrError;
use crate::logging::append_run_log;
use crate::runtime::SystemProbe;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    ToolUnavailable,
    /// `perf_event_paranoid` is above 1; carries the value read.
    KernelRestricted(i64),
}

pub fn check(probe: &dyn SystemProbe, tool: &RrToolConfig) -> Availability {
    if probe.find_executable(&tool.program).is_none() {
        return Availability::ToolUnavailable;
    }

    // Missing or unreadable means the kernel does not restrict perf events.
    let Ok(raw) = probe.read_to_string(&tool.perf_event_paranoid_path) else {
        return Availability::Available;
    };
    let level = raw.trim().parse::<i64>().unwrap_or(0);
    if level > 1 {
        return Availability::KernelRestricted(level);
    }
    Availability::Available
}

pub fn ensure_available(probe: &dyn SystemProbe, tool: &RrToolConfig) -> Result<(), RrError> {
    match check(probe, tool) {
        Availability::Available => Ok(()),
        Availability::ToolUnavailable => {
            append_run_log(
                "info",
                "rr.unavailable",
                json!({ "program": tool.program }),
            );
            Err(RrError::BackendUnavailable)
        }
        Availability::KernelRestricted(actual) => {
            append_run_log(
                "error",
                "rr.perf_event_paranoid",
                json!({
                    "path": tool.perf_event_paranoid_path.display().to_string(),
                    "actual": actual,
                }),
            );
            Err(RrError::PerfEventParanoid { actual })
        }
    }
}
