//! Recording and replaying programs with `rr`.
//!
//! # Overview
//!
//! 1. **Recorder**: `rr record --print-trace-dir=3 <argv>` runs the target; a
//!    drain thread collects the trace directory rr writes to descriptor 3.
//! 2. **Replayer**: `rr replay --dbgport=0 <trace>` starts a gdb stub; a scanner
//!    thread reads rr's stderr until rr announces how to attach, then the
//!    [`recording::Connector`] dials the stub.
//!
//! Each background thread hands exactly one value back over a
//! `tokio::sync::oneshot` channel. The receiving side blocks only once the
//! sender is guaranteed to finish: the recorder closes its own copy of the
//! pipe's write end before waiting, so EOF is reachable even when rr never
//! wrote anything.

pub mod recorder;
pub mod recording;
pub mod replayer;

use crate::config::RrToolConfig;
use crate::runtime::SystemProbe;

/// Entry point for record/replay operations against one `rr` installation.
pub struct RrBackend<'a> {
    probe: &'a dyn SystemProbe,
    tool: &'a RrToolConfig,
}

impl<'a> RrBackend<'a> {
    pub fn new(probe: &'a dyn SystemProbe, tool: &'a RrToolConfig) -> Self {
        Self { probe, tool }
    }
}
