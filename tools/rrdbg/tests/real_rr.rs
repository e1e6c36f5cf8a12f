//! Runs against the host's rr. Each test returns early unless rr is on PATH
//! and the kernel allows recording.

use rrdbg::availability::{check, Availability};
use rrdbg::config::RrToolConfig;
use rrdbg::gdbremote::GdbRemoteConnector;
use rrdbg::redirect::RedirectSpec;
use rrdbg::replay::RrBackend;
use rrdbg::runtime::ProductionSystemProbe;
use rrdbg::trace_dir::safe_remove_all;
use std::time::Duration;

fn rr_usable(tool: &RrToolConfig) -> bool {
    let availability = check(&ProductionSystemProbe, tool);
    if availability != Availability::Available {
        eprintln!("skipping: rr is not usable here ({availability:?})");
        return false;
    }
    true
}

#[test]
fn records_true_and_reports_its_trace() {
    let tool = RrToolConfig::default();
    if !rr_usable(&tool) {
        return;
    }
    let backend = RrBackend::new(&ProductionSystemProbe, &tool);
    let work_dir = tempfile::tempdir().expect("tempdir");

    let (session, _stop) = backend
        .record_async(
            &["true".to_string()],
            work_dir.path(),
            true,
            &RedirectSpec::default(),
        )
        .expect("record_async");
    let outcome = session.run();

    assert!(outcome.exit.is_ok(), "rr record failed: {:?}", outcome.exit);
    let trace = outcome.trace_dir().expect("trace dir").to_path_buf();
    assert!(trace.is_dir());
    safe_remove_all(&trace);
}

#[test]
fn record_and_replay_connects_and_removes_trace_on_detach() {
    let tool = RrToolConfig::default();
    if !rr_usable(&tool) {
        return;
    }
    let backend = RrBackend::new(&ProductionSystemProbe, &tool);
    let work_dir = tempfile::tempdir().expect("tempdir");
    let connector = GdbRemoteConnector::new(Duration::from_secs(10));

    let recorded = backend
        .record_and_replay(
            &["true".to_string()],
            work_dir.path(),
            true,
            &[],
            &RedirectSpec::default(),
            &connector,
        )
        .expect("record and replay");
    let trace = recorded.trace_dir.clone();
    assert!(trace.is_dir());
    assert!(!recorded.target.session().stop_reply().is_empty());
    assert!(recorded.target.session().pid().is_some());

    recorded.target.detach(true).expect("detach");
    assert!(!trace.exists());
}
