use crate::logging::append_run_log;
use serde_json::json;
use std::fs;
use std::path::Path;

/// Removes `dir` and its files, but only when `dir` holds no directories.
///
/// Never recurses. Any failure stops the cleanup silently; trace removal is
/// best effort and is not reported to the caller.
pub fn safe_remove_all(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log_skipped(dir, &e.to_string());
            return;
        }
    };
    let mut files = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else {
            log_skipped(dir, "unreadable entry");
            return;
        };
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {
                log_skipped(dir, "contains a subdirectory");
                return;
            }
            Ok(_) => files.push(entry.path()),
            Err(e) => {
                log_skipped(dir, &e.to_string());
                return;
            }
        }
    }

    for file in &files {
        if let Err(e) = fs::remove_file(file) {
            log_skipped(dir, &e.to_string());
            return;
        }
    }
    let _ = fs::remove_dir(dir);
    append_run_log(
        "debug",
        "trace_dir.removed",
        json!({ "dir": dir.display().to_string(), "files": files.len() }),
    );
}

fn log_skipped(dir: &Path, reason: &str) {
    append_run_log(
        "debug",
        "trace_dir.remove.skipped",
        json!({ "dir": dir.display().to_string(), "reason": reason }),
    );
}
