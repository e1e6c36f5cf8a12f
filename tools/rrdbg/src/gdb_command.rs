//! Parser for the gdb invocation `rr replay` prints on its stderr.
//!
//! rr announces where its gdb stub listens only as human-readable text, e.g.
//!
//! ```text
//! Launch gdb with
//!   gdb '-l' '10000' '-ex' 'set sysroot /' '-ex' 'target extended-remote 127.0.0.1:43921' /tmp/a.out
//! ```
//!
//! This format is not versioned. Everything that depends on it lives here.

use crate::errors::RrError;
use std::path::PathBuf;

pub const GDB_COMMAND_PREFIX: &str = "  gdb ";
pub const GDB_LAUNCH_PREFIX: &str = "Launch gdb with";
pub const TARGET_COMMAND: &str = "target extended-remote ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// `host:port` of the gdb stub.
    pub port: String,
    pub executable: PathBuf,
}

/// Splits `line` on whitespace, keeping spans enclosed in `quote` inside a
/// single field. Within quotes a backslash escapes the next character.
pub fn split_quoted_fields(line: &str, quote: char) -> Vec<String> {
    #[derive(Clone, Copy)]
    enum State {
        Space,
        Field,
        Quoted,
        Escaped,
    }

    let mut fields = Vec::new();
    let mut buf = String::new();
    let mut state = State::Space;
    let mut started = false;

    for ch in line.chars() {
        match state {
            State::Space | State::Field if ch == quote => {
                state = State::Quoted;
                started = true;
            }
            State::Space if ch.is_whitespace() => {}
            State::Space => {
                buf.push(ch);
                state = State::Field;
                started = true;
            }
            State::Field if ch.is_whitespace() => {
                fields.push(std::mem::take(&mut buf));
                state = State::Space;
                started = false;
            }
            State::Field => buf.push(ch),
            State::Quoted if ch == quote => state = State::Field,
            State::Quoted if ch == '\\' => state = State::Escaped,
            State::Quoted => buf.push(ch),
            State::Escaped => {
                buf.push(ch);
                state = State::Quoted;
            }
        }
    }
    if started {
        fields.push(buf);
    }
    fields
}

pub fn parse_gdb_command(line: &str) -> Result<ConnectionDescriptor, RrError> {
    let malformed = |reason: &str| RrError::MalformedGdbCommand {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let fields = split_quoted_fields(line, '\'');
    let mut port: Option<&str> = None;
    let mut i = 0;
    while i < fields.len() {
        match fields[i].as_str() {
            "-ex" => {
                let arg = fields
                    .get(i + 1)
                    .ok_or_else(|| malformed("-ex not followed by an argument"))?;
                if let Some(rest) = arg.strip_prefix(TARGET_COMMAND) {
                    port = Some(rest);
                }
                i += 1;
            }
            "-l" => i += 1,
            _ => {}
        }
        i += 1;
    }

    let port = port
        .filter(|p| !p.is_empty())
        .ok_or_else(|| malformed("could not find -ex argument"))?;
    let executable = fields
        .last()
        .ok_or_else(|| malformed("missing executable"))?;

    Ok(ConnectionDescriptor {
        port: port.to_string(),
        executable: PathBuf::from(executable),
    })
}
