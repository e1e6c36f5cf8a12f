//! Minimal blocking client for the GDB remote serial protocol.
//!
//! Only what is needed to hand a replay to a debugger core: framing and
//! acknowledgement, the initial handshake, memory access and detach.

use crate::errors::RrError;
use crate::logging::append_run_log;
use crate::replay::recording::{Connector, DialRequest, TargetSession};
use crate::replay::replayer::ReplayProcess;
use serde_json::json;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_RETRANSMITS: usize = 3;
const SUPPORTED_FEATURES: &str = "qSupported:multiprocess+;swbreak+;hwbreak+;xmlRegisters=i386";

pub struct RemoteConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    no_ack: bool,
}

impl RemoteConnection {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, RrError> {
        let addrs = addr
            .to_socket_addrs()
            .map_err(|e| RrError::Protocol(format!("invalid stub address {addr}: {e}")))?;
        let mut last_err = None;
        for candidate in addrs {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(RrError::Protocol(match last_err {
            Some(e) => format!("failed to connect to {addr}: {e}"),
            None => format!("{addr} did not resolve to any address"),
        }))
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, RrError> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            no_ack: false,
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), RrError> {
        self.writer.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn send_packet(&mut self, data: &[u8]) -> Result<(), RrError> {
        let mut frame = Vec::with_capacity(data.len() + 4);
        frame.push(b'$');
        frame.extend_from_slice(data);
        frame.push(b'#');
        frame.extend_from_slice(format!("{:02x}", checksum(data)).as_bytes());

        for _ in 0..MAX_RETRANSMITS {
            self.writer.write_all(&frame)?;
            if self.no_ack {
                return Ok(());
            }
            loop {
                match self.read_byte()? {
                    b'+' => return Ok(()),
                    b'-' => break,
                    _ => continue,
                }
            }
        }
        Err(RrError::Protocol(format!(
            "packet {:?} rejected {MAX_RETRANSMITS} times",
            String::from_utf8_lossy(data)
        )))
    }

    pub fn recv_packet(&mut self) -> Result<Vec<u8>, RrError> {
        loop {
            while self.read_byte()? != b'$' {}
            let mut payload = Vec::new();
            loop {
                match self.read_byte()? {
                    b'#' => break,
                    byte => payload.push(byte),
                }
            }
            let sum = [self.read_byte()?, self.read_byte()?];
            let expected = std::str::from_utf8(&sum)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok());

            if self.no_ack {
                return Ok(decode_rle(&payload));
            }
            if expected == Some(checksum(&payload)) {
                self.writer.write_all(b"+")?;
                return Ok(decode_rle(&payload));
            }
            self.writer.write_all(b"-")?;
        }
    }

    /// Sends `command` and returns the reply as text. `Exx` replies are errors.
    pub fn request(&mut self, command: &str) -> Result<String, RrError> {
        self.send_packet(command.as_bytes())?;
        let reply = String::from_utf8_lossy(&self.recv_packet()?).into_owned();
        if is_error_reply(&reply) {
            return Err(RrError::Protocol(format!("{command} failed: {reply}")));
        }
        Ok(reply)
    }

    fn read_byte(&mut self) -> Result<u8, RrError> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte) {
            Ok(0) => Err(RrError::Protocol("connection closed by stub".to_string())),
            Ok(_) => Ok(byte[0]),
            Err(e) => Err(RrError::Protocol(e.to_string())),
        }
    }

    fn shutdown(&self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn is_error_reply(reply: &str) -> bool {
    reply.len() == 3
        && reply.starts_with('E')
        && reply[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Expands `x*n` run-length sequences: `n - 29` more copies of `x`.
pub fn decode_rle(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut iter = payload.iter().copied();
    while let Some(byte) = iter.next() {
        if byte == b'*' {
            if let (Some(&last), Some(count)) = (out.last(), iter.next()) {
                let repeat = usize::from(count).saturating_sub(29);
                out.extend(std::iter::repeat(last).take(repeat));
                continue;
            }
        }
        out.push(byte);
    }
    out
}

pub fn escape_binary(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if matches!(byte, b'#' | b'$' | b'}' | b'*') {
            out.push(b'}');
            out.push(byte ^ 0x20);
        } else {
            out.push(byte);
        }
    }
    out
}

fn decode_hex(text: &str) -> Result<Vec<u8>, RrError> {
    let bytes = text.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(RrError::Protocol(format!("odd-length hex reply {text:?}")));
    }
    bytes
        .chunks_exact(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(RrError::Protocol(format!("invalid hex reply {text:?}"))),
        })
        .collect()
}

fn hex_digit(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).and_then(|d| u8::try_from(d).ok())
}

/// Extracts the process id from `thread:pPID.TID` in a stop reply.
pub fn stop_reply_pid(reply: &str) -> Option<u32> {
    let thread = reply
        .split(';')
        .find_map(|part| part.split_once("thread:").map(|(_, id)| id))?;
    let pid = thread.strip_prefix('p')?.split('.').next()?;
    u32::from_str_radix(pid, 16).ok()
}

pub struct GdbRemoteSession {
    conn: RemoteConnection,
    features: Vec<String>,
    stop_reply: String,
    pid: Option<u32>,
    executable: PathBuf,
    debug_info_dirs: Vec<PathBuf>,
    use_x_command: bool,
    detached: bool,
}

impl GdbRemoteSession {
    pub fn handshake(
        mut conn: RemoteConnection,
        request: &DialRequest<'_>,
        timeout: Duration,
    ) -> Result<Self, RrError> {
        conn.set_read_timeout(Some(timeout))?;

        let features = conn
            .request(SUPPORTED_FEATURES)?
            .split(';')
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if features.iter().any(|f| f == "QStartNoAckMode+") {
            let reply = conn.request("QStartNoAckMode")?;
            conn.no_ack = reply == "OK";
        }
        let stop_reply = conn.request("?")?;
        conn.set_read_timeout(None)?;

        let pid = request.pid.or_else(|| stop_reply_pid(&stop_reply));
        Ok(Self {
            conn,
            features,
            stop_reply,
            pid,
            executable: request.executable.to_path_buf(),
            debug_info_dirs: request.debug_info_dirs.to_vec(),
            use_x_command: request.use_x_command,
            detached: false,
        })
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn stop_reply(&self) -> &str {
        &self.stop_reply
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn debug_info_dirs(&self) -> &[PathBuf] {
        &self.debug_info_dirs
    }

    pub fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, RrError> {
        let reply = self.conn.request(&format!("m{addr:x},{len:x}"))?;
        decode_hex(&reply)
    }

    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), RrError> {
        let reply = if self.use_x_command {
            let mut packet = format!("X{addr:x},{:x}:", data.len()).into_bytes();
            packet.extend(escape_binary(data));
            self.conn.send_packet(&packet)?;
            String::from_utf8_lossy(&self.conn.recv_packet()?).into_owned()
        } else {
            let hex = data.iter().map(|b| format!("{b:02x}")).collect::<String>();
            self.conn
                .request(&format!("M{addr:x},{:x}:{hex}", data.len()))?
        };
        if reply != "OK" {
            return Err(RrError::Protocol(format!(
                "memory write at {addr:#x} failed: {reply}"
            )));
        }
        Ok(())
    }
}

impl TargetSession for GdbRemoteSession {
    fn detach(&mut self, kill: bool) -> Result<(), RrError> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;
        let result = if kill {
            // Stubs exit on `k` without replying.
            self.conn.send_packet(b"k")
        } else {
            self.conn.request("D").map(|_| ())
        };
        self.conn.shutdown();
        result
    }
}

impl Drop for GdbRemoteSession {
    fn drop(&mut self) {
        self.conn.shutdown();
    }
}

pub struct GdbRemoteConnector {
    pub connect_timeout: Duration,
}

impl GdbRemoteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for GdbRemoteConnector {
    type Session = GdbRemoteSession;

    fn dial(
        &self,
        process: &ReplayProcess,
        request: &DialRequest<'_>,
    ) -> Result<GdbRemoteSession, RrError> {
        append_run_log(
            "info",
            "gdbremote.dial.started",
            json!({
                "port": request.port,
                "executable": request.executable.display().to_string(),
                "stub_pid": process.pid(),
            }),
        );
        let conn = RemoteConnection::connect(request.port, self.connect_timeout)?;
        let session = GdbRemoteSession::handshake(conn, request, self.connect_timeout)?;
        append_run_log(
            "info",
            "gdbremote.dial.connected",
            json!({
                "port": request.port,
                "pid": session.pid(),
                "stop_reply": session.stop_reply(),
            }),
        );
        Ok(session)
    }
}
