//! Client handshake worker and in-session protocol (spec 10.F, §6 "a
//! client handshake entry point `process_client(sd, conf)`").
//!
//! Grounded on the thread-per-client accept pattern in
//! `other_examples/.../agency/src/pty/daemon.rs` (spawn a worker per
//! accepted connection, hand a result back to the owning loop rather
//! than mutate shared state from the worker) and on spec §5's
//! concurrency model: "Auxiliary threads exist only to perform blocking
//! client handshakes; they never touch another object's buffers." The
//! worker here therefore never reaches into the object arena -- it reads
//! and writes only the freshly accepted fd, then returns a plain-data
//! `HandshakeOutcome` across a channel for the loop thread to apply.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use crossbeam::channel::Sender;

use crate::object::{Aux, ObjectFlags, ObjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    ReadOnly,
    ReadWrite,
    /// `!` prefix: steal the console away from any current read-write
    /// holder instead of falling back to read-only.
    Force,
}

pub struct HandshakeOutcome {
    pub sd: RawFd,
    pub remote_identity: String,
    pub console_name: String,
    pub mode: ConsoleMode,
}

const GREETING: &str = "consoled ready\r\nconsole> ";

/// Runs in a worker thread spawned by the loop right after `accept`.
/// Blocking reads/writes on `sd` only; never touches the object arena.
/// Parses a line of the form `<name>[:ro|:rw][!]` and reports the
/// selection back to the loop over `outcomes`.
pub fn process_client(sd: RawFd, remote_identity: String, outcomes: Sender<HandshakeOutcome>) {
    let mut stream = unsafe { TcpStream::from_raw_fd(sd) };
    let _ = stream.set_nonblocking(false);

    if stream.write_all(GREETING.as_bytes()).is_err() {
        return;
    }

    let mut buf = [0u8; 256];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };

    let line = String::from_utf8_lossy(&buf[..n]);
    let line = line.trim();

    let (name, mode) = match parse_selection(line) {
        Some(parsed) => parsed,
        None => {
            let _ = stream.write_all(b"unrecognized console selection\r\n");
            return;
        }
    };

    // Handed back to the loop, which does all its I/O non-blocking; undo
    // the blocking mode this handshake needed for its own reads/writes.
    if stream.set_nonblocking(true).is_err() {
        return;
    }

    let _ = outcomes.send(HandshakeOutcome {
        sd: stream.as_raw_fd(),
        remote_identity,
        console_name: name,
        mode,
    });

    // The fd now belongs to the loop's client object; this `TcpStream`
    // must not close it on drop.
    std::mem::forget(stream);
}

/// Parse `<name>[:ro|:rw][!]` console-selection syntax (spec 10.F).
fn parse_selection(line: &str) -> Option<(String, ConsoleMode)> {
    if line.is_empty() {
        return None;
    }
    let force = line.ends_with('!');
    let line = line.trim_end_matches('!');

    let (name, mode) = match line.split_once(':') {
        Some((name, "ro")) => (name, ConsoleMode::ReadOnly),
        Some((name, "rw")) => (name, ConsoleMode::ReadWrite),
        Some(_) => return None,
        None => (line, ConsoleMode::ReadOnly),
    };

    if name.is_empty() {
        return None;
    }

    let mode = if force { ConsoleMode::Force } else { mode };
    Some((name.to_string(), mode))
}

/// Ctrl-E (0x05) escape byte introducing an in-session command (spec
/// 10.F): `.` disconnect, `s` suspend output, `r` resume output, `b`
/// send a literal break marker to the console.
const ESCAPE_BYTE: u8 = 0x05;

/// Strip escape-character commands out of a client's keystroke stream
/// before it is forwarded to the attached console, applying their side
/// effects (suspend/resume/disconnect) directly to the arena. Called
/// from the read engine for `Client` sources only.
pub fn strip_escape_commands(client_id: ObjectId, data: &[u8], objects: &mut slab::Slab<crate::object::Object>) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied().peekable();

    while let Some(b) = iter.next() {
        if b != ESCAPE_BYTE {
            out.push(b);
            continue;
        }
        let Some(cmd) = iter.next() else {
            // escape byte with no follow-up yet this tick; drop it, the
            // remote will presumably complete the sequence next tick.
            break;
        };
        match cmd {
            b'.' => {
                objects[client_id].flags.insert(ObjectFlags::GOT_EOF);
            }
            b's' => {
                objects[client_id].flags.insert(ObjectFlags::GOT_SUSPEND);
            }
            b'r' => {
                objects[client_id].flags.remove(ObjectFlags::GOT_SUSPEND);
            }
            b'b' => {
                if let Aux::Client(c) = &objects[client_id].aux {
                    for &console_id in &c.consoles {
                        if let Some(console) = objects.get_mut(console_id) {
                            console.flags.insert(ObjectFlags::GOT_RESET);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_name_as_read_only() {
        assert_eq!(parse_selection("rtr1"), Some(("rtr1".into(), ConsoleMode::ReadOnly)));
    }

    #[test]
    fn parses_rw_suffix() {
        assert_eq!(parse_selection("rtr1:rw"), Some(("rtr1".into(), ConsoleMode::ReadWrite)));
    }

    #[test]
    fn force_bang_overrides_mode() {
        assert_eq!(parse_selection("rtr1:ro!"), Some(("rtr1".into(), ConsoleMode::Force)));
    }

    #[test]
    fn rejects_empty_name() {
        assert_eq!(parse_selection(":rw"), None);
        assert_eq!(parse_selection(""), None);
    }
}
