//! The Buffered Object (spec §3 / §4.A): the central entity the
//! multiplexor loop pushes bytes through.
//!
//! Grounded on the descriptor/state split in `shared_buf.rs` (a buffer
//! paired with auxiliary per-kind state and bitflag status) but reworked
//! around spec §9's "arena of objects keyed by a stable identifier" --
//! peer lists here are `ObjectId`s into the loop's `Slab`, never `Rc`s or
//! raw references, so a destroyed object can be detached from every peer
//! list before its slot is freed (invariant §3.5) without chasing
//! ownership cycles.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Instant;

use bitflags::bitflags;

use buffer::RingBuffer;
use tpoll::TimerId;

/// A stable handle into the multiplexor's object arena. Peer lists store
/// these, not `RawFd`s, because a telnet object's fd comes and goes across
/// reconnects while its identity (and peer subscriptions) must not.
pub type ObjectId = usize;

bitflags! {
    #[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        /// Peer closed the read side; the output buffer must still drain
        /// before the object is torn down.
        const GOT_EOF = 0b0000_0001;
        /// A reset subshell has been requested and not yet spawned.
        const GOT_RESET = 0b0000_0010;
        /// Client-only: user asked to stop receiving console output.
        const GOT_SUSPEND = 0b0000_0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetState {
    Down,
    Pending,
    Up,
}

pub struct SerialAux {
    pub device_path: PathBuf,
    /// Saved termios to restore when the object is closed, captured at
    /// open time by the opener (spec §4.C).
    pub saved_termios: Option<nix::sys::termios::Termios>,
}

pub struct TelnetAux {
    pub host: String,
    pub port: u16,
    pub state: TelnetState,
    pub reconnect_timer: Option<TimerId>,
    /// Index into the backoff schedule; reset to 0 on every UP transition
    /// (spec §4.C, testable property 3).
    pub backoff_step: u32,
    pub parser: libtelnet_rs::Parser,
}

pub struct LogfileAux {
    /// The console this logfile is attached to, for rotation bookkeeping.
    pub console: ObjectId,
    pub path: PathBuf,
    pub truncate_once: bool,
}

pub struct ProcessAux {
    pub pid: nix::unistd::Pid,
    pub expected_dead_by: Instant,
    pub watchdog_timer: Option<TimerId>,
}

pub struct ListenerAux {
    pub port: u16,
    pub loopback_only: bool,
}

pub struct ClientAux {
    pub remote_identity: String,
    /// Consoles this client currently has attached as reader and/or
    /// writer peer (spec 10.F); used to render status and to detach on
    /// disconnect.
    pub consoles: Vec<ObjectId>,
}

pub enum Aux {
    Listener(ListenerAux),
    Client(ClientAux),
    Serial(SerialAux),
    Telnet(TelnetAux),
    Logfile(LogfileAux),
    Process(ProcessAux),
}

pub struct Object {
    pub id: ObjectId,
    pub name: String,
    pub fd: RawFd,
    pub input: RingBuffer,
    pub output: RingBuffer,
    pub flags: ObjectFlags,
    pub reader_peers: Vec<ObjectId>,
    pub writer_peers: Vec<ObjectId>,
    pub aux: Aux,
}

impl Object {
    pub fn new(id: ObjectId, name: impl Into<String>, fd: RawFd, buf_capacity: usize, aux: Aux) -> Self {
        Self {
            id,
            name: name.into(),
            fd,
            input: RingBuffer::new(buf_capacity),
            output: RingBuffer::new(buf_capacity),
            flags: ObjectFlags::empty(),
            reader_peers: Vec::new(),
            writer_peers: Vec::new(),
            aux,
        }
    }

    /// Invariant §3.1: fd >= 0 iff the object belongs in the interest set.
    pub fn is_polled(&self) -> bool {
        self.fd >= 0
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.aux {
            Aux::Listener(_) => "listener",
            Aux::Client(_) => "client",
            Aux::Serial(_) => "serial",
            Aux::Telnet(_) => "telnet",
            Aux::Logfile(_) => "logfile",
            Aux::Process(_) => "process",
        }
    }

    pub fn telnet_state(&self) -> Option<TelnetState> {
        match &self.aux {
            Aux::Telnet(t) => Some(t.state),
            _ => None,
        }
    }

    pub fn is_suspended_client(&self) -> bool {
        matches!(self.aux, Aux::Client(_)) && self.flags.contains(ObjectFlags::GOT_SUSPEND)
    }

    /// Remove `victim` from this object's peer lists. Called by the loop
    /// on every surviving object before `victim`'s slot is freed
    /// (invariant §3.5).
    pub fn detach_peer(&mut self, victim: ObjectId) {
        self.reader_peers.retain(|&id| id != victim);
        self.writer_peers.retain(|&id| id != victim);
        if let Aux::Client(c) = &mut self.aux {
            c.consoles.retain(|&id| id != victim);
        }
        if let Aux::Logfile(l) = &mut self.aux {
            if l.console == victim {
                // dangling console reference; rotation bookkeeping simply
                // becomes a no-op, the logfile object itself is usually
                // torn down in the same pass.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(id: ObjectId) -> Object {
        Object::new(
            id,
            "listener",
            3,
            4096,
            Aux::Listener(ListenerAux { port: 7000, loopback_only: false }),
        )
    }

    #[test]
    fn fd_geq_zero_means_polled() {
        let mut o = listener(0);
        assert!(o.is_polled());
        o.fd = -1;
        assert!(!o.is_polled());
    }

    #[test]
    fn detach_peer_removes_from_all_lists() {
        let mut o = listener(0);
        o.reader_peers = vec![1, 2, 3];
        o.writer_peers = vec![2, 3];
        o.detach_peer(2);
        assert_eq!(o.reader_peers, vec![1, 3]);
        assert_eq!(o.writer_peers, vec![3]);
    }
}
