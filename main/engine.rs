//! Read/Write Engine (spec §4.D): moves bytes between a kernel fd and an
//! object's ring buffers, fanning source bytes out to writer peers.
//!
//! Grounded on the non-blocking read/write retry loops this corpus's I/O
//! code uses around `nix::unistd::read`/`write` (EAGAIN -> return
//! silently, EOF -> mark and keep draining, hard error -> dispose), with
//! the fan-out and overrun-drop behavior delegated to `buffer::RingBuffer`
//! and `object::Object`'s peer lists per spec §4.A/§9.

use std::os::unix::io::{BorrowedFd, RawFd};

use log::warn;
use nix::errno::Errno;

use crate::error::Verdict;
use crate::object::{Aux, Object, ObjectId, TelnetState};
use crate::telnet;

const READ_CHUNK: usize = 4096;

/// One non-blocking read into `obj`'s input buffer, then fan the new
/// bytes out to every writer peer's output buffer (spec §4.D).
///
/// `peers` gives mutable access to every other object in the arena so
/// fan-out can write directly into peer output buffers without the
/// caller re-borrowing the whole slab per peer.
pub fn read_from_obj(obj_id: ObjectId, objects: &mut slab::Slab<Object>) -> Verdict {
    let fd = objects[obj_id].fd;
    let mut chunk = [0u8; READ_CHUNK];

    let n = match nix::unistd::read(fd, &mut chunk) {
        Ok(0) => {
            objects[obj_id].flags.insert(crate::object::ObjectFlags::GOT_EOF);
            return Verdict::Ok;
        }
        Ok(n) => n,
        Err(Errno::EAGAIN) => return Verdict::Ok,
        Err(Errno::EINTR) => return Verdict::Ok,
        Err(_e) => return dispose_or_reconnect(obj_id, objects),
    };

    let raw = &chunk[..n];

    // Telnet sources are filtered through the IAC state machine; plain
    // data bytes fan out, negotiation replies loop back onto the source's
    // own output buffer (spec §4.D).
    let filtered;
    let data: &[u8] = match &mut objects[obj_id].aux {
        Aux::Telnet(t) => {
            let (data, replies) = telnet::filter(&mut t.parser, raw);
            if !replies.is_empty() {
                objects[obj_id].output.enqueue(&replies);
            }
            filtered = data;
            &filtered
        }
        _ => raw,
    };

    // A client's own keystrokes may carry escape-character commands
    // (spec 10.F); those bytes govern the client's session and are never
    // forwarded to the attached console.
    let owned_data;
    let data: &[u8] = if matches!(objects[obj_id].aux, Aux::Client(_)) {
        owned_data = crate::client::strip_escape_commands(obj_id, data, objects);
        &owned_data
    } else {
        data
    };

    objects[obj_id].input.enqueue(data);

    let writer_peers = objects[obj_id].writer_peers.clone();
    for peer_id in writer_peers {
        if let Some(peer) = objects.get_mut(peer_id) {
            if peer.output.enqueue(data) {
                if peer.output.take_overrun() {
                    warn!(
                        "buffer overrun on '{}': dropped oldest bytes feeding from '{}'",
                        peer.name, objects[obj_id].name
                    );
                }
            }
        }
    }

    Verdict::Ok
}

fn dispose_or_reconnect(obj_id: ObjectId, objects: &mut slab::Slab<Object>) -> Verdict {
    match &mut objects[obj_id].aux {
        Aux::Telnet(t) => {
            t.state = TelnetState::Down;
            Verdict::Reconnect
        }
        _ => Verdict::Dispose,
    }
}

/// One non-blocking write from `obj`'s output buffer. If the buffer
/// empties and `gotEOF` was set, signal dispose (spec §4.D).
pub fn write_to_obj(obj_id: ObjectId, objects: &mut slab::Slab<Object>) -> Verdict {
    let obj = &mut objects[obj_id];
    if obj.output.is_empty() {
        return Verdict::Ok;
    }

    let view = obj.output.dequeue_view();
    let fd: RawFd = obj.fd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match nix::unistd::write(borrowed, view) {
        Ok(n) => obj.output.advance(n),
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Verdict::Ok,
        Err(_e) => return dispose_or_reconnect(obj_id, objects),
    }

    let obj = &objects[obj_id];
    if obj.output.is_empty() && obj.flags.contains(crate::object::ObjectFlags::GOT_EOF) {
        return Verdict::Dispose;
    }
    Verdict::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Aux, ListenerAux, Object};
    use std::os::unix::io::AsRawFd;

    fn dummy_listener(id: ObjectId, fd: RawFd) -> Object {
        Object::new(id, "x", fd, 64, Aux::Listener(ListenerAux { port: 0, loopback_only: false }))
    }

    #[test]
    fn reads_fan_out_to_writer_peer() {
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::fcntl::fcntl(
            r.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .unwrap();
        nix::unistd::write(&w, b"hi").unwrap();

        let mut objects = slab::Slab::new();
        let src_id = objects.insert(dummy_listener(0, r.as_raw_fd()));
        let sink_id = objects.insert(dummy_listener(1, -1));
        objects[src_id].writer_peers.push(sink_id);

        let verdict = read_from_obj(src_id, &mut objects);
        assert_eq!(verdict, Verdict::Ok);
        assert_eq!(objects[sink_id].output.dequeue_view(), b"hi");
    }

    #[test]
    fn eof_marks_flag_without_disposing() {
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::fcntl::fcntl(
            r.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .unwrap();
        drop(w);

        let mut objects = slab::Slab::new();
        let id = objects.insert(dummy_listener(0, r.as_raw_fd()));
        let verdict = read_from_obj(id, &mut objects);
        assert_eq!(verdict, Verdict::Ok);
        assert!(objects[id].flags.contains(crate::object::ObjectFlags::GOT_EOF));
    }
}
