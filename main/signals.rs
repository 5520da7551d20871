//! Signal / Control Plane (spec §4.F "Log rotation", §5, §9).
//!
//! Grounded on the spawned `signal_hook::iterator::Signals` thread in
//! `core/main.rs`, reworked per spec §9's explicit design note: "Replace
//! with a self-pipe or signal-fd pattern feeding the same tpoll wait, so
//! handlers need only atomic writes." `signal_hook::low_level::pipe`
//! registers a self-pipe writer directly inside the async-signal-safe
//! handler -- no spawned thread, no `Signals` iterator -- and the write
//! end is registered with `tpoll` alongside every other fd, so a signal
//! wakes the same `wait()` a readable console fd would.
//!
//! `done` and `reconfig` stay plain atomics per spec §5 ("mutual
//! exclusion comes from single-threading"); the pipe's only job is to
//! interrupt a blocked `wait()` promptly instead of waiting out the
//! 1-second cap.

use std::fs::File;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::Signal;
use nix::unistd::{close, read};

pub static DONE: AtomicBool = AtomicBool::new(false);
pub static RECONFIG: AtomicBool = AtomicBool::new(false);

/// Owns the self-pipe's read end; registered readable with `tpoll` by the
/// loop. Dropping it closes the read end (the write end is owned by the
/// registered signal actions and lives for the process's remaining
/// lifetime, matching `signal_hook`'s own pipe-registration contract).
pub struct SignalPipe {
    pub read_fd: RawFd,
}

impl SignalPipe {
    /// Install handlers for SIGINT/SIGTERM (orderly exit), SIGHUP
    /// (reconfig), and ignore SIGPIPE (spec §6 CLI surface), all funneled
    /// through one self-pipe so a signal wakes the same `tpoll::wait` a
    /// readable console fd would. SIGCHLD is reaped by polling
    /// `waitpid(WNOHANG)` once per tick (spec §4.F) rather than by a
    /// dedicated handler, since the reap can wait for the next tick
    /// boundary with no correctness cost.
    pub fn install() -> nix::Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe()?;
        let read_fd = read_fd.into_raw_fd();
        let write_fd = write_fd.into_raw_fd();
        nix::fcntl::fcntl(
            read_fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        // `signal_hook::low_level::pipe::register` writes one byte to the
        // given `Write` end whenever the signal fires; it is the
        // self-pipe trick packaged as an async-signal-safe primitive.
        let write_file = unsafe { File::from_raw_fd(write_fd) };
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGINT, write_file.try_clone().unwrap())
            .map_err(|_| nix::errno::Errno::EINVAL)?;
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGTERM, write_file.try_clone().unwrap())
            .map_err(|_| nix::errno::Errno::EINVAL)?;
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGHUP, write_file)
            .map_err(|_| nix::errno::Errno::EINVAL)?;

        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
                DONE.store(true, Ordering::SeqCst);
            })
            .map_err(|_| nix::errno::Errno::EINVAL)?;
            signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
                DONE.store(true, Ordering::SeqCst);
            })
            .map_err(|_| nix::errno::Errno::EINVAL)?;
            signal_hook::low_level::register(signal_hook::consts::SIGHUP, || {
                RECONFIG.store(true, Ordering::SeqCst);
            })
            .map_err(|_| nix::errno::Errno::EINVAL)?;
        }
        nix::sys::signal::signal(Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn)?;

        Ok(Self { read_fd })
    }

    /// Drain whatever bytes woke the pipe. Called once per tick after
    /// `tpoll::wait` reports the pipe readable; the content is
    /// irrelevant, only the wakeup matters.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
            }
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let _ = close(self.read_fd);
    }
}

pub fn is_done() -> bool {
    DONE.load(Ordering::SeqCst)
}

pub fn take_reconfig() -> bool {
    RECONFIG.swap(false, Ordering::SeqCst)
}

/// Non-blocking reap of every exited child (spec §4.F "Reaped children's
/// exit status is collected by the SIGCHLD handler via non-blocking
/// wait-any"). Called once per tick; safe to call even with no children.
pub fn reap_children() -> Vec<(nix::unistd::Pid, nix::sys::wait::WaitStatus)> {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    let mut reaped = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(status) => reaped.push((status.pid().unwrap_or_else(|| nix::unistd::Pid::from_raw(0)), status)),
            Err(_) => break,
        }
    }
    reaped
}
