//! Object Openers / Connectors (spec §4.C).
//!
//! Grounded on `nix`'s termios and socket APIs used elsewhere in the
//! teacher's tree (`nix::sys::termios`, `nix::sys::socket`) and on the
//! non-blocking connect pattern common across this corpus's daemons:
//! kick off `connect`, let the loop discover success/failure via
//! writability rather than blocking the single loop thread.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::sys::termios::{self, BaudRate, SetArg};
use regex::Regex;

use crate::error::{MuxError, MuxResult};

/// Bounded exponential reconnect backoff (spec §4.C): 1, 2, 4, 8, ..., capped
/// at 60s, reset to the floor on every successful `UP` transition.
pub const BACKOFF_SCHEDULE_SECS: &[u64] = &[1, 2, 4, 8, 16, 32, 60];

pub fn backoff_delay(step: u32) -> std::time::Duration {
    let idx = (step as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    std::time::Duration::from_secs(BACKOFF_SCHEDULE_SECS[idx])
}

fn set_nonblocking_cloexec(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    let fdflags = nix::fcntl::FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(fdflags | nix::fcntl::FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn baud_rate(n: u32) -> MuxResult<BaudRate> {
    match n {
        1200 => Ok(BaudRate::B1200),
        2400 => Ok(BaudRate::B2400),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(MuxError::Config(format!("unsupported baud rate {other}"))),
    }
}

/// Open a serial device: apply line settings, set non-blocking and
/// close-on-exec, and hand back the saved termios for restore on close
/// (spec §4.C, §3 "saved termios for restore on close").
pub fn open_serial(
    device: &Path,
    baud: u32,
) -> MuxResult<(RawFd, termios::Termios)> {
    let fd = nix::fcntl::open(
        device,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(|e| MuxError::Open {
        name: device.display().to_string(),
        source: std::io::Error::from(e),
    })?;

    let original = termios::tcgetattr(fd).map_err(|e| MuxError::Open {
        name: device.display().to_string(),
        source: std::io::Error::from(e),
    })?;

    let mut settings = original.clone();
    termios::cfsetspeed(&mut settings, baud_rate(baud).unwrap_or(BaudRate::B9600))
        .map_err(MuxError::Errno)?;
    termios::cfmakeraw(&mut settings);
    termios::tcsetattr(fd, SetArg::TCSANOW, &settings).map_err(MuxError::Errno)?;

    set_nonblocking_cloexec(fd).map_err(MuxError::Errno)?;

    Ok((fd, original))
}

pub fn restore_serial(fd: RawFd, saved: &termios::Termios) {
    let _ = termios::tcsetattr(fd, SetArg::TCSANOW, saved);
}

/// Kick off a non-blocking telnet connect. The object is registered
/// `PENDING`; the loop discovers success/failure once the fd reports
/// both readable and writable (spec §4.C).
pub fn connect_telnet(host: &str, port: u16) -> MuxResult<RawFd> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(MuxError::Errno)?;

    let ip: std::net::Ipv4Addr = resolve_ipv4(host)?;
    let addr = socket::SockaddrIn::from(std::net::SocketAddrV4::new(ip, port));

    match socket::connect(fd, &addr) {
        Ok(()) | Err(nix::errno::Errno::EINPROGRESS) => Ok(fd),
        Err(e) => {
            let _ = nix::unistd::close(fd);
            Err(MuxError::Open {
                name: format!("{host}:{port}"),
                source: std::io::Error::from(e),
            })
        }
    }
}

fn resolve_ipv4(host: &str) -> MuxResult<std::net::Ipv4Addr> {
    use std::net::ToSocketAddrs;
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }
    (host, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| {
            addrs.find_map(|a| match a.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
        })
        .ok_or_else(|| MuxError::Config(format!("could not resolve host '{host}'")))
}

/// Check whether a `PENDING` connect finished, and whether it succeeded
/// (spec §4.C: "inspect the socket error").
pub fn poll_connect_result(fd: RawFd) -> MuxResult<bool> {
    let errno: i32 = socket::getsockopt(fd, socket::sockopt::SocketError).map_err(MuxError::Errno)?;
    if errno == 0 {
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Expand a logfile name template: `%N` -> console name, `%D` -> today's
/// date (`YYYYMMDD`). Templates are expanded once, before open (spec
/// §4.C).
pub fn expand_template(template: &str, console_name: &str) -> String {
    let date = chrono::Local::now().format("%Y%m%d").to_string();
    let name_re = Regex::new("%N").unwrap();
    let date_re = Regex::new("%D").unwrap();
    let expanded = name_re.replace_all(template, console_name);
    date_re.replace_all(&expanded, date.as_str()).into_owned()
}

/// Open a per-console logfile: append mode, optional one-time truncate,
/// an advisory write lock (fatal if another instance holds it), and
/// close-on-exec (spec §4.C).
pub fn open_logfile(path: &Path, truncate_once: bool) -> MuxResult<RawFd> {
    let mut oflags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND;
    if truncate_once {
        oflags |= OFlag::O_TRUNC;
    }
    let fd = nix::fcntl::open(
        path,
        oflags,
        nix::sys::stat::Mode::from_bits_truncate(0o644),
    )
    .map_err(|e| MuxError::Open {
        name: path.display().to_string(),
        source: std::io::Error::from(e),
    })?;

    if let Err(e) = nix::fcntl::flock(fd, nix::fcntl::FlockArg::LockExclusiveNonblock) {
        let _ = nix::unistd::close(fd);
        return Err(MuxError::LogLocked {
            path: format!("{} ({e})", path.display()),
        });
    }

    let fdflags = nix::fcntl::FdFlag::from_bits_truncate(
        fcntl(fd, FcntlArg::F_GETFD).map_err(MuxError::Errno)?,
    );
    fcntl(fd, FcntlArg::F_SETFD(fdflags | nix::fcntl::FdFlag::FD_CLOEXEC)).map_err(MuxError::Errno)?;

    Ok(fd)
}

/// Reopen a logfile at the same path in append mode, without truncating
/// (the SIGHUP path, spec §4.E step 1 / §4.F "Log rotation").
pub fn reopen_logfile(path: &Path) -> MuxResult<RawFd> {
    open_logfile(path, false)
}

pub fn logfile_path(template: &str, console_name: &str) -> PathBuf {
    PathBuf::from(expand_template(template, console_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expands_name_and_date() {
        let expanded = expand_template("%N-%D.log", "rtr1");
        assert!(expanded.starts_with("rtr1-"));
        assert!(expanded.ends_with(".log"));
    }

    #[test]
    fn backoff_caps_and_never_overflows_schedule() {
        assert_eq!(backoff_delay(0).as_secs(), 1);
        assert_eq!(backoff_delay(100).as_secs(), 60);
    }
}
