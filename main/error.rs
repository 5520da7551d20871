//! Typed errors for the core modules. The binary entry point
//! (`main.rs`) wraps these in `anyhow::Result` with `.context(...)`,
//! matching the split in the teacher between library-style internal
//! errors and `core/main.rs`'s `anyhow`-wrapped `run_shadow`.

use std::io;

use nix::errno::Errno;

/// The verdict the read/write engine hands back to the multiplexor loop
/// (spec §4.D / §7): the loop is the only site allowed to mutate the
/// master object list (spec §3 invariant 5), so the engine never removes
/// an object itself -- it only reports what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing noteworthy; keep the object registered as before.
    Ok,
    /// The object is unrecoverable: tear it down and drop it from the
    /// master list.
    Dispose,
    /// A telnet object whose connection failed or was closed: keep the
    /// object, but move it to `Down` and arm a reconnect timer.
    Reconnect,
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("tpoll error: {0}")]
    Tpoll(#[from] tpoll::TpollError),

    #[error("i/o error on object '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("errno {0}")]
    Errno(#[from] Errno),

    #[error("failed to open device for console '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("could not bind listener on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance already holds the lock on log file {path}")]
    LogLocked { path: String },
}

pub type MuxResult<T> = Result<T, MuxError>;
