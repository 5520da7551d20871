//! A log sink with the five severities spec §6 asks for
//! (`debug, info, notice, warning, error`), implemented as a single
//! synchronous `log::Log` impl.
//!
//! Grounded on `main/core/logger/shadow_logger.rs` and
//! `main/core/logger/log_wrapper.rs`, which bridge the `log` crate to a
//! foreign severity scheme the same way this module does -- but
//! simplified down to direct, synchronous writes. The teacher's
//! `ShadowLogger` buffers records and flushes them from a dedicated
//! background thread because a simulator can produce millions of lines a
//! second from many simulated hosts; this daemon has no such volume (one
//! line per console event) and its core loop already promises "no lock
//! anywhere in the core" (spec §5), so a background flush thread would
//! only add a second place records could be reordered relative to the
//! events that produced them. The `Mutex`-guarded file handle below is
//! only ever touched by the loop thread and, occasionally, a client
//! handshake worker logging a connect/disconnect -- not a violation of
//! that rule, since it is peripheral plumbing rather than multiplexor
//! state.
//!
//! `log::Level` has no `Notice` variant, so it is carried the same way
//! `log_wrapper.rs` carries its foreign levels through the `log` crate's
//! API: as `Level::Warn` records tagged with a sentinel target, unwrapped
//! by [`severity_of`].

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{Level, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::OnceCell;

/// The `log` target used to carry a `Notice`-severity record through the
/// `log` crate's `Level`-only API. Prefer the [`notice!`] macro over
/// constructing this by hand.
pub const NOTICE_TARGET: &str = "notice";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }

    fn to_syslog(self) -> syslog::Severity {
        match self {
            Severity::Debug => syslog::Severity::LOG_DEBUG,
            Severity::Info => syslog::Severity::LOG_INFO,
            Severity::Notice => syslog::Severity::LOG_NOTICE,
            Severity::Warning => syslog::Severity::LOG_WARNING,
            Severity::Error => syslog::Severity::LOG_ERR,
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "notice" => Ok(Severity::Notice),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" | "err" => Ok(Severity::Error),
            other => Err(format!("unrecognized log level '{other}'")),
        }
    }
}

fn severity_of(record: &Record) -> Severity {
    match record.level() {
        Level::Error => Severity::Error,
        Level::Warn if record.target() == NOTICE_TARGET => Severity::Notice,
        Level::Warn => Severity::Warning,
        Level::Info => Severity::Info,
        Level::Debug | Level::Trace => Severity::Debug,
    }
}

/// Emit a `Notice`-severity record. Use for events spec §7 classifies as
/// "per-object fatal" or administrative (object destroyed, reset command
/// timed out) -- one step louder than `info!`, one step quieter than
/// `warn!`.
#[macro_export]
macro_rules! notice {
    (target: $target:expr, $($arg:tt)+) => {
        log::log!(target: $target, log::Level::Warn, $($arg)+)
    };
    ($($arg:tt)+) => {
        log::log!(target: $crate::NOTICE_TARGET, log::Level::Warn, $($arg)+)
    };
}

pub struct ConsoleLogger {
    min_severity: Severity,
    daemon_log: Mutex<Option<(PathBuf, File)>>,
    syslog: Mutex<Option<syslog::Logger<syslog::LoggerBackend, String>>>,
}

static LOGGER: OnceCell<ConsoleLogger> = OnceCell::new();

/// Initialize the process-wide logger. Must be called exactly once, before
/// daemonizing (so startup errors are still visible on the launching
/// shell's stderr -- spec §7).
pub fn init(
    min_severity: Severity,
    daemon_log_path: Option<&Path>,
    syslog_facility: Option<syslog::Facility>,
) -> Result<(), SetLoggerError> {
    let daemon_log = daemon_log_path.map(|p| open_append(p).expect("open daemon log"));

    let syslog_writer = syslog_facility.map(|facility| {
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process: "consoled".into(),
            pid: std::process::id() as i32,
        };
        syslog::unix(formatter).expect("connect to syslog")
    });

    let logger = ConsoleLogger {
        min_severity,
        daemon_log: Mutex::new(daemon_log.map(|(path, f)| (path, f))),
        syslog: Mutex::new(syslog_writer),
    };

    LOGGER.set(logger).ok().expect("logger already initialized");
    log::set_logger(LOGGER.get().unwrap())?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

fn open_append(path: &Path) -> std::io::Result<(PathBuf, File)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok((path.to_path_buf(), file))
}

/// The SIGHUP path (spec §4.F): reopen the daemon log file in append mode
/// without truncating, at the *same path* it was originally configured
/// with -- so a `mv` + recreate (log rotation by an external tool) picks
/// up the new inode on the next write.
pub fn reopen_daemon_log() -> std::io::Result<()> {
    let Some(logger) = LOGGER.get() else {
        return Ok(());
    };
    let mut guard = logger.daemon_log.lock().unwrap();
    if let Some((path, _)) = guard.as_ref() {
        let path = path.clone();
        let (path, file) = open_append(&path)?;
        *guard = Some((path, file));
    }
    Ok(())
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // `Notice` piggybacks on `Level::Warn`; defer to `log` below.
        metadata.level() != Level::Trace || self.min_severity == Severity::Debug
    }

    fn log(&self, record: &Record) {
        let severity = severity_of(record);
        if severity < self.min_severity {
            return;
        }

        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!(
            "{now} [{}] {}: {}\n",
            severity.label(),
            record.target(),
            record.args()
        );

        if severity >= Severity::Warning {
            eprint!("{line}");
        } else {
            print!("{line}");
        }

        if let Ok(mut guard) = self.daemon_log.lock() {
            if let Some((_, file)) = guard.as_mut() {
                let _ = file.write_all(line.as_bytes());
            }
        }

        if let Ok(mut guard) = self.syslog.lock() {
            if let Some(writer) = guard.as_mut() {
                let _ = match severity.to_syslog() {
                    syslog::Severity::LOG_EMERG => writer.emerg(record.args().to_string()),
                    syslog::Severity::LOG_ALERT => writer.alert(record.args().to_string()),
                    syslog::Severity::LOG_CRIT => writer.crit(record.args().to_string()),
                    syslog::Severity::LOG_ERR => writer.err(record.args().to_string()),
                    syslog::Severity::LOG_WARNING => writer.warning(record.args().to_string()),
                    syslog::Severity::LOG_NOTICE => writer.notice(record.args().to_string()),
                    syslog::Severity::LOG_INFO => writer.info(record.args().to_string()),
                    syslog::Severity::LOG_DEBUG => writer.debug(record.args().to_string()),
                };
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.daemon_log.lock() {
            if let Some((_, file)) = guard.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Debug < Severity::Notice);
        assert!(Severity::Notice < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }

    #[test]
    fn parses_notice_level() {
        assert_eq!("notice".parse::<Severity>().unwrap(), Severity::Notice);
        assert!("bogus".parse::<Severity>().is_err());
    }
}
