//! Auxiliary Actions (spec §4.F): the timestamp scheduler and
//! reset-subprocess supervision. Log rotation itself lives in
//! `mux.rs` step 1 (the SIGHUP path) and `opener::reopen_logfile`; this
//! module only arms/re-arms the `tpoll` timers those actions hang off of.
//!
//! Grounded on the fork/exec + double-`setpgid` pattern spec §9 calls out
//! as non-negotiable ("not a candidate for any high-level subprocess
//! abstraction that buffers output"), implemented directly with
//! `nix::unistd::{fork, execvp}` the way this corpus's lower-level daemon
//! code forks helper processes rather than reaching for `std::process`
//! (which cannot close std{in,out,err} before exec without extra
//! plumbing, and buffers in ways that defeat the watchdog's process-group
//! kill).

use std::ffi::CString;
use std::time::{Duration, Instant};

use chrono::Timelike;
use log::{error, warn};
use logger::notice;
use nix::sys::signal::{self, Signal};
use nix::unistd::{ForkResult, Pid};

use crate::object::{Aux, Object, ObjectFlags, ObjectId, ProcessAux};

/// How long a reset subprocess and its descendants get before the
/// watchdog SIGKILLs the whole process group (spec §4.F, §8 scenario 6).
pub const RESET_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Compute the first timestamp deadline: the next wall-clock instant
/// that is a multiple of `minutes` past local midnight (spec §4.F).
pub fn first_timestamp_deadline(minutes: u32) -> Instant {
    if minutes == 0 {
        return Instant::now() + Duration::from_secs(u64::MAX / 2);
    }
    let now = chrono::Local::now();
    let minutes_since_midnight = now.hour() * 60 + now.minute();
    let period = minutes as i64;
    let next_multiple = ((minutes_since_midnight as i64 / period) + 1) * period;
    let minutes_until = next_multiple - minutes_since_midnight as i64;
    let seconds_until = minutes_until * 60 - now.second() as i64;
    Instant::now() + Duration::from_secs(seconds_until.max(1) as u64)
}

/// Render the timestamp line enqueued into every logfile's output buffer
/// on each tick of the scheduler (spec §4.F).
pub fn timestamp_line(console_name: &str) -> String {
    let now = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
    format!("-- Console [{console_name}] log at {now} --\r\n")
}

/// Expand `cmd_template` (currently just passed through verbatim; the
/// spec reserves template expansion for the logfile path, not the reset
/// command) and spawn it as `/bin/sh -c <cmd>`.
///
/// The child: becomes its own process group leader, closes
/// std{in,out,err}, execs. The parent also calls `setpgid` on the child
/// (the "double setpgid" spec §9 calls for) to close the race where the
/// watchdog fires before the child has made itself a group leader.
pub fn spawn_reset(cmd: &str) -> MuxAuxResult<Pid> {
    match unsafe { nix::unistd::fork() }.map_err(std::io::Error::from)? {
        ForkResult::Parent { child } => {
            let _ = nix::unistd::setpgid(child, child);
            Ok(child)
        }
        ForkResult::Child => {
            let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
            let _ = nix::unistd::close(0);
            let _ = nix::unistd::close(1);
            let _ = nix::unistd::close(2);
            let shell = CString::new("/bin/sh").unwrap();
            let args = [
                shell.clone(),
                CString::new("-c").unwrap(),
                CString::new(cmd).unwrap_or_else(|_| CString::new("true").unwrap()),
            ];
            let _ = nix::unistd::execvp(&shell, &args);
            // execvp only returns on failure; this process has no stdio
            // left to report to, so just die.
            std::process::exit(127);
        }
    }
}

pub type MuxAuxResult<T> = Result<T, std::io::Error>;

/// Watchdog fire: if the process group is still alive, SIGKILL it
/// (negative pid targets the whole group, spec §4.F/§9).
pub fn kill_reset_group(pid: Pid) {
    notice!("reset command (pid {pid}) exceeded its time limit; killing process group");
    let group = Pid::from_raw(-pid.as_raw());
    if let Err(e) = signal::kill(group, Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            warn!("failed to SIGKILL reset process group {pid}: {e}");
        }
    }
}

/// Handle a `gotReset` object: spawn the subshell, clear the flag, and
/// install a `Process` auxiliary object in the arena with a watchdog
/// timer armed (spec §4.E step 3, §4.F). Called from the loop with the
/// console's own reset-command template.
pub fn trigger_reset(
    objects: &mut slab::Slab<Object>,
    console_id: ObjectId,
    cmd: &str,
) -> Option<ObjectId> {
    objects[console_id].flags.remove(ObjectFlags::GOT_RESET);

    let pid = match spawn_reset(cmd) {
        Ok(pid) => pid,
        Err(e) => {
            error!("failed to spawn reset command for console '{}': {e}", objects[console_id].name);
            return None;
        }
    };

    notice!("spawned reset command for console '{}' (pid {pid})", objects[console_id].name);

    let entry = objects.vacant_entry();
    let id = entry.key();
    let name = format!("{}-reset", objects[console_id].name);
    entry.insert(Object::new(
        id,
        name,
        -1,
        1,
        Aux::Process(ProcessAux {
            pid,
            expected_dead_by: Instant::now() + RESET_CMD_TIMEOUT,
            watchdog_timer: None,
        }),
    ));
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_deadline_is_in_the_future() {
        let deadline = first_timestamp_deadline(15);
        assert!(deadline > Instant::now());
    }

    #[test]
    fn disabled_scheduler_has_far_future_deadline() {
        let deadline = first_timestamp_deadline(0);
        assert!(deadline > Instant::now() + Duration::from_secs(3600));
    }
}
