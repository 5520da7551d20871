use anyhow::{Context, Result};
use clap::Parser;

use consoled::cli::{self, CliOptions};
use consoled::config::{self, ServerConfig};
use consoled::mux::Multiplexor;

fn main() -> Result<()> {
    let cli_opts = CliOptions::parse_from(std::env::args_os());

    let file_opts = match &cli_opts.config {
        Some(path) => config::load_file(path).context("loading configuration file")?,
        None => config::ConfigFileOptions::default(),
    };

    let server_config = ServerConfig::resolve(file_opts, &cli_opts).context("resolving configuration")?;

    if cli_opts.show_config {
        println!("{server_config:#?}");
        return Ok(());
    }

    let min_severity = if server_config.enable_verbose {
        logger::Severity::Debug
    } else {
        server_config.log_file_level
    };
    let syslog_facility = server_config.syslog_facility.map(|f| f.to_syslog());
    logger::init(min_severity, server_config.log_file_name.as_deref(), syslog_facility)
        .context("initializing logger")?;

    raise_fd_limit(expected_object_count(&server_config))?;

    if !cli_opts.foreground {
        cli::daemonize().context("daemonizing")?;
    }

    log::info!("consoled starting on port {}", server_config.port);

    let mut mux = Multiplexor::build(server_config).context("building multiplexor")?;
    mux.run().context("running multiplexor loop")?;

    log::info!("consoled exited cleanly");
    Ok(())
}

/// Headroom assumed per configured console for simultaneously attached
/// clients, counted toward the fd budget alongside the console and
/// logfile fds themselves (spec §5 "File-descriptor budget").
const EXPECTED_CLIENTS_PER_CONSOLE: usize = 4;

/// Total fds the daemon expects to have open at once: the listener, one
/// fd per console, one more per console with a logfile configured, and
/// headroom for clients attached to each console.
fn expected_object_count(server_config: &ServerConfig) -> usize {
    let consoles = server_config.consoles.len();
    let logfiles = server_config.consoles.iter().filter(|c| c.logfile.is_some()).count();
    1 + consoles + logfiles + consoles * EXPECTED_CLIENTS_PER_CONSOLE
}

/// Raise the open-files soft limit to `max(current_hard, 2 * object_count)`
/// (spec §5 "File-descriptor budget"), logging the adjustment. Failure to
/// raise the limit is logged and not fatal: the budget is advisory, and
/// exceeding it later is reported per event rather than crashing the
/// daemon.
fn raise_fd_limit(object_count: usize) -> Result<()> {
    let (soft, hard) = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
        .context("reading RLIMIT_NOFILE")?;
    let target = (2 * object_count as u64).max(hard);
    if target > soft {
        let new_hard = hard.max(target);
        match nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE, target, new_hard) {
            Ok(()) => log::info!("raised open-files soft limit from {soft} to {target}"),
            Err(e) => log::warn!("could not raise open-files soft limit to {target}: {e}"),
        }
    }
    Ok(())
}
