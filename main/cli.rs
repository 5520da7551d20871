//! Command-line flags (spec §6 "CLI surface (peripheral)"), parsed with
//! `clap`'s derive API the way `core/support/configuration.rs` declares
//! `CliOptions`, but updated to the v4 derive macros rather than the
//! teacher's pinned v2 (`clap::Clap`) since nothing in this crate depends
//! on the older API surface.

use std::path::PathBuf;

use clap::Parser;

use crate::config::ConfigFileOptions;

#[derive(Debug, Clone, Parser)]
#[command(name = "consoled", version, about = "Concentrates device consoles behind a single TCP endpoint.")]
pub struct CliOptions {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// TCP port to listen on, overriding the config file.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Accept connections on the loopback interface only.
    #[arg(short = 'L', long)]
    pub loop_back: bool,

    /// Enable verbose (debug-level) logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Truncate every per-console log file once at startup.
    #[arg(short = 'z', long)]
    pub zero_logs: bool,

    /// Print the fully resolved configuration and exit.
    #[arg(long)]
    pub show_config: bool,
}

impl CliOptions {
    /// Project CLI flags into a `ConfigFileOptions`-shaped overlay so
    /// `ServerConfig::resolve` can merge it over the file using the same
    /// `Merge` strategies used between file-default and explicit values.
    pub fn as_overrides(&self) -> ConfigFileOptions {
        ConfigFileOptions {
            enable_loop_back: self.loop_back,
            enable_verbose: self.verbose,
            enable_zero_logs: self.zero_logs,
            port: self.port,
            ..ConfigFileOptions::default()
        }
    }
}

/// The classic double-fork daemonization dance (spec §6's "peripheral"
/// CLI surface): detach from the controlling terminal, become a session
/// leader, `chdir("/")` so the daemon never pins a mount point, and
/// redirect std{in,out,err} to `/dev/null` since the logger is already
/// writing anywhere that matters by the time this runs.
pub fn daemonize() -> std::io::Result<()> {
    use nix::unistd::{fork, ForkResult};

    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    nix::unistd::setsid().map_err(std::io::Error::from)?;

    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    std::env::set_current_dir("/")?;

    use std::os::unix::io::AsRawFd;
    let dev_null = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [0, 1, 2] {
        nix::unistd::dup2(dev_null.as_raw_fd(), fd).map_err(std::io::Error::from)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_invocation() {
        let cli = CliOptions::parse_from(["consoled"]);
        assert!(cli.config.is_none());
        assert!(!cli.foreground);
    }

    #[test]
    fn parses_port_override() {
        let cli = CliOptions::parse_from(["consoled", "--port", "9000"]);
        assert_eq!(cli.port, Some(9000));
    }
}
