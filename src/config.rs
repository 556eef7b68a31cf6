//! Typed process configuration (A1), parsed once at startup and then shared
//! by reference through the event loop — never as the process-wide mutable
//! globals the original carries (§9).
//!
//! The flag surface mirrors the original's `getopt_long` table so that
//! scripts invoking this daemon do not need to change. Flags that name
//! functionality explicitly out of scope per §1 (pidfile, chroot, uid/gid
//! drop, state directory, seccomp) are still parsed and stored, but are
//! inert: nothing in this crate reads them back out to act on.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

/// Parsed command-line configuration for one `ndhc` instance.
#[derive(Debug, Clone, Parser)]
#[command(name = "ndhc", about = "A DHCPv4 client for Linux")]
pub struct Config {
    /// Network interface to manage.
    #[arg(short = 'i', long)]
    pub interface: String,

    /// Client identifier (option 61) sent in every request; defaults to the
    /// interface's hardware address type byte followed by its MAC.
    #[arg(short = 'c', long)]
    pub client_id: Option<String>,

    /// Vendor class identifier (option 60).
    #[arg(short = 'V', long, default_value = "ndhc")]
    pub vendor_id: String,

    /// Host name to send in option 12.
    #[arg(short = 'H', long = "dhcp-hostname")]
    pub dhcp_hostname: Option<String>,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'b', long, default_value_t = false)]
    pub background: bool,

    /// Send the first DISCOVER immediately rather than after the usual
    /// startup jitter.
    #[arg(short = 'n', long, default_value_t = false)]
    pub now: bool,

    /// Exit immediately once a lease is bound instead of maintaining it.
    #[arg(short = 'q', long, default_value_t = false)]
    pub quit_after_lease: bool,

    /// Previously-known address to request via INIT_REBOOT (option 50 on
    /// the first REQUEST, skipping DISCOVER/OFFER).
    #[arg(short = 'r', long)]
    pub requested_ip: Option<Ipv4Addr>,

    /// Keep re-asserting a held address against conflicting replies even
    /// within the normal defense cooldown window (§4.5 DEFENSE).
    #[arg(short = 'd', long = "relentless-defense", default_value_t = false)]
    pub relentless_defense: bool,

    /// Lower bound, in milliseconds, of the RFC 5227 probe interval.
    #[arg(short = 'w', long = "probe-wait-min", default_value_t = 1000)]
    pub probe_wait_min_ms: u64,

    /// Upper bound, in milliseconds, of the RFC 5227 probe interval.
    #[arg(short = 'W', long = "probe-wait-max", default_value_t = 2000)]
    pub probe_wait_max_ms: u64,

    /// Route metric to install for the default gateway (accepted for
    /// compatibility with the original's `-t`; this crate formats the
    /// config-applier command but does not install routes itself).
    #[arg(short = 't', long = "gw-metric", default_value_t = 0)]
    pub gw_metric: u32,

    /// Path to a `resolv.conf`-style file the config worker should rewrite.
    /// Accepted for compatibility; forwarded to the applier but not opened
    /// by this crate.
    #[arg(short = 'R', long = "resolv-conf")]
    pub resolv_conf: Option<PathBuf>,

    // ── Accepted for command-line compatibility; inert in this crate ──
    // (lease/DUID/IAID persistence, pidfiles, privilege drop, and seccomp
    // are out of scope per §1).
    /// Pidfile path. Not written by this crate.
    #[arg(short = 'p', long)]
    pub pidfile: Option<PathBuf>,

    /// State directory for lease/DUID/IAID persistence. Not read or
    /// written by this crate.
    #[arg(short = 's', long = "state-dir")]
    pub state_dir: Option<PathBuf>,

    /// Chroot directory to apply after socket setup. Not applied by this
    /// crate.
    #[arg(short = 'C', long)]
    pub chroot: Option<PathBuf>,

    /// User account to drop privileges to. Not applied by this crate.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Install a seccomp-bpf filter before the main loop starts. Not
    /// applied by this crate.
    #[arg(short = 'S', long = "seccomp", default_value_t = false)]
    pub seccomp: bool,

    // ── Descriptors handed to this process by whatever launches it ──
    // (§9: the core receives the raw-socket helper connection and the
    // config-applier pipes as already-open resources rather than forking
    // them itself).
    /// Path to the raw-socket helper's listening Unix-domain socket.
    #[arg(long = "helper-socket", default_value = "/run/ndhc/helper.sock")]
    pub helper_socket: PathBuf,

    /// Inherited file descriptor the config-applier command stream is
    /// written to.
    #[arg(long = "ifchange-cmd-fd", default_value_t = 3)]
    pub ifchange_cmd_fd: i32,

    /// Inherited file descriptor the config-applier ack byte is read from.
    #[arg(long = "ifchange-ack-fd", default_value_t = 4)]
    pub ifchange_ack_fd: i32,
}

impl Config {
    /// Validate cross-field invariants not expressible via `clap` alone.
    pub fn validate(&self) -> Result<(), crate::DhcpError> {
        if self.interface.is_empty() {
            return Err(crate::DhcpError::BadArguments(
                "interface name must not be empty".into(),
            ));
        }
        if self.probe_wait_min_ms > self.probe_wait_max_ms {
            return Err(crate::DhcpError::BadArguments(format!(
                "probe-wait-min ({}) must not exceed probe-wait-max ({})",
                self.probe_wait_min_ms, self.probe_wait_max_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_probe_window() {
        let mut cfg = Config::parse_from(["ndhc", "-i", "eth0"]);
        cfg.probe_wait_min_ms = 3000;
        cfg.probe_wait_max_ms = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_minimal_invocation() {
        let cfg = Config::parse_from(["ndhc", "--interface", "eth0"]);
        assert_eq!(cfg.interface, "eth0");
        assert_eq!(cfg.vendor_id, "ndhc");
        assert!(cfg.validate().is_ok());
    }
}
