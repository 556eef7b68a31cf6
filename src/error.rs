//! Error taxonomy, per §7.
//!
//! Every fallible operation in this crate returns [`DhcpError`]. The
//! variants are grouped into the three classes the design calls for:
//! Transient (retried by the caller, never reaches `main`), Session-fatal
//! (collapses the running state machine back to `INIT`, never reaches
//! `main`), and Process-fatal (bubbles up and terminates the process with a
//! specific nonzero exit code).

use std::process::ExitCode;

/// The handling class an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried locally: `EAGAIN`/`EINTR`, a malformed packet, an ARP
    /// timeout.
    Transient,
    /// Collapses the active state machine back to `INIT`: NAK, a detected
    /// collision, T2 expiry without a successful rebind, GW_CHECK
    /// exhaustion.
    SessionFatal,
    /// Terminates the process: the interface vanished, a helper process
    /// died, `epoll` failed unrecoverably, the adapter has no MAC, the
    /// state directory is missing.
    ProcessFatal,
}

/// All errors produced by this crate.
#[derive(thiserror::Error, Debug)]
pub enum DhcpError {
    // ── Transient ─────────────────────────────────────────────────────
    #[error("socket operation would block")]
    WouldBlock,

    #[error("interrupted system call")]
    Interrupted,

    #[error("malformed packet dropped: {reason}")]
    MalformedPacket { reason: String },

    #[error("ARP exchange timed out")]
    ArpTimeout,

    // ── Session-fatal ────────────────────────────────────────────────
    #[error("server sent DHCPNAK")]
    Nak,

    #[error("address collision detected for {addr}")]
    AddressCollision { addr: std::net::Ipv4Addr },

    #[error("lease expired before rebind completed")]
    RebindFailed,

    #[error("gateway check exhausted all probes")]
    GatewayUnreachable,

    // ── Process-fatal ────────────────────────────────────────────────
    #[error("interface {iface} was removed from the kernel")]
    InterfaceRemoved { iface: String },

    #[error("raw-socket helper process exited unexpectedly")]
    HelperDied,

    #[error("epoll operation failed: {0}")]
    EpollFailed(#[source] std::io::Error),

    #[error("interface {iface} has no hardware (MAC) address")]
    MissingMacAddress { iface: String },

    #[error("state directory {path} does not exist")]
    StateDirMissing { path: String },

    #[error("invalid command-line arguments: {0}")]
    BadArguments(String),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("config-applier channel error: {0}")]
    IfchangeChannel(String),

    #[error("config-applier batch already in flight")]
    IfchangeBusy,
}

impl DhcpError {
    /// Which of the three handling classes this error belongs to.
    pub fn class(&self) -> ErrorClass {
        use DhcpError::*;
        match self {
            WouldBlock | Interrupted | MalformedPacket { .. } | ArpTimeout => {
                ErrorClass::Transient
            }
            Nak | AddressCollision { .. } | RebindFailed | GatewayUnreachable => {
                ErrorClass::SessionFatal
            }
            InterfaceRemoved { .. }
            | HelperDied
            | EpollFailed(_)
            | MissingMacAddress { .. }
            | StateDirMissing { .. }
            | BadArguments(_)
            | Io(_)
            | Netlink(_)
            | IfchangeChannel(_)
            | IfchangeBusy => ErrorClass::ProcessFatal,
        }
    }

    /// Process exit code for a Process-fatal error. Panics (in debug
    /// builds, via the unreachable catch-all) if called on a
    /// Transient/Session-fatal variant — those must be handled and never
    /// reach `main`.
    pub fn exit_code(&self) -> ExitCode {
        use DhcpError::*;
        match self {
            BadArguments(_) => ExitCode::from(64), // EX_USAGE
            StateDirMissing { .. } => ExitCode::from(66), // EX_NOINPUT
            MissingMacAddress { .. } => ExitCode::from(69), // EX_UNAVAILABLE
            InterfaceRemoved { .. } => ExitCode::SUCCESS, // §4.7: terminal but not an error
            HelperDied | EpollFailed(_) | Io(_) | Netlink(_) | IfchangeChannel(_)
            | IfchangeBusy => ExitCode::from(70), // EX_SOFTWARE
            other => unreachable!("{other} is not a process-fatal error"),
        }
    }
}

impl From<nix::Error> for DhcpError {
    fn from(e: nix::Error) -> Self {
        match e {
            nix::Error::EAGAIN => DhcpError::WouldBlock,
            nix::Error::EINTR => DhcpError::Interrupted,
            other => DhcpError::Io(std::io::Error::from(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_removed_exits_cleanly() {
        let err = DhcpError::InterfaceRemoved {
            iface: "eth0".into(),
        };
        assert_eq!(err.class(), ErrorClass::ProcessFatal);
        assert_eq!(err.exit_code(), ExitCode::SUCCESS);
    }

    #[test]
    fn nak_is_session_fatal() {
        assert_eq!(DhcpError::Nak.class(), ErrorClass::SessionFatal);
    }

    #[test]
    fn would_block_is_transient() {
        assert_eq!(DhcpError::WouldBlock.class(), ErrorClass::Transient);
    }
}
