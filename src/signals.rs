//! Signal handling (A4): `signalfd`-based dispatch for USR1/USR2/TERM/
//! PIPE/CHLD, per §6 and §9's resolution of the "partial signalfd read"
//! open question.
//!
//! Signals are blocked via `sigprocmask` at startup and read as structured
//! data from a `signalfd` descriptor registered with the event loop's
//! epoll instance, rather than handled in a traditional async-signal-unsafe
//! handler.

use std::os::fd::{AsRawFd, RawFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd, siginfo::signalfd_siginfo};

use crate::DhcpError;

/// One signal-driven event the event loop must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGUSR1: force-renew from BOUND.
    ForceRenew,
    /// SIGUSR2: release the current lease.
    Release,
    /// SIGTERM: exit cleanly with code 0.
    Terminate,
    /// SIGPIPE: the config-applier ack pipe closed; exit cleanly.
    IfchangePipeClosed,
    /// SIGCHLD: a helper/worker process died; process-fatal.
    HelperDied,
}

/// Owns the blocked signal mask and the `signalfd` descriptor that
/// surfaces it.
pub struct SignalHandler {
    fd: SignalFd,
}

impl SignalHandler {
    /// Block USR1/USR2/TERM/PIPE/CHLD via `sigprocmask`, then open a
    /// non-blocking `signalfd` over the same mask.
    pub fn install() -> Result<Self, DhcpError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGUSR1);
        mask.add(Signal::SIGUSR2);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGPIPE);
        mask.add(Signal::SIGCHLD);
        mask.thread_block().map_err(DhcpError::from)?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).map_err(DhcpError::from)?;
        Ok(SignalHandler { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drain every pending signal, translating each to a [`SignalEvent`].
    ///
    /// Per §9's open-question resolution, a `signalfd` read is treated as
    /// strictly all-or-nothing: each `read` yields one complete
    /// `signalfd_siginfo` record or fails with `EAGAIN`; there is no
    /// partial-record reassembly to perform, so the loop below simply
    /// repeats single reads until `EAGAIN`.
    pub fn poll(&mut self) -> Result<Vec<SignalEvent>, DhcpError> {
        let mut events = Vec::new();
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => {
                    if let Some(ev) = classify(&info) {
                        events.push(ev);
                    }
                }
                Ok(None) => break,
                Err(nix::Error::EAGAIN) => break,
                Err(e) => return Err(DhcpError::from(e)),
            }
        }
        Ok(events)
    }
}

fn classify(info: &signalfd_siginfo) -> Option<SignalEvent> {
    let signo = info.ssi_signo as i32;
    if signo == Signal::SIGUSR1 as i32 {
        Some(SignalEvent::ForceRenew)
    } else if signo == Signal::SIGUSR2 as i32 {
        Some(SignalEvent::Release)
    } else if signo == Signal::SIGTERM as i32 {
        Some(SignalEvent::Terminate)
    } else if signo == Signal::SIGPIPE as i32 {
        Some(SignalEvent::IfchangePipeClosed)
    } else if signo == Signal::SIGCHLD as i32 {
        Some(SignalEvent::HelperDied)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn siginfo_for(signal: Signal) -> signalfd_siginfo {
        // SAFETY: signalfd_siginfo is a plain-old-data struct; zeroing it
        // is valid, we then set the one field `classify` reads.
        let mut info: signalfd_siginfo = unsafe { std::mem::zeroed() };
        info.ssi_signo = signal as u32;
        info
    }

    #[test]
    fn usr1_maps_to_force_renew() {
        assert_eq!(classify(&siginfo_for(Signal::SIGUSR1)), Some(SignalEvent::ForceRenew));
    }

    #[test]
    fn usr2_maps_to_release() {
        assert_eq!(classify(&siginfo_for(Signal::SIGUSR2)), Some(SignalEvent::Release));
    }

    #[test]
    fn term_maps_to_terminate() {
        assert_eq!(classify(&siginfo_for(Signal::SIGTERM)), Some(SignalEvent::Terminate));
    }

    #[test]
    fn pipe_maps_to_ifchange_pipe_closed() {
        assert_eq!(
            classify(&siginfo_for(Signal::SIGPIPE)),
            Some(SignalEvent::IfchangePipeClosed)
        );
    }

    #[test]
    fn chld_maps_to_helper_died() {
        assert_eq!(classify(&siginfo_for(Signal::SIGCHLD)), Some(SignalEvent::HelperDied));
    }

    #[test]
    fn unknown_signal_is_ignored() {
        assert_eq!(classify(&siginfo_for(Signal::SIGHUP)), None);
    }
}
