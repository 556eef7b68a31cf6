//! epoll-driven scheduler (A6) tying the wire codecs, both state machines,
//! the link observer, and the config-applier client together, per §5.
//!
//! The loop alternates two phases until quiescent: drain every ready
//! descriptor to completion, then compute the next deadline and advance
//! whichever state machine's wake timestamp has elapsed. Matches the
//! original's direct `epoll` usage rather than pulling in an async runtime
//! (§5 ambient supplement).

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::arp::ArpPayload;
use crate::arp_state::{ArpAction, ArpOutcome, ArpStateMachine};
use crate::config::Config;
use crate::dhcp::DhcpMessage;
use crate::dhcp_state::{DhcpAction, DhcpParams, DhcpStateMachine};
use crate::ifchange::IfChangeClient;
use crate::link::{LinkEvent, LinkObserver};
use crate::rng::Rng;
use crate::signals::{SignalEvent, SignalHandler};
use crate::socket_helper::SocketHelperClient;
use crate::state::{ClientState, LinkState};
use crate::timer::{earliest_wake, until, Clock};
use crate::transport::{CookedSocket, DhcpSocket, RawSocket, Transport};
use crate::{DhcpError, MacAddr};

/// Opaque epoll interest tokens; the loop matches on which descriptor fired
/// rather than relying on a generic registry, since the descriptor set is
/// small and fixed (§5: "one I/O multiplexer watches: raw/UDP socket, ARP
/// socket, netlink socket, signal pipe, the config worker channel").
const TOKEN_TRANSPORT: u64 = 1;
const TOKEN_ARP: u64 = 2;
const TOKEN_LINK: u64 = 3;
const TOKEN_SIGNAL: u64 = 4;
const TOKEN_IFCHANGE_ACK: u64 = 5;

/// The two file descriptors of the config-applier pipe pair (§6): commands
/// flow out `cmd_fd`, the single-byte ack comes back on `ack_fd`.
pub struct IfChangePipes {
    pub cmd_fd: RawFd,
    pub ack_fd: RawFd,
}

/// Everything the event loop needs to drive one `ndhc` instance to
/// completion.
pub struct EventLoop<C: Clock> {
    clock: C,
    rng: Rng,
    epoll: Epoll,

    dhcp: DhcpStateMachine,
    arp: ArpStateMachine,
    client_state: ClientState,
    params: DhcpParams,

    transport: Transport,
    /// Re-requests a raw socket from the privileged helper whenever the
    /// transport needs to switch back from the cooked path (§4.4, §6: "all
    /// subsequent raw-socket reopening is delegated to the helper").
    helper: SocketHelperClient,
    arp_fd: RawFd,
    link: LinkObserver,
    signals: SignalHandler,
    ifchange: IfChangeClient,
    ifchange_pipes: IfChangePipes,

    requested_ip: Option<Ipv4Addr>,
    probe_wait_min_ms: u64,
    probe_wait_max_ms: u64,
    quit_after_lease: bool,

    /// The ACK awaiting an RFC 5227 collision check verdict (§4.6 REQUESTING
    /// → BOUND). `None` whenever `arp.is_idle()` would also be true.
    pending_ack: Option<DhcpMessage>,
}

/// What [`EventLoop::run`] ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// TERM, interface removal, or `--quit-after-lease` once bound.
    Clean,
    /// CHLD: a privileged helper died.
    HelperDied,
}

impl<C: Clock> EventLoop<C> {
    /// Assemble the loop from already-open resources. `arp_fd` is a second
    /// `AF_PACKET` socket filtered to ARP frames (opened the same way as
    /// the raw transport, via the socket helper); it is independent of
    /// `transport` because ARP traffic is exchanged even once the cooked
    /// UDP path is open for DHCP (§4.5 DEFENSE stays active while BOUND).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: C,
        rng: Rng,
        config: &Config,
        client_mac: crate::MacAddr,
        transport: Transport,
        helper: SocketHelperClient,
        arp_fd: RawFd,
        link: LinkObserver,
        signals: SignalHandler,
        ifchange_pipes: IfChangePipes,
    ) -> Result<Self, DhcpError> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(DhcpError::from)?;
        epoll
            .add(
                borrow(transport.as_raw_fd()),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_TRANSPORT),
            )
            .map_err(DhcpError::from)?;
        epoll
            .add(borrow(arp_fd), EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_ARP))
            .map_err(DhcpError::from)?;
        epoll
            .add(
                borrow(link.as_raw_fd()),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_LINK),
            )
            .map_err(DhcpError::from)?;
        epoll
            .add(
                borrow(signals.as_raw_fd()),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL),
            )
            .map_err(DhcpError::from)?;
        epoll
            .add(
                borrow(ifchange_pipes.ack_fd),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_IFCHANGE_ACK),
            )
            .map_err(DhcpError::from)?;

        let params = DhcpParams {
            client_mac,
            client_id: config.client_id.clone().map(|s| s.into_bytes()),
            vendor_id: config.vendor_id.clone(),
            hostname: config.dhcp_hostname.clone(),
        };

        Ok(EventLoop {
            clock,
            rng,
            epoll,
            dhcp: DhcpStateMachine::new(),
            arp: ArpStateMachine::new(config.relentless_defense),
            client_state: ClientState::new(config.interface.clone(), client_mac),
            params,
            transport,
            helper,
            arp_fd,
            link,
            signals,
            ifchange: IfChangeClient::new(),
            ifchange_pipes,
            requested_ip: config.requested_ip,
            probe_wait_min_ms: config.probe_wait_min_ms,
            probe_wait_max_ms: config.probe_wait_max_ms,
            quit_after_lease: config.quit_after_lease,
            pending_ack: None,
        })
    }

    /// Drive the loop to completion. Returns once TERM/removal/helper-death
    /// concludes the run, or (if `--quit-after-lease` is set) once the
    /// first lease is bound.
    pub fn run(&mut self) -> Result<ExitReason, DhcpError> {
        let now = self.clock.now_ms();
        let actions = self.dhcp.start(now, &mut self.rng, &self.params, self.requested_ip);
        self.handle_dhcp_actions(actions)?;

        loop {
            if self.quit_after_lease && self.client_state.last_accepted_packet.is_some() {
                return Ok(ExitReason::Clean);
            }

            let wake = earliest_wake(self.dhcp.next_wake_ts(), self.arp.next_wake_ts());
            let wake = earliest_wake(wake, self.lease_wake_ts());
            let now = self.clock.now_ms();
            let timeout = until(now, wake).unwrap_or(Duration::from_secs(3600));

            let mut events = [EpollEvent::empty(); 8];
            let n = self
                .epoll
                .wait(&mut events, epoll_timeout(timeout))
                .map_err(DhcpError::from)?;

            for ev in &events[..n] {
                match ev.data() {
                    TOKEN_TRANSPORT => self.drain_transport()?,
                    TOKEN_ARP => self.drain_arp()?,
                    TOKEN_LINK => self.drain_link()?,
                    TOKEN_SIGNAL => {
                        if let Some(reason) = self.drain_signals()? {
                            return Ok(reason);
                        }
                    }
                    TOKEN_IFCHANGE_ACK => self.drain_ifchange_ack()?,
                    _ => {}
                }
            }

            if n == 0 {
                self.advance_timers()?;
            }
        }
    }

    /// Earliest of T1/T2/expire that is still pending, so the multiplexer
    /// wait never sleeps past a lease deadline even though neither state
    /// machine tracks those deadlines itself (§4.3: "the caller drives the
    /// first send"; T1/T2/expire live on `ClientState`).
    fn lease_wake_ts(&self) -> Option<u64> {
        if self.client_state.last_accepted_packet.is_none() {
            return None;
        }
        [
            self.client_state.lease_t1_ms,
            self.client_state.lease_t2_ms,
            self.client_state.lease_expire_ms,
        ]
        .into_iter()
        .filter(|&ts| ts > 0)
        .min()
    }

    fn drain_transport(&mut self) -> Result<(), DhcpError> {
        loop {
            match self.transport.as_socket().recv_message() {
                Ok(Some(msg)) => {
                    let expected = self.dhcp.current_xid();
                    if expected != 0 && msg.header.xid != expected {
                        continue;
                    }
                    let now = self.clock.now_ms();
                    let actions = self.dhcp.on_packet(&msg, now);
                    self.handle_dhcp_actions(actions)?;
                }
                Ok(None) => break,
                Err(nix::Error::EAGAIN) => break,
                Err(e) => return Err(DhcpError::from(e)),
            }
        }
        Ok(())
    }

    fn drain_arp(&mut self) -> Result<(), DhcpError> {
        loop {
            let mut buf = [0_u8; 128];
            match nix::sys::socket::recv(self.arp_fd, &mut buf, nix::sys::socket::MsgFlags::empty()) {
                Ok(n) => {
                    let Some(frame) = ArpPayload::from_eth_frame(&buf[..n]) else {
                        continue;
                    };
                    let now = self.clock.now_ms();
                    let held = if self.client_state.last_accepted_packet.is_some() {
                        Some(self.client_state.client_addr.into())
                    } else {
                        None
                    };
                    let action = self.arp.on_packet(&frame, now, self.client_state.client_mac, held);
                    self.handle_arp_action(action)?;
                }
                Err(nix::Error::EAGAIN) => break,
                Err(e) => return Err(DhcpError::from(e)),
            }
        }
        Ok(())
    }

    fn drain_link(&mut self) -> Result<(), DhcpError> {
        for event in self.link.poll()? {
            match event {
                LinkEvent::Up => {
                    // §4.7: GW_CHECK only applies when carrier was
                    // previously lost; a spurious Up (no preceding
                    // Down/Shut) restarts at INIT like any other Up.
                    let was_down = matches!(
                        self.client_state.link_state,
                        LinkState::Down | LinkState::Shut
                    );
                    self.client_state.link_state = LinkState::Up;
                    if was_down && self.dhcp.is_bound_family() {
                        self.arp
                            .begin_gw_check(self.client_state.router_addr.into(), self.clock.now_ms());
                    } else {
                        let now = self.clock.now_ms();
                        let actions = self.dhcp.start(now, &mut self.rng, &self.params, None);
                        self.handle_dhcp_actions(actions)?;
                    }
                }
                LinkEvent::Down => {
                    self.client_state.link_state = LinkState::Down;
                    self.arp.go_idle();
                }
                LinkEvent::Shut => {
                    self.client_state.link_state = LinkState::Shut;
                    self.arp.go_idle();
                }
                LinkEvent::Removed => {
                    self.client_state.link_state = LinkState::Removed;
                    return Err(DhcpError::InterfaceRemoved {
                        iface: self.client_state.interface.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn drain_signals(&mut self) -> Result<Option<ExitReason>, DhcpError> {
        for sig in self.signals.poll()? {
            match sig {
                SignalEvent::ForceRenew => {
                    let now = self.clock.now_ms();
                    let actions = if self.dhcp.is_released() {
                        self.dhcp.reenter_init_from_released(now, &mut self.rng, &self.params)
                    } else {
                        let ciaddr = self.client_state.client_addr;
                        self.dhcp.force_renew(now, &mut self.rng, &self.params, ciaddr)
                    };
                    self.handle_dhcp_actions(actions)?;
                }
                SignalEvent::Release => {
                    let ciaddr = self.client_state.client_addr;
                    let server = self.client_state.server_addr;
                    let actions = self.dhcp.release(&self.params, ciaddr, server, &mut self.rng);
                    self.handle_dhcp_actions(actions)?;
                }
                SignalEvent::Terminate => return Ok(Some(ExitReason::Clean)),
                SignalEvent::IfchangePipeClosed => return Ok(Some(ExitReason::Clean)),
                SignalEvent::HelperDied => return Ok(Some(ExitReason::HelperDied)),
            }
        }
        Ok(None)
    }

    fn drain_ifchange_ack(&mut self) -> Result<(), DhcpError> {
        let mut buf = [0_u8; 64];
        loop {
            match nix::unistd::read(self.ifchange_pipes.ack_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if buf[..n].contains(&b'+') {
                        self.ifchange.ack();
                    }
                }
                Err(nix::Error::EAGAIN) => break,
                Err(e) => return Err(DhcpError::from(e)),
            }
        }
        Ok(())
    }

    fn advance_timers(&mut self) -> Result<(), DhcpError> {
        let now = self.clock.now_ms();

        // §4.7: LINK_DOWN/LINK_SHUT keep DHCP timers suspended until
        // LINK_UP — no retransmit, no T1/T2/expire, while carrier is gone.
        if self.client_state.link_state == LinkState::Up {
            if self.client_state.lease_expire_ms > 0 && now >= self.client_state.lease_expire_ms {
                let actions = self.dhcp.expire_to_init(now, &mut self.rng, &self.params);
                self.client_state.clear_lease();
                self.handle_dhcp_actions(actions)?;
            } else if self.client_state.lease_t2_ms > 0 && now >= self.client_state.lease_t2_ms && self.dhcp.is_bound_family() {
                let actions = self.dhcp.enter_rebinding(now, &self.params, self.client_state.client_addr);
                self.handle_dhcp_actions(actions)?;
            } else if self.client_state.lease_t1_ms > 0 && now >= self.client_state.lease_t1_ms && self.dhcp.is_bound_family() {
                let actions = self.dhcp.enter_renewing(now, &self.params, self.client_state.client_addr);
                self.handle_dhcp_actions(actions)?;
            }

            if let Some(deadline) = self.dhcp.next_wake_ts() {
                if now >= deadline {
                    let actions = self.dhcp.on_timeout(
                        now,
                        &mut self.rng,
                        &self.params,
                        self.client_state.client_addr,
                        self.client_state.lease_t2_ms,
                        self.client_state.lease_expire_ms,
                    );
                    self.handle_dhcp_actions(actions)?;
                }
            }
        }

        if let Some(deadline) = self.arp.next_wake_ts() {
            if now >= deadline {
                let action = self.arp.on_wake(now, self.client_state.client_mac, &mut self.rng);
                self.handle_arp_action(action)?;
            }
        }

        Ok(())
    }

    /// Switch the DHCP transport to the raw `AF_PACKET` broadcast path
    /// (INIT, SELECTING, REQUESTING, REBINDING), requesting a fresh fd from
    /// the socket helper if the cooked path was open (§4.4, §5 invariant 5:
    /// "exactly one of the two transport sockets is open at all times").
    /// A no-op if the raw path is already open.
    fn ensure_raw(&mut self) -> Result<(), DhcpError> {
        if self.transport.is_raw() {
            return Ok(());
        }
        let old_fd = self.transport.as_raw_fd();
        let fd = self.helper.request_raw_socket()?;
        set_nonblocking(fd.as_raw_fd())?;
        self.epoll.delete(borrow(old_fd)).map_err(DhcpError::from)?;
        self.epoll
            .add(
                borrow(fd.as_raw_fd()),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_TRANSPORT),
            )
            .map_err(DhcpError::from)?;
        self.transport = Transport::Raw(RawSocket::from_fd(fd, self.client_state.client_mac));
        Ok(())
    }

    /// Switch the DHCP transport to the connected-UDP cooked path
    /// (RENEWING, RELEASE). A no-op if the cooked path is already open.
    fn ensure_cooked(&mut self, client_addr: Ipv4Addr, server_addr: Ipv4Addr) -> Result<(), DhcpError> {
        if !self.transport.is_raw() {
            return Ok(());
        }
        let old_fd = self.transport.as_raw_fd();
        let cooked = CookedSocket::connect(client_addr, server_addr).map_err(DhcpError::from)?;
        self.epoll.delete(borrow(old_fd)).map_err(DhcpError::from)?;
        self.epoll
            .add(
                borrow(cooked.as_raw_fd()),
                EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_TRANSPORT),
            )
            .map_err(DhcpError::from)?;
        self.transport = Transport::Cooked(cooked);
        Ok(())
    }

    fn handle_dhcp_actions(&mut self, actions: Vec<DhcpAction>) -> Result<(), DhcpError> {
        for action in actions {
            match action {
                DhcpAction::SendRaw(msg) => {
                    self.ensure_raw()?;
                    self.send_dhcp(&msg)?;
                }
                DhcpAction::SendCooked(msg) => {
                    let client_addr = self.client_state.client_addr;
                    let server_addr = self.client_state.server_addr;
                    self.ensure_cooked(client_addr, server_addr)?;
                    self.send_dhcp(&msg)?;
                }
                DhcpAction::StartCollisionCheck(msg) => {
                    let candidate: Ipv4Addr = msg.header.yiaddr.into();
                    self.pending_ack = Some(*msg);
                    let now = self.clock.now_ms();
                    self.arp.begin_collision_check(
                        candidate.into(),
                        now,
                        &mut self.rng,
                        self.probe_wait_min_ms,
                        self.probe_wait_max_ms,
                    );
                }
                DhcpAction::ApplyLease(msg) => {
                    self.apply_lease(*msg)?;
                }
                DhcpAction::Deconfigure => {
                    self.deconfigure()?;
                }
                DhcpAction::LogTransition(label) => {
                    log::info!(
                        "{}: {} (yiaddr={} server={})",
                        self.client_state.interface,
                        label,
                        self.client_state.client_addr,
                        self.client_state.server_addr,
                    );
                }
            }
        }
        Ok(())
    }

    fn handle_arp_action(&mut self, action: ArpAction) -> Result<(), DhcpError> {
        match action {
            ArpAction::Send(frame) => {
                // ARP requests and gratuitous announcements are always sent
                // to the Ethernet broadcast address, even when resolving a
                // single known host (§4.2).
                let eth = frame.to_eth_frame(self.client_state.client_mac, MacAddr::BROADCAST);
                nix::sys::socket::send(self.arp_fd, &eth, nix::sys::socket::MsgFlags::empty())
                    .map(|_| ())
                    .or_else(|e| if e == nix::Error::EAGAIN { Ok(()) } else { Err(e) })
                    .map_err(DhcpError::from)?;
            }
            ArpAction::Done(outcome) => self.handle_arp_outcome(outcome)?,
            ArpAction::None => {}
        }
        Ok(())
    }

    fn handle_arp_outcome(&mut self, outcome: ArpOutcome) -> Result<(), DhcpError> {
        match outcome {
            ArpOutcome::Free => {
                log::info!("{}: address free, no conflicting replies seen", self.client_state.interface);
                if let Some(msg) = self.pending_ack.take() {
                    let now = self.clock.now_ms();
                    let actions = self.dhcp.collision_check_passed(msg, now);
                    self.handle_dhcp_actions(actions)?;
                }
            }
            ArpOutcome::Conflict => {
                self.pending_ack = None;
                let now = self.clock.now_ms();
                let actions = self.dhcp.collision_check_failed(now, &mut self.rng, &self.params);
                self.handle_dhcp_actions(actions)?;
            }
            ArpOutcome::GwQueryUnresolved => {
                log::warn!(
                    "{}: gateway MAC unresolved, proceeding without it",
                    self.client_state.interface
                );
            }
            ArpOutcome::GwCheckFailed => {
                log::warn!(
                    "{}: gateway unreachable after carrier return, restarting lease",
                    self.client_state.interface
                );
                let now = self.clock.now_ms();
                let actions = self.dhcp.expire_to_init(now, &mut self.rng, &self.params);
                self.handle_dhcp_actions(actions)?;
            }
            ArpOutcome::Ok => {
                log::debug!("{}: gateway reachability confirmed", self.client_state.interface);
            }
        }
        Ok(())
    }

    fn send_dhcp(&self, msg: &DhcpMessage) -> Result<(), DhcpError> {
        self.transport.as_socket().send_message(msg).map_err(DhcpError::from)
    }

    fn apply_lease(&mut self, msg: DhcpMessage) -> Result<(), DhcpError> {
        let lease_secs = msg
            .option(crate::dhcp::DhcpOptionCode::IpAddressLeaseTime)
            .and_then(|o| o.as_u32());
        let t1_secs = msg
            .option(crate::dhcp::DhcpOptionCode::RenewalTime)
            .and_then(|o| o.as_u32());
        let t2_secs = msg
            .option(crate::dhcp::DhcpOptionCode::RebindingTime)
            .and_then(|o| o.as_u32());
        let timers = crate::state::LeaseTimers::derive(lease_secs, t1_secs, t2_secs);

        let yiaddr: Ipv4Addr = msg.header.yiaddr.into();
        let server: Ipv4Addr = msg
            .option(crate::dhcp::DhcpOptionCode::ServerIdentifier)
            .and_then(|o| o.as_ipv4())
            .map(Ipv4Addr::from)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let router: Ipv4Addr = msg
            .option(crate::dhcp::DhcpOptionCode::Router)
            .and_then(|o| o.as_ipv4())
            .map(Ipv4Addr::from)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let previous = self.client_state.last_accepted_packet.clone();
        let batch = self.ifchange.bind_batch(&msg, previous.as_ref());

        self.client_state.client_addr = yiaddr;
        self.client_state.server_addr = server;
        self.client_state.router_addr = router;
        let now = self.clock.now_ms();
        self.client_state.record_lease(msg, timers, now);

        if !batch.is_empty() {
            self.ifchange.mark_sent()?;
            self.write_ifchange_batch(&batch)?;
        }

        // Transport stays on whatever path just delivered the ACK (raw,
        // from REQUESTING/collision check) through BOUND; it only switches
        // to the cooked unicast path once RENEWING's `SendCooked` action
        // runs, via `ensure_cooked` (§4.4).
        self.arp.begin_gw_query(router.into(), now);
        Ok(())
    }

    fn deconfigure(&mut self) -> Result<(), DhcpError> {
        if self.client_state.last_accepted_packet.is_some() {
            let batch = self.ifchange.deconfigure_batch();
            self.ifchange.mark_sent()?;
            self.write_ifchange_batch(&batch)?;
        }
        self.client_state.clear_lease();
        self.arp.go_idle();
        Ok(())
    }

    fn write_ifchange_batch(&self, batch: &str) -> Result<(), DhcpError> {
        nix::unistd::write(borrow(self.ifchange_pipes.cmd_fd), batch.as_bytes())
            .map(|_| ())
            .map_err(DhcpError::from)
    }
}

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: every fd passed here outlives the `Epoll`/write calls that
    // use it, since it is owned by the same `EventLoop` for the duration
    // of the run. `nix::unistd::write` takes an `AsFd` borrow rather than
    // a raw fd, unlike the `nix::sys::socket` functions used elsewhere in
    // this crate.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn epoll_timeout(d: Duration) -> EpollTimeout {
    EpollTimeout::try_from(d).unwrap_or(EpollTimeout::NONE)
}

/// Set `O_NONBLOCK` on a freshly-acquired raw socket fd, matching the one
/// the binary applies to the descriptors it receives at startup.
fn set_nonblocking(fd: RawFd) -> Result<(), DhcpError> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(DhcpError::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(DhcpError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoll_timeout_conversion_does_not_panic_on_large_durations() {
        let _ = epoll_timeout(Duration::from_secs(u64::MAX / 2));
    }
}
