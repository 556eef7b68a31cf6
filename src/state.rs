//! The authoritative run-time record (§3 `ClientState`) and the handful of
//! pure numeric rules (lease-timer clamping) shared by both state machines.
//!
//! The tagged unions the original carries (`arp_state_t`, `dhcp_state_t`)
//! are *not* reproduced here as a single flat struct with a discriminant
//! field (§9): each sub-state-machine's own module (`dhcp_state`,
//! `arp_state`) owns an enum whose variants carry exactly the data that
//! state needs. What lives here is the data genuinely shared between them:
//! link state, learned addresses, lease deadlines, and the cached packet
//! used to diff config-applier commands.

use std::net::Ipv4Addr;

use crate::dhcp::DhcpMessage;
use crate::MacAddr;

/// Kernel-reported carrier/admin state of the managed interface (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Carrier present, interface administratively up.
    Up,
    /// Interface administratively up but carrier absent.
    Down,
    /// Interface administratively down.
    Shut,
    /// Interface no longer exists in the kernel.
    Removed,
}

/// Minimum lease, in seconds, after clamping (§4.6, §8 invariant 3).
pub const MIN_LEASE_SECS: u32 = 60;

/// Default lease when the server omits option 51 (§4.6).
pub const DEFAULT_LEASE_SECS: u32 = 3600;

/// The clamped (T1, T2, lease) triple in seconds, satisfying
/// `0 <= T1 <= T2 <= lease` and `lease >= MIN_LEASE_SECS` (§8 invariant 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimers {
    pub t1_secs: u32,
    pub t2_secs: u32,
    pub lease_secs: u32,
}

impl LeaseTimers {
    /// Derive T1/T2/lease from what the server actually sent, applying the
    /// defaults and clamps in §4.6: lease defaults to one hour if absent;
    /// `lease_t1_ms = start + min(T1, lease/2)`, `lease_t2_ms = start +
    /// min(T2, lease*7/8)` — a cap applied to a server-supplied T1/T2 too,
    /// not only to the default — and the result is then clamped so
    /// `T1 <= T2 <= lease` and `lease >= 60`.
    pub fn derive(lease_secs: Option<u32>, t1_secs: Option<u32>, t2_secs: Option<u32>) -> Self {
        let lease = lease_secs.unwrap_or(DEFAULT_LEASE_SECS).max(MIN_LEASE_SECS);
        let t1_cap = lease / 2;
        let t2_cap = lease * 7 / 8;
        let t1 = t1_secs.unwrap_or(t1_cap).min(t1_cap);
        let t2 = t2_secs.unwrap_or(t2_cap).min(t2_cap);
        let t2 = t2.max(t1).min(lease);
        let t1 = t1.min(t2);
        LeaseTimers {
            t1_secs: t1,
            t2_secs: t2,
            lease_secs: lease,
        }
    }

    /// Absolute monotonic deadlines given a lease start instant.
    pub fn deadlines(&self, lease_start_ms: u64) -> (u64, u64, u64) {
        let t1_ms = lease_start_ms + self.t1_secs as u64 * 1000;
        let t2_ms = lease_start_ms + self.t2_secs as u64 * 1000;
        let expire_ms = lease_start_ms + self.lease_secs as u64 * 1000;
        (t1_ms, t2_ms, expire_ms)
    }
}

/// Data shared between the DHCP and ARP state machines and the config
/// applier, outliving any single state transition.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub interface: String,
    pub client_mac: MacAddr,
    pub link_state: LinkState,

    pub client_addr: Ipv4Addr,
    pub server_addr: Ipv4Addr,
    pub router_addr: Ipv4Addr,

    pub lease_start_ms: u64,
    pub lease_t1_ms: u64,
    pub lease_t2_ms: u64,
    pub lease_expire_ms: u64,

    /// Cached copy of the packet behind the currently-applied
    /// configuration; `None` exactly when no lease is applied (§3
    /// invariant on `last_accepted_packet`).
    pub last_accepted_packet: Option<DhcpMessage>,

    pub router_arp: MacAddr,
    pub server_arp: MacAddr,
}

impl ClientState {
    pub fn new(interface: String, client_mac: MacAddr) -> Self {
        ClientState {
            interface,
            client_mac,
            link_state: LinkState::Up,
            client_addr: Ipv4Addr::UNSPECIFIED,
            server_addr: Ipv4Addr::UNSPECIFIED,
            router_addr: Ipv4Addr::UNSPECIFIED,
            lease_start_ms: 0,
            lease_t1_ms: 0,
            lease_t2_ms: 0,
            lease_expire_ms: 0,
            last_accepted_packet: None,
            router_arp: MacAddr::ANY,
            server_arp: MacAddr::ANY,
        }
    }

    /// Record a newly-bound lease: stamps the four timers and caches the
    /// accepted packet (§4.6 BOUND entry).
    pub fn record_lease(&mut self, packet: DhcpMessage, timers: LeaseTimers, now_ms: u64) {
        let (t1, t2, expire) = timers.deadlines(now_ms);
        self.lease_start_ms = now_ms;
        self.lease_t1_ms = t1;
        self.lease_t2_ms = t2;
        self.lease_expire_ms = expire;
        self.last_accepted_packet = Some(packet);
    }

    /// Reset to the "no lease" condition (§3: `last_accepted_packet` zeroed
    /// exactly when no lease is applied).
    pub fn clear_lease(&mut self) {
        self.client_addr = Ipv4Addr::UNSPECIFIED;
        self.server_addr = Ipv4Addr::UNSPECIFIED;
        self.router_addr = Ipv4Addr::UNSPECIFIED;
        self.lease_start_ms = 0;
        self.lease_t1_ms = 0;
        self.lease_t2_ms = 0;
        self.lease_expire_ms = 0;
        self.last_accepted_packet = None;
        self.router_arp = MacAddr::ANY;
        self.server_arp = MacAddr::ANY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_is_one_hour_half_and_seven_eighths() {
        let t = LeaseTimers::derive(None, None, None);
        assert_eq!(t.lease_secs, 3600);
        assert_eq!(t.t1_secs, 1800);
        assert_eq!(t.t2_secs, 3150);
    }

    #[test]
    fn short_lease_is_clamped_to_minimum() {
        let t = LeaseTimers::derive(Some(10), None, None);
        assert_eq!(t.lease_secs, 60);
        assert!(t.t1_secs <= t.t2_secs);
        assert!(t.t2_secs <= t.lease_secs);
    }

    #[test]
    fn server_t1_t2_beyond_lease_are_clamped() {
        let t = LeaseTimers::derive(Some(3600), Some(5000), Some(6000));
        assert!(t.t1_secs <= t.t2_secs);
        assert!(t.t2_secs <= t.lease_secs);
    }

    #[test]
    fn inverted_server_t1_t2_are_reordered() {
        // Pathological server: T1 > T2.
        let t = LeaseTimers::derive(Some(3600), Some(3000), Some(1000));
        assert!(t.t1_secs <= t.t2_secs);
        assert!(t.t2_secs <= t.lease_secs);
    }

    #[test]
    fn deadlines_are_monotone() {
        let t = LeaseTimers::derive(Some(3600), None, None);
        let (t1, t2, expire) = t.deadlines(10_000);
        assert!(10_000 <= t1 && t1 <= t2 && t2 <= expire);
    }
}
