//! RFC 5227 conflict-detection sub-state-machine (C5).
//!
//! Mirrors the original's `struct arp_data` bookkeeping (§4.5): a
//! per-send-kind `{ts, count}` pair, a per-state wake timestamp, and the
//! conflict counters that must survive a transition out of `Defense` and
//! back in. What changes is the representation — `arp_state_t`'s flat enum
//! plus a side `struct arp_data` becomes one tagged `ArpState` whose active
//! variant carries only the data that state needs, per §9.

use crate::arp::ArpPayload;
use crate::{IpV4Addr, MacAddr};
use crate::rng::Rng;

/// RFC 5227 default probe count.
pub const PROBE_NUM: u32 = 3;
/// Wait after the last probe before the first announcement.
pub const ANNOUNCE_WAIT_MS: u64 = 2_000;
/// RFC 5227 default announcement count.
pub const ANNOUNCE_NUM: u32 = 2;
/// Interval between announcements.
pub const ANNOUNCE_INTERVAL_MS: u64 = 2_000;
/// Minimum interval between two accepted defense transmissions, absent
/// `relentless_def` (§4.5, §8 invariant 4).
pub const DEFEND_INTERVAL_MS: u64 = 10_000;
/// Initial `GW_QUERY` retry interval.
const GW_QUERY_INITIAL_MS: u64 = 64;
/// Cap on `GW_QUERY` exponential backoff.
const GW_QUERY_CAP_MS: u64 = 2_000;
/// Maximum `GW_QUERY` attempts before giving up.
const GW_QUERY_MAX_ATTEMPTS: u32 = 3;
/// Maximum `GW_CHECK` pings before declaring the gateway unreachable.
const GW_CHECK_MAX_PINGS: u32 = 6;
/// Per-ping timeout for `GW_CHECK`.
const GW_CHECK_TIMEOUT_MS: u64 = 1_000;

/// Outcome of a concluded collision/gateway check (mirrors the original's
/// `ARPR_*` return codes as an enum rather than signed-integer constants,
/// per §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOutcome {
    /// No action needed; informational completion.
    Ok,
    /// No conflict: the candidate address is free to use.
    Free,
    /// Another host answered for our address or candidate.
    Conflict,
    /// `GW_QUERY` exhausted its retries without a reply (§4.5: "proceed but
    /// mark `router_arp` unknown" — not fatal to the lease).
    GwQueryUnresolved,
    /// `GW_CHECK` exhausted its retries without a reply (§4.5/§4.7: "forces
    /// a return to INIT").
    GwCheckFailed,
}

/// What the caller should do after driving the state machine one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArpAction {
    /// Transmit this frame now.
    Send(ArpPayload),
    /// The active check has concluded with this outcome; the state machine
    /// has already returned to an idle/next state.
    Done(ArpOutcome),
    /// Nothing to do.
    None,
}

#[derive(Debug, Clone, Copy)]
struct CollisionCheck {
    candidate: IpV4Addr,
    probes_sent: u32,
    announces_sent: u32,
    wake_ts: u64,
    /// Set once the probe phase ends and the announce-wait timer starts.
    announcing: bool,
}

#[derive(Debug, Clone, Copy)]
struct GwQuery {
    target: IpV4Addr,
    attempts: u32,
    backoff_ms: u64,
    wake_ts: u64,
}

#[derive(Debug, Clone, Copy)]
struct GwCheck {
    target: IpV4Addr,
    pings_sent: u32,
    wake_ts: u64,
}

#[derive(Debug, Clone, Copy)]
enum ArpState {
    None,
    CollisionCheck(CollisionCheck),
    GwQuery(GwQuery),
    GwCheck(GwCheck),
    /// Passively watching for conflicts on the held address; entered once
    /// `GwQuery`/`GwCheck` concludes and remains active through
    /// BOUND/RENEWING/REBINDING (§8 invariant 2).
    Defense,
}

/// The ARP conflict-detection engine for one managed address.
pub struct ArpStateMachine {
    state: ArpState,
    relentless_def: bool,
    last_conflict_ts: Option<u64>,
    total_conflicts: u32,
}

impl ArpStateMachine {
    pub fn new(relentless_def: bool) -> Self {
        ArpStateMachine {
            state: ArpState::None,
            relentless_def,
            last_conflict_ts: None,
            total_conflicts: 0,
        }
    }

    /// Total address conflicts observed on this interface since startup.
    /// Never decreases.
    pub fn total_conflicts(&self) -> u32 {
        self.total_conflicts
    }

    /// Next absolute wake timestamp this machine needs, or `None` if it is
    /// idle (§4.5 "each state exposes its own wake_ts; the machine reports
    /// the min").
    pub fn next_wake_ts(&self) -> Option<u64> {
        match self.state {
            ArpState::None | ArpState::Defense => None,
            ArpState::CollisionCheck(c) => Some(c.wake_ts),
            ArpState::GwQuery(g) => Some(g.wake_ts),
            ArpState::GwCheck(g) => Some(g.wake_ts),
        }
    }

    /// Enter `COLLISION_CHECK` for `candidate` (§4.5; §3 invariant 1
    /// requires the caller only do this from DHCP `REQUESTING`).
    pub fn begin_collision_check(
        &mut self,
        candidate: IpV4Addr,
        now_ms: u64,
        rng: &mut Rng,
        probe_min_ms: u64,
        probe_max_ms: u64,
    ) -> ArpAction {
        let wake_ts = now_ms + rng.jitter_ms(probe_min_ms, probe_max_ms);
        self.state = ArpState::CollisionCheck(CollisionCheck {
            candidate,
            probes_sent: 0,
            announces_sent: 0,
            wake_ts,
            announcing: false,
        });
        ArpAction::None
    }

    /// Enter `GW_QUERY` to learn the router's MAC (§4.5).
    pub fn begin_gw_query(&mut self, router_addr: IpV4Addr, now_ms: u64) {
        self.state = ArpState::GwQuery(GwQuery {
            target: router_addr,
            attempts: 0,
            backoff_ms: GW_QUERY_INITIAL_MS,
            wake_ts: now_ms,
        });
    }

    /// Enter `GW_CHECK` after carrier returns while a lease is held (§4.5,
    /// §4.7).
    pub fn begin_gw_check(&mut self, router_addr: IpV4Addr, now_ms: u64) {
        self.state = ArpState::GwCheck(GwCheck {
            target: router_addr,
            pings_sent: 0,
            wake_ts: now_ms,
        });
    }

    /// Drop back to idle watching, e.g. after DHCP leaves BOUND/RENEWING/
    /// REBINDING.
    pub fn go_idle(&mut self) {
        self.state = ArpState::None;
    }

    /// Drive the state machine's active check one step after its
    /// `next_wake_ts()` has elapsed.
    pub fn on_wake(&mut self, now_ms: u64, client_mac: MacAddr, rng: &mut Rng) -> ArpAction {
        match self.state {
            ArpState::None | ArpState::Defense => ArpAction::None,
            ArpState::CollisionCheck(mut c) => {
                if !c.announcing {
                    if c.probes_sent < PROBE_NUM {
                        c.probes_sent += 1;
                        let frame = ArpPayload::probe(client_mac, c.candidate);
                        if c.probes_sent < PROBE_NUM {
                            c.wake_ts = now_ms + rng.jitter_ms(1000, 2000);
                        } else {
                            c.wake_ts = now_ms + ANNOUNCE_WAIT_MS;
                            c.announcing = true;
                        }
                        self.state = ArpState::CollisionCheck(c);
                        ArpAction::Send(frame)
                    } else {
                        c.announcing = true;
                        c.wake_ts = now_ms + ANNOUNCE_WAIT_MS;
                        self.state = ArpState::CollisionCheck(c);
                        ArpAction::None
                    }
                } else if c.announces_sent < ANNOUNCE_NUM {
                    c.announces_sent += 1;
                    let frame = ArpPayload::announce(client_mac, c.candidate);
                    // After the last announcement there is nothing left to
                    // wait on, but a `Done` still has to be delivered on a
                    // later wake rather than inline with this `Send` — set
                    // an immediate wake so the next poll reports it instead
                    // of `next_wake_ts` going quiet with no outcome sent.
                    c.wake_ts = if c.announces_sent < ANNOUNCE_NUM {
                        now_ms + ANNOUNCE_INTERVAL_MS
                    } else {
                        now_ms
                    };
                    self.state = ArpState::CollisionCheck(c);
                    ArpAction::Send(frame)
                } else {
                    self.state = ArpState::None;
                    ArpAction::Done(ArpOutcome::Free)
                }
            }
            ArpState::GwQuery(mut g) => {
                if g.attempts >= GW_QUERY_MAX_ATTEMPTS {
                    self.state = ArpState::Defense;
                    return ArpAction::Done(ArpOutcome::GwQueryUnresolved);
                }
                g.attempts += 1;
                let frame = ArpPayload::request(client_mac, IpV4Addr::ANY, g.target);
                g.wake_ts = now_ms + g.backoff_ms;
                g.backoff_ms = (g.backoff_ms * 2).min(GW_QUERY_CAP_MS);
                self.state = ArpState::GwQuery(g);
                ArpAction::Send(frame)
            }
            ArpState::GwCheck(mut g) => {
                if g.pings_sent >= GW_CHECK_MAX_PINGS {
                    self.state = ArpState::None;
                    return ArpAction::Done(ArpOutcome::GwCheckFailed);
                }
                g.pings_sent += 1;
                let frame = ArpPayload::request(client_mac, IpV4Addr::ANY, g.target);
                g.wake_ts = now_ms + GW_CHECK_TIMEOUT_MS;
                self.state = ArpState::GwCheck(g);
                ArpAction::Send(frame)
            }
        }
    }

    /// Inspect a received ARP frame against whatever check is active, plus
    /// passive defense of a held address. `held_addr` is `Some` whenever
    /// DHCP is in BOUND/RENEWING/REBINDING.
    pub fn on_packet(
        &mut self,
        frame: &ArpPayload,
        now_ms: u64,
        client_mac: MacAddr,
        held_addr: Option<IpV4Addr>,
    ) -> ArpAction {
        match self.state {
            ArpState::CollisionCheck(c) => {
                // Any reply naming the candidate, or a probe from someone
                // else also targeting it, is a conflict (§4.5).
                if frame.src_ipaddr == c.candidate || frame.dst_ipaddr == c.candidate {
                    if frame.src_mac != client_mac {
                        self.state = ArpState::None;
                        return ArpAction::Done(ArpOutcome::Conflict);
                    }
                }
                ArpAction::None
            }
            ArpState::GwQuery(g) => {
                if frame.src_ipaddr == g.target {
                    self.state = ArpState::Defense;
                    return ArpAction::Done(ArpOutcome::Ok);
                }
                ArpAction::None
            }
            ArpState::GwCheck(g) => {
                if frame.src_ipaddr == g.target {
                    self.state = ArpState::Defense;
                    return ArpAction::Done(ArpOutcome::Ok);
                }
                ArpAction::None
            }
            ArpState::None | ArpState::Defense => {
                let Some(held) = held_addr else {
                    return ArpAction::None;
                };
                if frame.src_ipaddr != held || frame.src_mac == client_mac {
                    return ArpAction::None;
                }
                let cooldown_elapsed = match self.last_conflict_ts {
                    Some(ts) => now_ms.saturating_sub(ts) >= DEFEND_INTERVAL_MS,
                    None => true,
                };
                if cooldown_elapsed || self.relentless_def {
                    self.last_conflict_ts = Some(now_ms);
                    self.total_conflicts += 1;
                    ArpAction::Send(ArpPayload::announce(client_mac, held))
                } else {
                    ArpAction::Done(ArpOutcome::Conflict)
                }
            }
        }
    }

    /// Learned router MAC, if `GW_QUERY`/`GW_CHECK` succeeded; the caller
    /// reads this from the event loop context (`server_arp`/`router_arp`
    /// live on `ClientState`, not here — this machine only decides *when*
    /// to learn it).
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ArpState::None)
    }

    pub fn is_defending(&self) -> bool {
        matches!(self.state, ArpState::Defense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([2, n, n, n, n, n])
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpV4Addr {
        IpV4Addr::new([a, b, c, d])
    }

    #[test]
    fn collision_check_with_no_replies_reports_free() {
        let mut rng = Rng::from_seed(1);
        let mut arp = ArpStateMachine::new(false);
        let client = mac(1);
        let candidate = ip(192, 0, 2, 50);
        arp.begin_collision_check(candidate, 0, &mut rng, 1000, 2000);

        let mut now = arp.next_wake_ts().unwrap();
        let mut sends = 0;
        let mut outcome = None;
        for _ in 0..20 {
            match arp.on_wake(now, client, &mut rng) {
                ArpAction::Send(_) => sends += 1,
                ArpAction::Done(o) => {
                    outcome = Some(o);
                    break;
                }
                ArpAction::None => {}
            }
            if let Some(next) = arp.next_wake_ts() {
                now = next;
            } else {
                break;
            }
        }
        assert_eq!(outcome, Some(ArpOutcome::Free));
        // 3 probes + 2 announces.
        assert_eq!(sends, 5);
    }

    #[test]
    fn conflicting_reply_during_collision_check_is_reported() {
        let mut rng = Rng::from_seed(2);
        let mut arp = ArpStateMachine::new(false);
        let client = mac(1);
        let candidate = ip(192, 0, 2, 50);
        arp.begin_collision_check(candidate, 0, &mut rng, 1000, 2000);

        let conflicting = ArpPayload::new(
            mac(0xAA),
            candidate,
            MacAddr::ANY,
            IpV4Addr::ANY,
            crate::arp::ArpOperation::Response,
        );
        let action = arp.on_packet(&conflicting, 500, client, None);
        assert_eq!(action, ArpAction::Done(ArpOutcome::Conflict));
        assert!(arp.is_idle());
    }

    #[test]
    fn defense_cooldown_requires_ten_seconds_between_defenses() {
        let mut arp = ArpStateMachine::new(false);
        let client = mac(1);
        let held = ip(192, 0, 2, 50);
        let attacker = ArpPayload::new(
            mac(0xBB),
            held,
            MacAddr::ANY,
            held,
            crate::arp::ArpOperation::Response,
        );

        let first = arp.on_packet(&attacker, 0, client, Some(held));
        assert!(matches!(first, ArpAction::Send(_)));

        // Too soon: give up rather than defend again.
        let second = arp.on_packet(&attacker, 5_000, client, Some(held));
        assert_eq!(second, ArpAction::Done(ArpOutcome::Conflict));

        // Ten seconds later: defend again.
        let third = arp.on_packet(&attacker, 10_000, client, Some(held));
        assert!(matches!(third, ArpAction::Send(_)));
        // Only the two defended hits count; the give-up reply in between
        // does not (§4.5: the counter increments "in the defend branch").
        assert_eq!(arp.total_conflicts(), 2);
    }

    #[test]
    fn relentless_defense_ignores_cooldown() {
        let mut arp = ArpStateMachine::new(true);
        let client = mac(1);
        let held = ip(192, 0, 2, 50);
        let attacker = ArpPayload::new(
            mac(0xBB),
            held,
            MacAddr::ANY,
            held,
            crate::arp::ArpOperation::Response,
        );
        let first = arp.on_packet(&attacker, 0, client, Some(held));
        let second = arp.on_packet(&attacker, 1, client, Some(held));
        assert!(matches!(first, ArpAction::Send(_)));
        assert!(matches!(second, ArpAction::Send(_)));
    }

    #[test]
    fn gw_query_exhaustion_marks_unknown_and_moves_to_defense() {
        let mut arp = ArpStateMachine::new(false);
        let client = mac(1);
        let router = ip(192, 0, 2, 1);
        arp.begin_gw_query(router, 0);
        let mut now = 0;
        let mut outcome = None;
        for _ in 0..10 {
            match arp.on_wake(now, client, &mut Rng::from_seed(3)) {
                ArpAction::Done(o) => {
                    outcome = Some(o);
                    break;
                }
                _ => {}
            }
            now = arp.next_wake_ts().unwrap_or(now + 1);
        }
        assert_eq!(outcome, Some(ArpOutcome::GwQueryUnresolved));
        assert!(arp.is_defending());
    }
}
