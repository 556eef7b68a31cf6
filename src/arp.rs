//! Address Resolution Protocol framing for RFC 5227 conflict detection.
//!
//! ARP is not a distinct layer between link and transport, but DHCP clients
//! still need it directly: before accepting a server-assigned address, the
//! client probes for it on the wire (RFC 5227 §2.1), and while the address
//! is held, it watches for other hosts claiming it.

use crate::enet::{EtherType, EthernetHeader};
use crate::{IpV4Addr, MacAddr};
use byte_struct::*;
use static_assertions::const_assert;

/// Minimum Ethernet payload size; frames shorter than this are padded with
/// zero bytes before transmission.
const MIN_ETH_PAYLOAD: usize = 46;

const_assert!(ArpPayload::BYTE_LEN == 28);

/// An ARP request or response for IPv4-over-Ethernet. Hardware type is
/// always 1 (ethernet); protocol type is always IPv4.
///
/// See <https://en.wikipedia.org/wiki/Address_Resolution_Protocol>.
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct ArpPayload {
    /// Hardware type (1 for ethernet).
    pub htype: u16,
    /// Protocol type (same numbering as [`EtherType`]).
    pub ptype: u16,
    /// Hardware address length (6 for standard MAC).
    pub hlen: u8,
    /// Protocol address length (4 for IPv4).
    pub plen: u8,
    /// Request or response.
    pub operation: ArpOperation,
    /// Sender MAC address.
    pub src_mac: MacAddr,
    /// Sender IP address. `0.0.0.0` while probing (RFC 5227 §2.1.1).
    pub src_ipaddr: IpV4Addr,
    /// Target MAC address (ignored/zero in requests).
    pub dst_mac: MacAddr,
    /// Target IP address: the address being resolved, probed, or announced.
    pub dst_ipaddr: IpV4Addr,
}

const HTYPE_ETHER: u16 = 1;
const PTYPE_IPV4: u16 = EtherType::Ipv4 as u16;

impl ArpPayload {
    /// Build a new ARP payload for IPv4-over-Ethernet.
    pub fn new(
        src_mac: MacAddr,
        src_ipaddr: IpV4Addr,
        dst_mac: MacAddr,
        dst_ipaddr: IpV4Addr,
        operation: ArpOperation,
    ) -> Self {
        ArpPayload {
            htype: HTYPE_ETHER,
            ptype: PTYPE_IPV4,
            hlen: 6,
            plen: 4,
            operation,
            src_mac,
            src_ipaddr,
            dst_mac,
            dst_ipaddr,
        }
    }

    /// An RFC 5227 probe: sender IP unspecified, target IP the candidate
    /// address, sent to the broadcast MAC.
    pub fn probe(src_mac: MacAddr, candidate: IpV4Addr) -> Self {
        ArpPayload::new(
            src_mac,
            IpV4Addr::ANY,
            MacAddr::ANY,
            candidate,
            ArpOperation::Request,
        )
    }

    /// A gratuitous announcement: sender and target IP both the held
    /// address, asserting ownership to the whole broadcast domain.
    pub fn announce(src_mac: MacAddr, held: IpV4Addr) -> Self {
        ArpPayload::new(src_mac, held, MacAddr::ANY, held, ArpOperation::Request)
    }

    /// A unicast request for the MAC owning `target` (used for gateway
    /// queries and gateway-reachability pings).
    pub fn request(src_mac: MacAddr, src_ipaddr: IpV4Addr, target: IpV4Addr) -> Self {
        ArpPayload::new(
            src_mac,
            src_ipaddr,
            MacAddr::ANY,
            target,
            ArpOperation::Request,
        )
    }

    /// Validate a received frame per the field-level checks in §4.2: wrong
    /// hardware/protocol type or address lengths mean this is not an
    /// IPv4-over-Ethernet ARP frame, and it should be dropped silently.
    pub fn is_valid(&self) -> bool {
        self.htype == HTYPE_ETHER
            && self.ptype == PTYPE_IPV4
            && self.hlen == 6
            && self.plen == 4
            && !matches!(self.operation, ArpOperation::Unknown(_))
    }

    /// Pack into a big-endian (network order), Ethernet-minimum-padded byte
    /// array ready to follow an [`EthernetHeader`].
    pub fn to_padded_bytes(&self) -> [u8; MIN_ETH_PAYLOAD] {
        let mut bytes = [0_u8; MIN_ETH_PAYLOAD];
        self.write_bytes(&mut bytes[0..Self::BYTE_LEN]);
        bytes
    }

    /// Build the full 60-byte Ethernet frame (header + padded ARP payload,
    /// no trailing FCS — the kernel/NIC appends that) ready for an
    /// `AF_PACKET` socket.
    pub fn to_eth_frame(&self, src_mac: MacAddr, dst_mac: MacAddr) -> [u8; 14 + MIN_ETH_PAYLOAD] {
        let header = EthernetHeader {
            dst_macaddr: dst_mac,
            src_macaddr: src_mac,
            ethertype: EtherType::Arp,
        };
        let mut frame = [0_u8; 14 + MIN_ETH_PAYLOAD];
        frame[0..14].copy_from_slice(&header.to_be_bytes());
        frame[14..].copy_from_slice(&self.to_padded_bytes());
        frame
    }

    /// Parse an ARP payload out of a received Ethernet frame, if the
    /// ethertype and lengths look like one; returns `None` for anything the
    /// decoder should silently drop.
    pub fn from_eth_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < 14 + Self::BYTE_LEN {
            return None;
        }
        let header = EthernetHeader::read_bytes(&frame[0..14]);
        if header.ethertype != EtherType::Arp {
            return None;
        }
        let payload = ArpPayload::read_bytes(&frame[14..14 + Self::BYTE_LEN]);
        if payload.is_valid() {
            Some(payload)
        } else {
            None
        }
    }
}

crate::enum_with_unknown! {
    /// ARP operation code.
    pub enum ArpOperation(u16) {
        /// Resolve `dst_ipaddr`'s MAC, or (with `src_ipaddr` unspecified) probe
        /// for a collision.
        Request = 1,
        /// Reply identifying `src_mac` as the owner of `src_ipaddr`.
        Response = 2,
    }
}

impl ByteStructLen for ArpOperation {
    const BYTE_LEN: usize = 2;
}

impl ByteStruct for ArpOperation {
    fn read_bytes(bytes: &[u8]) -> Self {
        ArpOperation::from(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        let code: u16 = (*self).into();
        bytes[0..2].copy_from_slice(&code.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_round_trips() {
        let mac = MacAddr::new([0x02, 1, 2, 3, 4, 5]);
        let candidate = IpV4Addr::new([192, 0, 2, 50]);
        let payload = ArpPayload::probe(mac, candidate);
        let bytes = payload.to_padded_bytes();
        let parsed = ArpPayload::read_bytes(&bytes[0..ArpPayload::BYTE_LEN]);
        assert_eq!(parsed, payload);
        assert!(parsed.is_valid());
        assert!(parsed.src_ipaddr.is_unspecified());
    }

    #[test]
    fn eth_frame_round_trips_through_parser() {
        let mac = MacAddr::new([0x02, 1, 2, 3, 4, 5]);
        let candidate = IpV4Addr::new([192, 0, 2, 50]);
        let payload = ArpPayload::announce(mac, candidate);
        let frame = payload.to_eth_frame(mac, MacAddr::BROADCAST);
        let parsed = ArpPayload::from_eth_frame(&frame).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn invalid_htype_is_rejected() {
        let mut payload =
            ArpPayload::probe(MacAddr::new([1; 6]), IpV4Addr::new([1, 2, 3, 4]));
        payload.htype = 6; // IEEE 802 token ring, not ethernet
        assert!(!payload.is_valid());
    }

    #[test]
    fn short_frame_is_dropped() {
        assert!(ArpPayload::from_eth_frame(&[0_u8; 10]).is_none());
    }
}
