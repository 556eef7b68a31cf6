//! DHCP message and option encode/decode, per RFC 2131 and RFC 2132.

use crate::{IpV4Addr, MacAddr};
use byte_struct::*;
use std::fmt;

/// Magic cookie identifying the options section as RFC 2132 (vs. plain
/// BOOTP).
pub const DHCP_COOKIE: u32 = 0x63_82_53_63;

/// Size of the fixed-layout portion of a DHCP message, cookie included.
pub const FIXED_HEADER_LEN: usize = 236 + 4;

/// Conventional maximum size of the options buffer this crate builds; large
/// enough for every option set in §3 with room to spare, matching the
/// `options[308]` allowance in the data model.
pub const MAX_OPTIONS_LEN: usize = 308;

/// The "broadcast" bit (bit 15) of the `flags` field: set while the client
/// has no usable unicast address of its own.
pub const FLAG_BROADCAST: u16 = 0x8000;

/// The fixed-layout part of a DHCP message (RFC 2131 §2), excluding the
/// variable-length options section.
///
/// C-ordered, packed, 1-byte aligned: this is wire format, not a Rust-native
/// layout, so every multi-byte field is accessed big-endian via
/// [`ByteStruct`] rather than relied on for its in-memory layout.
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct DhcpFixedHeader {
    /// Message op code: 1 = BOOTREQUEST (client to server), 2 = BOOTREPLY.
    pub op: DhcpOperation,
    /// Hardware type; always 1 for ethernet.
    pub htype: u8,
    /// Hardware address length; always 6 for a standard MAC.
    pub hlen: u8,
    /// Legacy BOOTP relay hop count; always 0 from this client.
    pub hops: u8,
    /// Transaction ID, chosen by the client and echoed by the server.
    pub xid: u32,
    /// Seconds elapsed since the client began the current transaction.
    pub secs: u16,
    /// Flags; only bit 15 ([`FLAG_BROADCAST`]) is defined and used here.
    pub flags: u16,
    /// Client's current IP address; set only in RENEWING/REBINDING.
    pub ciaddr: IpV4Addr,
    /// "Your" IP address: the address offered or assigned to the client.
    pub yiaddr: IpV4Addr,
    /// Next-server IP address; informational, not acted on by this client.
    pub siaddr: IpV4Addr,
    /// Relay agent IP address; informational, not acted on by this client.
    pub giaddr: IpV4Addr,
    /// Client hardware address, left-justified in a 16-byte field.
    pub chaddr: ByteArray16,
    /// Legacy BOOTP server host name field; may carry overloaded options.
    pub sname: ByteArray64,
    /// Legacy BOOTP boot file name field; may carry overloaded options.
    pub file: ByteArray128,
    /// Must equal [`DHCP_COOKIE`] for this to be a DHCP (not plain BOOTP)
    /// message.
    pub cookie: u32,
}

/// `[u8; 16]` wrapper so `chaddr` can derive [`ByteStruct`] inline.
pub type ByteArray16 = crate::ByteArray<16>;
/// `[u8; 64]` wrapper so `sname` can derive [`ByteStruct`] inline.
pub type ByteArray64 = crate::ByteArray<64>;
/// `[u8; 128]` wrapper so `file` can derive [`ByteStruct`] inline.
pub type ByteArray128 = crate::ByteArray<128>;

impl DhcpFixedHeader {
    /// Build a client-to-server (BOOTREQUEST) fixed header with everything
    /// but `chaddr`/`xid`/`flags` zeroed; the caller fills in the rest.
    pub fn new_request(xid: u32, chaddr: MacAddr, broadcast: bool) -> Self {
        let mut chaddr16 = [0_u8; 16];
        chaddr16[0..6].copy_from_slice(&chaddr.0);
        DhcpFixedHeader {
            op: DhcpOperation::BootRequest,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: if broadcast { FLAG_BROADCAST } else { 0 },
            ciaddr: IpV4Addr::ANY,
            yiaddr: IpV4Addr::ANY,
            siaddr: IpV4Addr::ANY,
            giaddr: IpV4Addr::ANY,
            chaddr: ByteArray16::new(chaddr16),
            sname: ByteArray64::new([0; 64]),
            file: ByteArray128::new([0; 128]),
            cookie: DHCP_COOKIE,
        }
    }

    /// Pack into a big-endian (network order) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }
}

crate::enum_with_unknown! {
    /// Legacy BOOTP operation code carried in every DHCP message.
    pub enum DhcpOperation(u8) {
        /// Client to server.
        BootRequest = 1,
        /// Server to client.
        BootReply = 2,
    }
}

impl ByteStructLen for DhcpOperation {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for DhcpOperation {
    fn read_bytes(bytes: &[u8]) -> Self {
        DhcpOperation::from(bytes[0])
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = (*self).into();
    }
}

crate::enum_with_unknown! {
    /// DHCP message type, carried as option 53 ([`DhcpOptionCode::MessageType`]).
    pub enum DhcpMessageType(u8) {
        /// Client broadcast to locate available servers.
        Discover = 1,
        /// Server to client, offering configuration parameters.
        Offer = 2,
        /// Client to server(s): accept an offer, confirm a known address, or
        /// renew/rebind a lease.
        Request = 3,
        /// Client to server: the offered address is already in use.
        Decline = 4,
        /// Server to client: the request is granted.
        Ack = 5,
        /// Server to client: the request is refused.
        Nak = 6,
        /// Client to server: give up the lease early.
        Release = 7,
        /// Client to server: request local parameters only, already has an
        /// address.
        Inform = 8,
    }
}

impl fmt::Display for DhcpMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhcpMessageType::Discover => write!(f, "DISCOVER"),
            DhcpMessageType::Offer => write!(f, "OFFER"),
            DhcpMessageType::Request => write!(f, "REQUEST"),
            DhcpMessageType::Decline => write!(f, "DECLINE"),
            DhcpMessageType::Ack => write!(f, "ACK"),
            DhcpMessageType::Nak => write!(f, "NAK"),
            DhcpMessageType::Release => write!(f, "RELEASE"),
            DhcpMessageType::Inform => write!(f, "INFORM"),
            DhcpMessageType::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

crate::enum_with_unknown! {
    /// DHCP/BOOTP option codes this crate recognizes. Every other code is
    /// preserved in the decoded option list as `Unknown(code)` but never
    /// acted on.
    pub enum DhcpOptionCode(u8) {
        /// Padding; not a real option, just a one-byte filler.
        Pad = 0,
        /// Subnet mask.
        SubnetMask = 1,
        /// UTC offset in seconds (deprecated timezone field, still used by
        /// the config applier's `tzone` key).
        TimeOffset = 2,
        /// Default gateway(s).
        Router = 3,
        /// DNS server(s).
        DomainNameServers = 6,
        /// LPR print server(s).
        LprServer = 9,
        /// Client host name.
        HostName = 12,
        /// Local domain name.
        DomainName = 15,
        /// Broadcast address.
        BroadcastAddress = 28,
        /// Default IP TTL.
        DefaultIpTtl = 23,
        /// Interface MTU.
        InterfaceMtu = 26,
        /// NTP server(s).
        NtpServers = 42,
        /// NetBIOS (WINS) name server(s).
        NetBiosNameServer = 44,
        /// Client's requested address (in DISCOVER/REQUEST).
        RequestedIpAddress = 50,
        /// Lease duration in seconds.
        IpAddressLeaseTime = 51,
        /// Option-overload: bits indicate `file`/`sname` carry more options.
        OptionOverload = 52,
        /// DHCP message type; see [`DhcpMessageType`].
        MessageType = 53,
        /// Server identifier (the server's own address).
        ServerIdentifier = 54,
        /// Parameter request list sent by the client.
        ParameterRequestList = 55,
        /// Human-readable error message from the server (on NAK).
        Message = 56,
        /// Maximum DHCP message size the client will accept.
        MaxDhcpMessageSize = 57,
        /// T1, renewal time.
        RenewalTime = 58,
        /// T2, rebinding time.
        RebindingTime = 59,
        /// Vendor class identifier.
        VendorClassId = 60,
        /// Client identifier.
        ClientId = 61,
        /// Marks the end of the options list.
        End = 255,
    }
}

/// Option-overload bit values (option 52's single data byte).
pub mod overload {
    /// The `file` field carries additional options.
    pub const FILE: u8 = 1;
    /// The `sname` field carries additional options.
    pub const SNAME: u8 = 2;
    /// Both `file` and `sname` carry additional options.
    pub const BOTH: u8 = 3;
}

/// One decoded `(code, data)` option. Length is implicit in `data.len()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: DhcpOptionCode,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: DhcpOptionCode, data: Vec<u8>) -> Self {
        DhcpOption { code, data }
    }

    /// Convenience constructor for single-`u8` options.
    pub fn u8(code: DhcpOptionCode, value: u8) -> Self {
        DhcpOption::new(code, vec![value])
    }

    /// Convenience constructor for single-`u32` options (big-endian).
    pub fn u32(code: DhcpOptionCode, value: u32) -> Self {
        DhcpOption::new(code, value.to_be_bytes().to_vec())
    }

    /// Convenience constructor for a single IPv4 address option.
    pub fn ipv4(code: DhcpOptionCode, addr: IpV4Addr) -> Self {
        DhcpOption::new(code, addr.to_be_bytes().to_vec())
    }

    /// Convenience constructor for a list of IPv4 addresses.
    pub fn ipv4_list(code: DhcpOptionCode, addrs: &[IpV4Addr]) -> Self {
        let mut data = Vec::with_capacity(addrs.len() * 4);
        for a in addrs {
            data.extend_from_slice(&a.to_be_bytes());
        }
        DhcpOption::new(code, data)
    }

    /// Interpret `data` as a big-endian `u32`, if it is exactly 4 bytes.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.clone().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Interpret `data` as a single IPv4 address, if it is exactly 4 bytes.
    pub fn as_ipv4(&self) -> Option<IpV4Addr> {
        let bytes: [u8; 4] = self.data.clone().try_into().ok()?;
        Some(IpV4Addr::new(bytes))
    }

    /// Interpret `data` as a list of IPv4 addresses (length a multiple of
    /// 4); malformed lengths yield an empty list rather than an error, per
    /// the decoder's "discard and continue" hardening policy.
    pub fn as_ipv4_list(&self) -> Vec<IpV4Addr> {
        if self.data.is_empty() || self.data.len() % 4 != 0 {
            return Vec::new();
        }
        self.data
            .chunks_exact(4)
            .map(|c| IpV4Addr::new([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// A full DHCP message: fixed header plus decoded options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpMessage {
    pub header: DhcpFixedHeader,
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    /// Build a new client request message with no options set yet.
    pub fn new_request(xid: u32, chaddr: MacAddr, broadcast: bool) -> Self {
        DhcpMessage {
            header: DhcpFixedHeader::new_request(xid, chaddr, broadcast),
            options: Vec::new(),
        }
    }

    /// Look up the first option with the given code.
    pub fn option(&self, code: DhcpOptionCode) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    /// The message type carried in option 53, if present and well-formed.
    pub fn message_type(&self) -> Option<DhcpMessageType> {
        let opt = self.option(DhcpOptionCode::MessageType)?;
        let byte = *opt.data.first()?;
        Some(DhcpMessageType::from(byte))
    }

    /// Push an option, replacing any existing option of the same code (last
    /// write wins, matching the decoder's duplicate-code rule so that
    /// mutating a message built from a decoded one stays consistent).
    pub fn set_option(&mut self, option: DhcpOption) {
        if let Some(existing) = self.options.iter_mut().find(|o| o.code == option.code) {
            *existing = option;
        } else {
            self.options.push(option);
        }
    }

    /// Encode the fixed header and options into a single buffer: header,
    /// then options (each `code, len, data`), then `END`. The raw/UDP
    /// framing layers are responsible for padding to a minimum frame size
    /// if their medium requires it.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + MAX_OPTIONS_LEN);
        buf.extend_from_slice(&self.header.to_be_bytes());
        for opt in &self.options {
            if opt.code == DhcpOptionCode::Pad || opt.code == DhcpOptionCode::End {
                continue;
            }
            let code: u8 = opt.code.into();
            let len = opt.data.len().min(u8::MAX as usize) as u8;
            buf.push(code);
            buf.push(len);
            buf.extend_from_slice(&opt.data[0..len as usize]);
        }
        buf.push(DhcpOptionCode::End.into());
        buf
    }

    /// Decode a DHCP message from a buffer containing the fixed header
    /// followed by the options section (`options`/`file`/`sname`
    /// option-overload chaining is resolved automatically; see §4.1).
    ///
    /// Returns `None` if the buffer is too short for the fixed header or
    /// the magic cookie doesn't match — this is not a DHCP message at all,
    /// as opposed to the option-scan hardening below, which discards
    /// individual malformed *options* but always returns a message.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return None;
        }
        let header = DhcpFixedHeader::read_bytes(&buf[0..FIXED_HEADER_LEN]);
        if header.cookie != DHCP_COOKIE {
            return None;
        }

        let mut options = Vec::new();
        let mut overload_seen: Option<u8> = None;

        scan_options(&buf[FIXED_HEADER_LEN..], &mut options, &mut overload_seen);

        if let Some(bits) = overload_seen {
            if bits & overload::FILE != 0 {
                scan_options(&header.file.0, &mut options, &mut None);
            }
            if bits & overload::SNAME != 0 {
                scan_options(&header.sname.0, &mut options, &mut None);
            }
        }

        Some(DhcpMessage { header, options })
    }
}

/// Scan one options region, honoring PAD/END and recording the
/// option-overload byte (if any) into `overload_seen` for the caller to act
/// on once this region's scan is complete. Malformed lengths discard just
/// that option and keep scanning, per §4.1's hardening rules; duplicate
/// codes keep the last occurrence.
fn scan_options(region: &[u8], out: &mut Vec<DhcpOption>, overload_seen: &mut Option<u8>) {
    let mut i = 0;
    while i < region.len() {
        let code = region[i];
        if code == DhcpOptionCode::Pad.into() {
            i += 1;
            continue;
        }
        if code == DhcpOptionCode::End.into() {
            return;
        }
        if i + 1 >= region.len() {
            log::warn!("dhcp option {code} truncated (no length byte); discarding rest of region");
            return;
        }
        let len = region[i + 1] as usize;
        let data_start = i + 2;
        let data_end = data_start + len;
        if data_end > region.len() {
            log::warn!(
                "dhcp option {code} claims length {len} but only {} bytes remain; discarding",
                region.len().saturating_sub(data_start)
            );
            return;
        }
        let data = region[data_start..data_end].to_vec();
        let kind = DhcpOptionCode::from(code);
        if kind == DhcpOptionCode::OptionOverload {
            if let Some(&bits) = data.first() {
                *overload_seen = Some(bits);
            }
        }
        let option = DhcpOption::new(kind, data);
        if let Some(existing) = out.iter_mut().find(|o| o.code == kind) {
            *existing = option;
        } else {
            out.push(option);
        }
        i = data_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offer(xid: u32) -> DhcpMessage {
        let mut msg = DhcpMessage::new_request(xid, MacAddr::new([2, 1, 2, 3, 4, 5]), true);
        msg.header.op = DhcpOperation::BootReply;
        msg.header.yiaddr = IpV4Addr::new([192, 0, 2, 50]);
        msg.set_option(DhcpOption::u8(DhcpOptionCode::MessageType, DhcpMessageType::Offer.into()));
        msg.set_option(DhcpOption::ipv4(
            DhcpOptionCode::ServerIdentifier,
            IpV4Addr::new([192, 0, 2, 1]),
        ));
        msg.set_option(DhcpOption::u32(DhcpOptionCode::IpAddressLeaseTime, 3600));
        msg.set_option(DhcpOption::ipv4(
            DhcpOptionCode::SubnetMask,
            IpV4Addr::new([255, 255, 255, 0]),
        ));
        msg.set_option(DhcpOption::ipv4_list(
            DhcpOptionCode::DomainNameServers,
            &[IpV4Addr::new([8, 8, 8, 8]), IpV4Addr::new([1, 1, 1, 1])],
        ));
        msg
    }

    #[test]
    fn round_trip_preserves_option_multiset() {
        let msg = sample_offer(0xA1B2C3D4);
        let encoded = msg.encode();
        let decoded = DhcpMessage::decode(&encoded).unwrap();

        let mut expected: Vec<_> = msg.options.iter().map(|o| o.code).collect();
        let mut actual: Vec<_> = decoded.options.iter().map(|o| o.code).collect();
        expected.sort_by_key(|c| u8::from(*c));
        actual.sort_by_key(|c| u8::from(*c));
        assert_eq!(expected, actual);
        assert_eq!(decoded.header.xid, 0xA1B2C3D4);
        assert_eq!(decoded.message_type(), Some(DhcpMessageType::Offer));
    }

    #[test]
    fn lease_time_round_trips_exactly() {
        let msg = sample_offer(1);
        let decoded = DhcpMessage::decode(&msg.encode()).unwrap();
        let lease = decoded
            .option(DhcpOptionCode::IpAddressLeaseTime)
            .unwrap()
            .as_u32()
            .unwrap();
        assert_eq!(lease, 3600);
    }

    #[test]
    fn option_overload_chains_file_and_sname_exactly_once() {
        let mut msg = sample_offer(2);
        // Simulate a server that put the domain name into `file` and the
        // NTP server list into `sname`, flagged via option 52.
        let mut file = [0_u8; 128];
        file[0] = DhcpOptionCode::DomainName.into();
        file[1] = 7;
        file[2..9].copy_from_slice(b"example");
        file[9] = DhcpOptionCode::End.into();
        msg.header.file = ByteArray128::new(file);

        let mut sname = [0_u8; 64];
        sname[0] = DhcpOptionCode::NtpServers.into();
        sname[1] = 4;
        sname[2..6].copy_from_slice(&[129, 6, 15, 28]);
        sname[6] = DhcpOptionCode::End.into();
        msg.header.sname = ByteArray64::new(sname);

        msg.set_option(DhcpOption::u8(DhcpOptionCode::OptionOverload, overload::BOTH));

        let decoded = DhcpMessage::decode(&msg.encode()).unwrap();
        assert_eq!(
            decoded.option(DhcpOptionCode::DomainName).unwrap().data,
            b"example"
        );
        assert_eq!(
            decoded
                .option(DhcpOptionCode::NtpServers)
                .unwrap()
                .as_ipv4()
                .unwrap(),
            IpV4Addr::new([129, 6, 15, 28])
        );
        // Appears exactly once even though decode() scans options, file,
        // and sname as three separate regions.
        assert_eq!(
            decoded
                .options
                .iter()
                .filter(|o| o.code == DhcpOptionCode::DomainName)
                .count(),
            1
        );
    }

    #[test]
    fn truncated_option_is_discarded_without_panicking() {
        let msg = sample_offer(3);
        let mut encoded = msg.encode();
        let pos = encoded
            .windows(2)
            .position(|w| w[0] == DhcpOptionCode::IpAddressLeaseTime.into())
            .unwrap();
        encoded[pos + 1] = 0xFF;
        let decoded = DhcpMessage::decode(&encoded).unwrap();
        assert!(decoded.option(DhcpOptionCode::IpAddressLeaseTime).is_none());
    }

    #[test]
    fn duplicate_option_code_keeps_last() {
        let mut msg = DhcpMessage::new_request(4, MacAddr::new([2; 6]), true);
        msg.set_option(DhcpOption::u8(DhcpOptionCode::DefaultIpTtl, 32));
        let mut encoded = msg.encode();
        let end_pos = encoded.len() - 1;
        encoded.truncate(end_pos);
        encoded.extend_from_slice(&[DhcpOptionCode::DefaultIpTtl.into(), 1, 64]);
        encoded.push(DhcpOptionCode::End.into());

        let decoded = DhcpMessage::decode(&encoded).unwrap();
        assert_eq!(
            decoded.option(DhcpOptionCode::DefaultIpTtl).unwrap().data,
            vec![64]
        );
    }

    #[test]
    fn non_dhcp_cookie_is_rejected() {
        let mut encoded = sample_offer(5).encode();
        encoded[236] = 0; // stomp the cookie
        assert!(DhcpMessage::decode(&encoded).is_none());
    }
}
