//! Transport layer: UDP header construction and pseudo-header checksumming.

use crate::ip::IpV4Header;
use crate::IpV4Addr;
use byte_struct::*;

/// UDP datagram header:
///
/// value `[0:1]` source port
///
/// value `[2:3]` destination port
///
/// value `[4:5]` total length in bytes, header + data
///
/// value `[6:7]` checksum over the pseudo-header + header + data
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    /// Pack into a big-endian (network order) byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }
}

/// The 12-byte IPv4 pseudo-header RFC 768 folds into the UDP checksum so
/// that a UDP packet silently routed to the wrong destination is detected.
pub fn pseudo_header_bytes(
    src_ipaddr: IpV4Addr,
    dst_ipaddr: IpV4Addr,
    udp_len: u16,
) -> [u8; 12] {
    let mut buf = [0_u8; 12];
    buf[0..4].copy_from_slice(&src_ipaddr.to_be_bytes());
    buf[4..8].copy_from_slice(&dst_ipaddr.to_be_bytes());
    buf[8] = 0; // reserved
    buf[9] = crate::ip::Protocol::Udp as u8;
    buf[10..12].copy_from_slice(&udp_len.to_be_bytes());
    buf
}

/// Compute the UDP checksum over the pseudo-header, the UDP header (with
/// its checksum field treated as zero) and the payload.
pub fn udp_checksum(
    src_ipaddr: IpV4Addr,
    dst_ipaddr: IpV4Addr,
    header: &UdpHeader,
    payload: &[u8],
) -> u16 {
    let mut header = *header;
    header.checksum = 0;
    let pseudo = pseudo_header_bytes(src_ipaddr, dst_ipaddr, header.length);

    let mut sum = crate::calc_ip_checksum_incomplete(&pseudo);
    sum += crate::calc_ip_checksum_incomplete(&header.to_be_bytes());
    sum += crate::calc_ip_checksum_incomplete(payload);
    crate::calc_ip_checksum_finalize(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_nonzero_for_nonzero_payload() {
        let header = UdpHeader {
            src_port: 68,
            dst_port: 67,
            length: UdpHeader::BYTE_LEN as u16 + 4,
            checksum: 0,
        };
        let checksum = udp_checksum(
            IpV4Addr::ANY,
            IpV4Addr::BROADCAST,
            &header,
            &[1, 2, 3, 4],
        );
        assert_ne!(checksum, 0);
    }

    #[test]
    fn header_round_trips() {
        let header = UdpHeader {
            src_port: 68,
            dst_port: 67,
            length: 308,
            checksum: 0xBEEF,
        };
        assert_eq!(UdpHeader::read_bytes(&header.to_be_bytes()), header);
    }
}
