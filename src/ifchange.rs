//! Config-applier client (C8): formats lease decisions as the flat text
//! command stream §4.8 defines and tracks the single-outstanding-batch
//! discipline §6 requires.
//!
//! Grounded directly in the original's `ifchange.c`: each `send_cmd`/
//! `send_client_ip` there becomes a `push_*` method here, diffing against
//! the previously-applied packet exactly the way `cfg_packet` does, and
//! `cs->ifchWorking` becomes [`IfChangeClient::busy`].

use std::net::Ipv4Addr;

use crate::dhcp::{DhcpMessage, DhcpOptionCode};
use crate::DhcpError;

/// Fallback subnet mask when the server doesn't send option 1 (§4.8).
const CLASS_C_SUBNET: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Builds and tracks the outbound command batch for one lease decision.
/// Does not itself own the pipe fd — the event loop writes
/// [`IfChangeClient::take_batch`]'s output and calls
/// [`IfChangeClient::mark_sent`]/[`IfChangeClient::ack`] to manage the
/// busy flag.
pub struct IfChangeClient {
    busy: bool,
}

impl IfChangeClient {
    pub fn new() -> Self {
        IfChangeClient { busy: false }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Mark a batch as outstanding; fails if one is already in flight
    /// (§6: "overlapping sends are forbidden").
    pub fn mark_sent(&mut self) -> Result<(), DhcpError> {
        if self.busy {
            return Err(DhcpError::IfchangeBusy);
        }
        self.busy = true;
        Ok(())
    }

    /// Called on receipt of the `'+'` ack byte (§6).
    pub fn ack(&mut self) {
        self.busy = false;
    }

    /// Build the deconfigure batch (§4.8: `ip4:0.0.0.0,255.255.255.255;`).
    pub fn deconfigure_batch(&self) -> String {
        "ip4:0.0.0.0,255.255.255.255;".to_string()
    }

    /// Build the batch of commands needed to move from `previous` (if any)
    /// to `current`, diffing field-by-field so unchanged values are not
    /// re-sent (§4.8). Returns an empty string if nothing changed.
    pub fn bind_batch(&self, current: &DhcpMessage, previous: Option<&DhcpMessage>) -> String {
        let mut out = String::new();
        push_ip4(&mut out, current, previous);
        push_ip_opt(&mut out, "routr", DhcpOptionCode::Router, current, previous);
        push_iplist_opt(&mut out, "dns", DhcpOptionCode::DomainNameServers, current, previous);
        push_iplist_opt(&mut out, "lpr", DhcpOptionCode::LprServer, current, previous);
        push_iplist_opt(&mut out, "ntp", DhcpOptionCode::NtpServers, current, previous);
        push_iplist_opt(&mut out, "wins", DhcpOptionCode::NetBiosNameServer, current, previous);
        push_bytes_opt(&mut out, "host", DhcpOptionCode::HostName, current, previous);
        push_bytes_opt(&mut out, "dom", DhcpOptionCode::DomainName, current, previous);
        push_s32_opt(&mut out, "tzone", DhcpOptionCode::TimeOffset, current, previous);
        push_u16_opt(&mut out, "mtu", DhcpOptionCode::InterfaceMtu, current, previous);
        push_u8_opt(&mut out, "ipttl", DhcpOptionCode::DefaultIpTtl, current, previous);
        out
    }
}

impl Default for IfChangeClient {
    fn default() -> Self {
        Self::new()
    }
}

fn opt_bytes<'a>(msg: &'a DhcpMessage, code: DhcpOptionCode) -> Option<&'a [u8]> {
    msg.option(code).map(|o| o.data.as_slice())
}

fn changed(current: Option<&[u8]>, previous: Option<&[u8]>) -> bool {
    current.is_some() && current != previous
}

fn push_ip4(out: &mut String, current: &DhcpMessage, previous: Option<&DhcpMessage>) {
    let ip_changed = current.header.yiaddr != previous.map(|p| p.header.yiaddr).unwrap_or(current.header.yiaddr)
        || previous.is_none();
    let subnet = opt_bytes(current, DhcpOptionCode::SubnetMask);
    let prev_subnet = previous.and_then(|p| opt_bytes(p, DhcpOptionCode::SubnetMask));
    let broadcast = opt_bytes(current, DhcpOptionCode::BroadcastAddress);
    let prev_broadcast = previous.and_then(|p| opt_bytes(p, DhcpOptionCode::BroadcastAddress));

    if !ip_changed && !changed(subnet, prev_subnet) && !changed(broadcast, prev_broadcast) {
        return;
    }

    let ip: Ipv4Addr = current.header.yiaddr.into();
    let subnet_ip = match subnet {
        Some(bytes) if bytes.len() == 4 => Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
        _ => {
            log::warn!("server did not send a subnet mask; assuming class C ({CLASS_C_SUBNET})");
            CLASS_C_SUBNET
        }
    };

    out.push_str("ip4:");
    out.push_str(&ip.to_string());
    out.push(',');
    out.push_str(&subnet_ip.to_string());
    if let Some(bytes) = broadcast {
        if bytes.len() == 4 {
            out.push(',');
            out.push_str(&Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string());
        }
    }
    out.push(';');
}

fn push_ip_opt(
    out: &mut String,
    key: &str,
    code: DhcpOptionCode,
    current: &DhcpMessage,
    previous: Option<&DhcpMessage>,
) {
    let cur = opt_bytes(current, code);
    let prev = previous.and_then(|p| opt_bytes(p, code));
    if !changed(cur, prev) {
        return;
    }
    if let Some(bytes) = cur {
        if bytes.len() == 4 {
            out.push_str(key);
            out.push(':');
            out.push_str(&Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string());
            out.push(';');
        }
    }
}

fn push_iplist_opt(
    out: &mut String,
    key: &str,
    code: DhcpOptionCode,
    current: &DhcpMessage,
    previous: Option<&DhcpMessage>,
) {
    let cur = opt_bytes(current, code);
    let prev = previous.and_then(|p| opt_bytes(p, code));
    if !changed(cur, prev) {
        return;
    }
    let Some(bytes) = cur else { return };
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return;
    }
    out.push_str(key);
    out.push(':');
    let addrs: Vec<String> = bytes
        .chunks_exact(4)
        .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]).to_string())
        .collect();
    out.push_str(&addrs.join(","));
    out.push(';');
}

fn push_bytes_opt(
    out: &mut String,
    key: &str,
    code: DhcpOptionCode,
    current: &DhcpMessage,
    previous: Option<&DhcpMessage>,
) {
    let cur = opt_bytes(current, code);
    let prev = previous.and_then(|p| opt_bytes(p, code));
    if !changed(cur, prev) {
        return;
    }
    if let Some(bytes) = cur {
        out.push_str(key);
        out.push(':');
        out.push_str(&String::from_utf8_lossy(bytes));
        out.push(';');
    }
}

fn push_s32_opt(
    out: &mut String,
    key: &str,
    code: DhcpOptionCode,
    current: &DhcpMessage,
    previous: Option<&DhcpMessage>,
) {
    let cur = opt_bytes(current, code);
    let prev = previous.and_then(|p| opt_bytes(p, code));
    if !changed(cur, prev) {
        return;
    }
    if let Some(bytes) = cur {
        if bytes.len() == 4 {
            let v = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            out.push_str(key);
            out.push(':');
            out.push_str(&v.to_string());
            out.push(';');
        }
    }
}

fn push_u16_opt(
    out: &mut String,
    key: &str,
    code: DhcpOptionCode,
    current: &DhcpMessage,
    previous: Option<&DhcpMessage>,
) {
    let cur = opt_bytes(current, code);
    let prev = previous.and_then(|p| opt_bytes(p, code));
    if !changed(cur, prev) {
        return;
    }
    if let Some(bytes) = cur {
        if bytes.len() == 2 {
            let v = u16::from_be_bytes([bytes[0], bytes[1]]);
            out.push_str(key);
            out.push(':');
            out.push_str(&v.to_string());
            out.push(';');
        }
    }
}

fn push_u8_opt(
    out: &mut String,
    key: &str,
    code: DhcpOptionCode,
    current: &DhcpMessage,
    previous: Option<&DhcpMessage>,
) {
    let cur = opt_bytes(current, code);
    let prev = previous.and_then(|p| opt_bytes(p, code));
    if !changed(cur, prev) {
        return;
    }
    if let Some(bytes) = cur {
        if let Some(&v) = bytes.first() {
            out.push_str(key);
            out.push(':');
            out.push_str(&v.to_string());
            out.push(';');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::{DhcpMessageType, DhcpOption};
    use crate::{IpV4Addr, MacAddr};

    fn ack_with_options() -> DhcpMessage {
        let mut msg = DhcpMessage::new_request(1, MacAddr::new([2; 6]), true);
        msg.header.yiaddr = IpV4Addr::new([192, 0, 2, 50]);
        msg.set_option(DhcpOption::u8(DhcpOptionCode::MessageType, DhcpMessageType::Ack.into()));
        msg.set_option(DhcpOption::ipv4(DhcpOptionCode::SubnetMask, IpV4Addr::new([255, 255, 255, 0])));
        msg.set_option(DhcpOption::ipv4(DhcpOptionCode::Router, IpV4Addr::new([192, 0, 2, 1])));
        msg.set_option(DhcpOption::ipv4_list(
            DhcpOptionCode::DomainNameServers,
            &[IpV4Addr::new([8, 8, 8, 8]), IpV4Addr::new([1, 1, 1, 1])],
        ));
        msg
    }

    #[test]
    fn s1_happy_path_produces_expected_command_stream() {
        let client = IfChangeClient::new();
        let msg = ack_with_options();
        let batch = client.bind_batch(&msg, None);
        assert_eq!(
            batch,
            "ip4:192.0.2.50,255.255.255.0;routr:192.0.2.1;dns:8.8.8.8,1.1.1.1;"
        );
    }

    #[test]
    fn s4_renew_with_no_changes_produces_empty_diff() {
        let client = IfChangeClient::new();
        let msg = ack_with_options();
        let batch = client.bind_batch(&msg, Some(&msg));
        assert_eq!(batch, "");
    }

    #[test]
    fn missing_subnet_falls_back_to_class_c() {
        let client = IfChangeClient::new();
        let mut msg = DhcpMessage::new_request(1, MacAddr::new([2; 6]), true);
        msg.header.yiaddr = IpV4Addr::new([10, 0, 0, 5]);
        let batch = client.bind_batch(&msg, None);
        assert_eq!(batch, "ip4:10.0.0.5,255.255.255.0;");
    }

    #[test]
    fn deconfigure_batch_is_fixed() {
        let client = IfChangeClient::new();
        assert_eq!(client.deconfigure_batch(), "ip4:0.0.0.0,255.255.255.255;");
    }

    #[test]
    fn overlapping_sends_are_rejected() {
        let mut client = IfChangeClient::new();
        client.mark_sent().unwrap();
        assert!(matches!(client.mark_sent(), Err(DhcpError::IfchangeBusy)));
        client.ack();
        assert!(client.mark_sent().is_ok());
    }
}
