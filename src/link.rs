//! Link observer (C7): turns kernel `NETLINK_ROUTE` notifications into the
//! four link-state inputs the DHCP/ARP machines react to.
//!
//! Grounded directly in the original's `netlink.c`: an `RTM_GETLINK` dump at
//! startup locates the interface by name and reads its MAC out of
//! `IFLA_ADDRESS`, then `RTM_NEWLINK`/`RTM_DELLINK` deltas are translated
//! into [`LinkEvent`]s by watching the `IFF_UP`/`IFF_RUNNING` flag bits.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    bind, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};

use crate::state::LinkState;
use crate::{DhcpError, MacAddr};

/// One link-state transition delivered to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
    Shut,
    Removed,
}

/// A `NETLINK_ROUTE`/`RTMGRP_LINK` observer for one named interface.
pub struct LinkObserver {
    fd: OwnedFd,
    interface: String,
    ifindex: Option<i32>,
    prev_state: LinkState,
}

const RTMGRP_LINK: u32 = 1;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const NLM_F_REQUEST: u16 = 1;
const NLM_F_ROOT: u16 = 0x100;
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFF_UP: u32 = 0x1;
const IFF_RUNNING: u32 = 0x40;

#[repr(C)]
struct NlMsgHdr {
    len: u32,
    nlmsg_type: u16,
    flags: u16,
    seq: u32,
    pid: u32,
}

#[repr(C)]
struct IfInfoMsg {
    family: u8,
    _pad: u8,
    iftype: u16,
    index: i32,
    flags: u32,
    change: u32,
}

impl LinkObserver {
    /// Open the netlink socket and join `RTMGRP_LINK`. Does not yet know
    /// the interface's index or MAC; call [`LinkObserver::dump_links`] to
    /// learn them.
    pub fn open(interface: &str) -> Result<Self, DhcpError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkRoute,
        )
        .map_err(DhcpError::from)?;
        let addr = NetlinkAddr::new(0, RTMGRP_LINK);
        bind(fd.as_raw_fd(), &addr).map_err(DhcpError::from)?;
        Ok(LinkObserver {
            fd,
            interface: interface.to_string(),
            ifindex: None,
            prev_state: LinkState::Up,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// `RTM_GETLINK` with `NLM_F_ROOT`: dump every interface. The caller
    /// should then drain replies via [`LinkObserver::poll`] until `ifindex`
    /// and the MAC are known.
    pub fn request_dump(&self) -> Result<(), DhcpError> {
        let mut buf = [0_u8; 32];
        let hdr = NlMsgHdr {
            len: 32,
            nlmsg_type: RTM_GETLINK,
            flags: NLM_F_REQUEST | NLM_F_ROOT,
            seq: 1,
            pid: 0,
        };
        write_hdr(&mut buf, &hdr);
        send(self.fd.as_raw_fd(), &buf, MsgFlags::empty())
            .map(|_| ())
            .or_else(|e| if e == nix::Error::EAGAIN { Ok(()) } else { Err(e) })
            .map_err(DhcpError::from)?;
        Ok(())
    }

    /// Drain pending netlink messages, returning every link-state change
    /// they imply for our interface (§4.7). Returns an empty vec on
    /// `EAGAIN` (nothing pending).
    pub fn poll(&mut self) -> Result<Vec<LinkEvent>, DhcpError> {
        let mut events = Vec::new();
        let mut buf = [0_u8; 8192];
        loop {
            let n = match recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(n) => n,
                Err(nix::Error::EAGAIN) => break,
                Err(e) => return Err(DhcpError::from(e)),
            };
            self.process_messages(&buf[..n], &mut events);
        }
        Ok(events)
    }

    fn process_messages(&mut self, buf: &[u8], out: &mut Vec<LinkEvent>) {
        let mut offset = 0;
        while offset + std::mem::size_of::<NlMsgHdr>() <= buf.len() {
            let hdr = read_hdr(&buf[offset..]);
            if hdr.len < std::mem::size_of::<NlMsgHdr>() as u32 {
                break;
            }
            let msg_end = (offset + hdr.len as usize).min(buf.len());
            let body = &buf[offset + std::mem::size_of::<NlMsgHdr>()..msg_end];

            match hdr.nlmsg_type {
                RTM_NEWLINK => self.handle_newlink(body, out),
                RTM_DELLINK => self.handle_dellink(body, out),
                _ => {}
            }
            offset = msg_end;
            if hdr.len == 0 {
                break;
            }
        }
    }

    fn handle_newlink(&mut self, body: &[u8], out: &mut Vec<LinkEvent>) {
        if body.len() < std::mem::size_of::<IfInfoMsg>() {
            return;
        }
        let ifm = read_ifinfo(body);
        let attrs = &body[std::mem::size_of::<IfInfoMsg>()..];

        if self.ifindex.is_none() {
            if let Some(name) = find_attr_str(attrs, IFLA_IFNAME) {
                if name == self.interface {
                    self.ifindex = Some(ifm.index);
                    if let Some(mac) = find_attr_bytes(attrs, IFLA_ADDRESS) {
                        if mac.len() == 6 {
                            let mut m = [0_u8; 6];
                            m.copy_from_slice(mac);
                            log::info!("{} hardware address {}", self.interface, MacAddr::new(m));
                        }
                    }
                }
            }
        }

        if self.ifindex != Some(ifm.index) {
            return;
        }

        let new_state = if ifm.flags & IFF_UP != 0 {
            if ifm.flags & IFF_RUNNING != 0 {
                LinkState::Up
            } else {
                LinkState::Down
            }
        } else {
            LinkState::Shut
        };

        if new_state != self.prev_state {
            self.prev_state = new_state;
            out.push(match new_state {
                LinkState::Up => LinkEvent::Up,
                LinkState::Down => LinkEvent::Down,
                LinkState::Shut => LinkEvent::Shut,
                LinkState::Removed => LinkEvent::Removed,
            });
        }
    }

    fn handle_dellink(&mut self, body: &[u8], out: &mut Vec<LinkEvent>) {
        if body.len() < std::mem::size_of::<IfInfoMsg>() {
            return;
        }
        let ifm = read_ifinfo(body);
        if self.ifindex != Some(ifm.index) {
            return;
        }
        if self.prev_state != LinkState::Removed {
            self.prev_state = LinkState::Removed;
            out.push(LinkEvent::Removed);
        }
    }

    /// Learned hardware (MAC) address, once a matching `RTM_NEWLINK` has
    /// been processed.
    pub fn ifindex(&self) -> Option<i32> {
        self.ifindex
    }
}

fn write_hdr(buf: &mut [u8], hdr: &NlMsgHdr) {
    buf[0..4].copy_from_slice(&hdr.len.to_ne_bytes());
    buf[4..6].copy_from_slice(&hdr.nlmsg_type.to_ne_bytes());
    buf[6..8].copy_from_slice(&hdr.flags.to_ne_bytes());
    buf[8..12].copy_from_slice(&hdr.seq.to_ne_bytes());
    buf[12..16].copy_from_slice(&hdr.pid.to_ne_bytes());
}

fn read_hdr(buf: &[u8]) -> NlMsgHdr {
    NlMsgHdr {
        len: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
        nlmsg_type: u16::from_ne_bytes(buf[4..6].try_into().unwrap()),
        flags: u16::from_ne_bytes(buf[6..8].try_into().unwrap()),
        seq: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        pid: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
    }
}

fn read_ifinfo(buf: &[u8]) -> IfInfoMsg {
    IfInfoMsg {
        family: buf[0],
        _pad: buf[1],
        iftype: u16::from_ne_bytes(buf[2..4].try_into().unwrap()),
        index: i32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        flags: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        change: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
    }
}

/// Walk a netlink attribute (`rtattr`) list looking for `wanted_type`,
/// returning its raw payload bytes.
fn find_attr_bytes(mut buf: &[u8], wanted_type: u16) -> Option<&[u8]> {
    while buf.len() >= 4 {
        let len = u16::from_ne_bytes(buf[0..2].try_into().ok()?) as usize;
        let attr_type = u16::from_ne_bytes(buf[2..4].try_into().ok()?);
        if len < 4 || len > buf.len() {
            return None;
        }
        let payload = &buf[4..len];
        if attr_type == wanted_type {
            return Some(payload);
        }
        let aligned = (len + 3) & !3;
        if aligned > buf.len() {
            return None;
        }
        buf = &buf[aligned..];
    }
    None
}

fn find_attr_str(buf: &[u8], wanted_type: u16) -> Option<String> {
    let bytes = find_attr_bytes(buf, wanted_type)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_attr_locates_ifname() {
        // One rtattr: len=4+5=9 -> aligned to 12, type=IFLA_IFNAME, "eth0\0"
        let mut buf = vec![];
        buf.extend_from_slice(&9_u16.to_ne_bytes());
        buf.extend_from_slice(&IFLA_IFNAME.to_ne_bytes());
        buf.extend_from_slice(b"eth0\0");
        buf.extend_from_slice(&[0, 0, 0]); // alignment padding
        let name = find_attr_str(&buf, IFLA_IFNAME).unwrap();
        assert_eq!(name, "eth0");
    }

    #[test]
    fn find_attr_returns_none_for_missing_type() {
        let mut buf = vec![];
        buf.extend_from_slice(&9_u16.to_ne_bytes());
        buf.extend_from_slice(&IFLA_IFNAME.to_ne_bytes());
        buf.extend_from_slice(b"eth0\0");
        buf.extend_from_slice(&[0, 0, 0]);
        assert!(find_attr_bytes(&buf, IFLA_ADDRESS).is_none());
    }
}
