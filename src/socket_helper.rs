//! Raw-socket helper client (A5): receives an already-bound `AF_PACKET`
//! file descriptor over SCM_RIGHTS, per §6.
//!
//! The helper process itself (the half holding `CAP_NET_RAW`) is out of
//! scope (§1); this is only the unprivileged side of the handoff — connect
//! to the already-open unix socket, write the one-byte request, and unwrap
//! the ancillary data.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoSliceMut;

use crate::DhcpError;

/// Request byte meaning "hand me the raw/ARP socket for my interface"
/// (§6).
const REQUEST_RAW_SOCKET: u8 = b'r';

/// Client side of the SCM_RIGHTS handoff.
pub struct SocketHelperClient {
    stream: UnixStream,
}

impl SocketHelperClient {
    /// Connect to the helper's already-listening unix socket at `path`.
    pub fn connect(path: &str) -> Result<Self, DhcpError> {
        let stream = UnixStream::connect(path).map_err(DhcpError::Io)?;
        Ok(SocketHelperClient { stream })
    }

    /// Ask the helper for a raw socket and block until it arrives.
    ///
    /// The helper is expected to reply with one dummy data byte carrying an
    /// SCM_RIGHTS control message holding exactly one file descriptor.
    pub fn request_raw_socket(&self) -> Result<OwnedFd, DhcpError> {
        use std::io::Write;
        (&self.stream)
            .write_all(&[REQUEST_RAW_SOCKET])
            .map_err(DhcpError::Io)?;

        let fd = self.stream.as_raw_fd();
        let mut data_buf = [0_u8; 1];
        let mut iov = [IoSliceMut::new(&mut data_buf)];
        let mut cmsg_buf = cmsg_space!(RawFd);

        let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
            .map_err(DhcpError::from)?;

        for cmsg in msg.cmsgs().map_err(|_: nix::Error| DhcpError::HelperDied)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&raw) = fds.first() {
                    // Safety: the fd was just handed to us by the kernel via
                    // SCM_RIGHTS and is not owned elsewhere yet.
                    let owned = unsafe { OwnedFd::from_raw_fd_checked(raw)? };
                    return Ok(owned);
                }
            }
        }
        Err(DhcpError::HelperDied)
    }
}

trait FromRawFdChecked: Sized {
    unsafe fn from_raw_fd_checked(raw: RawFd) -> Result<Self, DhcpError>;
}

impl FromRawFdChecked for OwnedFd {
    unsafe fn from_raw_fd_checked(raw: RawFd) -> Result<Self, DhcpError> {
        if raw < 0 {
            return Err(DhcpError::HelperDied);
        }
        Ok(std::os::fd::FromRawFd::from_raw_fd(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_byte_is_lowercase_r() {
        assert_eq!(REQUEST_RAW_SOCKET, b'r');
    }

    // The actual SCM_RIGHTS exchange needs a live peer socket to exercise
    // and is covered by the `run` skill's manual drive against a stub
    // helper, not a unit test.
}
