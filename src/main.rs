//! `ndhc` binary entry point.
//!
//! Parses the command line, resolves the managed interface's hardware
//! address, takes the raw/ARP sockets from the socket helper (§6), and
//! hands everything to [`ndhc::eventloop::EventLoop`]. This file is wiring
//! only — every protocol decision lives in the library crate.

use std::os::fd::{AsRawFd, RawFd};
use std::process::ExitCode;

use clap::Parser;

use ndhc::config::Config;
use ndhc::eventloop::{EventLoop, IfChangePipes};
use ndhc::link::LinkObserver;
use ndhc::rng::Rng;
use ndhc::signals::SignalHandler;
use ndhc::socket_helper::SocketHelperClient;
use ndhc::timer::MonotonicClock;
use ndhc::transport::{RawSocket, Transport};
use ndhc::{DhcpError, MacAddr};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            e.exit_code()
        }
    }
}

fn run() -> Result<(), DhcpError> {
    let config = Config::parse();
    config.validate()?;

    let client_mac = interface_mac(&config.interface)?;
    log::info!("{}: hardware address {client_mac}", config.interface);

    let helper = SocketHelperClient::connect(
        config
            .helper_socket
            .to_str()
            .ok_or_else(|| DhcpError::BadArguments("helper socket path is not UTF-8".into()))?,
    )?;
    let raw_fd = helper.request_raw_socket()?;
    let arp_fd = helper.request_raw_socket()?;
    set_nonblocking(raw_fd.as_raw_fd())?;
    set_nonblocking(arp_fd.as_raw_fd())?;

    let link = LinkObserver::open(&config.interface)?;
    link.request_dump()?;

    let signals = SignalHandler::install()?;

    let ifchange_pipes = IfChangePipes {
        cmd_fd: config.ifchange_cmd_fd,
        ack_fd: config.ifchange_ack_fd,
    };
    set_nonblocking(ifchange_pipes.ack_fd)?;

    let transport = Transport::Raw(RawSocket::from_fd(raw_fd, client_mac));
    let rng = Rng::from_wall_clock();

    // `arp_fd` stays owned here, alive for the whole run; the event loop
    // below only borrows its raw descriptor.
    let mut event_loop = EventLoop::new(
        MonotonicClock,
        rng,
        &config,
        client_mac,
        transport,
        helper,
        arp_fd.as_raw_fd(),
        link,
        signals,
        ifchange_pipes,
    )?;

    let reason = event_loop.run()?;
    log::info!("{}: exiting ({reason:?})", config.interface);
    Ok(())
}

/// Resolve `interface`'s hardware (MAC) address via `getifaddrs`'
/// `AF_PACKET` entry, per §7 ("missing MAC on the adapter" is
/// process-fatal).
fn interface_mac(interface: &str) -> Result<MacAddr, DhcpError> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(DhcpError::from)?;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        let Some(link_addr) = ifaddr.address.as_ref().and_then(|a| a.as_link_addr()) else {
            continue;
        };
        if let Some(bytes) = link_addr.addr() {
            return Ok(MacAddr::new(bytes));
        }
    }
    Err(DhcpError::MissingMacAddress {
        iface: interface.to_string(),
    })
}

fn set_nonblocking(fd: RawFd) -> Result<(), DhcpError> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(DhcpError::from)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(DhcpError::from)?;
    Ok(())
}
