//! Host-socket relays for guest UDP and TCP flows.
//!
//! A flow is identified by the 4-tuple as the guest sees it. Replies built
//! for the guest always use that 4-tuple reversed, whatever host address the
//! relay actually connected to.

pub mod isn;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub use isn::{IsnGenerator, IsnPolicy};
pub use tcp::{TcpRelay, TcpState};
pub use udp::UdpRelay;

/// Guest-visible 4-tuple of a relayed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

impl FlowKey {
    pub fn new(guest: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self {
            guest_ip: *guest.ip(),
            guest_port: guest.port(),
            remote_ip: *remote.ip(),
            remote_port: remote.port(),
        }
    }

    pub fn guest(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.guest_ip, self.guest_port)
    }

    pub fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_ip, self.remote_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.guest(), self.remote())
    }
}

/// Address a relay socket connects to for a guest destination.
///
/// With `loopback` set, traffic for the stack's own address goes to
/// 127.0.0.1 on the same port.
pub fn host_target(remote: SocketAddrV4, host_ip: Ipv4Addr, loopback: bool) -> SocketAddrV4 {
    if loopback && *remote.ip() == host_ip {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, remote.port())
    } else {
        remote
    }
}
