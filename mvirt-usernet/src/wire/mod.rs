//! Header codec for the protocols the stack terminates.
//!
//! Every view wraps a buffer holding a complete Ethernet frame and reads or
//! writes fields at fixed byte offsets, in network byte order. IP options are
//! not supported, so every transport header starts at [`L4_OFFSET`].

pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use std::net::Ipv4Addr;

use crate::error::{NetError, Result};

pub use arp::ArpPacket;
pub use ethernet::EthernetFrame;
pub use icmp::IcmpPacket;
pub use ipv4::Ipv4Packet;
pub use tcp::{TcpFlags, TcpPacket};
pub use udp::UdpPacket;

/// Ethernet header size
pub const ETH_HDR_LEN: usize = 14;

/// ARP packet size (for Ethernet + IPv4)
pub const ARP_PACKET_LEN: usize = 28;

/// IPv4 header size without options
pub const IPV4_HDR_LEN: usize = 20;

/// ICMP echo header size
pub const ICMP_HDR_LEN: usize = 8;

/// UDP header size
pub const UDP_HDR_LEN: usize = 8;

/// TCP header size without options
pub const TCP_HDR_LEN: usize = 20;

/// Offset of the IPv4 header within a frame
pub const IP_OFFSET: usize = ETH_HDR_LEN;

/// Offset of the transport header within a frame
pub const L4_OFFSET: usize = ETH_HDR_LEN + IPV4_HDR_LEN;

/// Largest IPv4 datagram
pub const MAX_IP_LEN: usize = 64 * 1024 - 1;

/// Largest Ethernet frame the stack builds (no FCS)
pub const MAX_FRAME_LEN: usize = ETH_HDR_LEN + MAX_IP_LEN;

/// IP datagram 64 KiB minus IP and TCP headers
pub const MAX_TCP_PAYLOAD: usize = 64 * 1024 - IPV4_HDR_LEN - TCP_HDR_LEN - 1;

/// IP datagram 64 KiB minus IP and UDP headers
pub const MAX_UDP_PAYLOAD: usize = 64 * 1024 - IPV4_HDR_LEN - UDP_HDR_LEN - 1;

/// EtherType values
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

/// IPv4 protocol numbers
pub mod ip_proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

pub(crate) fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(NetError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[inline]
pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn get_mac(buf: &[u8], off: usize) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&buf[off..off + 6]);
    mac
}

#[inline]
pub(crate) fn get_ipv4(buf: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3])
}

#[inline]
pub(crate) fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub(crate) fn put_ipv4(buf: &mut [u8], off: usize, addr: Ipv4Addr) {
    buf[off..off + 4].copy_from_slice(&addr.octets());
}
