//! Packet building utilities for tests
//!
//! Guest frames are built and parsed with smoltcp so the stack's own codec
//! is checked against an independent implementation.

use std::net::{Ipv4Addr, SocketAddrV4};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpAddress, IpProtocol, Ipv4Packet,
    Ipv4Repr, TcpPacket, TcpSeqNumber, UdpPacket, UdpRepr,
};

use super::{GUEST_MAC, HOST_MAC};

const TCP_HEADER_LEN: usize = 20;

/// Build a raw Ethernet frame
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src),
        dst_addr: EthernetAddress::from_bytes(&dst),
        ethertype: EthernetProtocol::from(ethertype),
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

/// Build an ARP request packet
pub fn arp_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress::from_bytes(&sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress::from_bytes(&[0, 0, 0, 0, 0, 0]),
        target_protocol_addr: target_ip,
    };

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&sender_mac),
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);

    let mut arp_packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    buffer
}

/// Parsed ARP reply
#[derive(Debug, Clone)]
pub struct ArpReply {
    pub eth_dst: [u8; 6],
    pub eth_src: [u8; 6],
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP reply from an Ethernet frame
pub fn parse_arp_reply(frame: &[u8]) -> Option<ArpReply> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }

    let arp = ArpPacket::new_checked(eth.payload()).ok()?;
    let repr = ArpRepr::parse(&arp).ok()?;

    match repr {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => Some(ArpReply {
            eth_dst: eth.dst_addr().as_bytes().try_into().ok()?,
            eth_src: eth.src_addr().as_bytes().try_into().ok()?,
            sender_mac: source_hardware_addr.as_bytes().try_into().ok()?,
            sender_ip: source_protocol_addr,
            target_mac: target_hardware_addr.as_bytes().try_into().ok()?,
            target_ip: target_protocol_addr,
        }),
        _ => None,
    }
}

/// Wrap an IP payload in IPv4 and Ethernet headers, guest to stack
fn guest_ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, l4_len: usize) -> Vec<u8> {
    let ipv4_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: protocol,
        payload_len: l4_len,
        hop_limit: 64,
    };

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&GUEST_MAC),
        dst_addr: EthernetAddress::from_bytes(&HOST_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + ipv4_repr.buffer_len() + l4_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);

    let mut ipv4_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ipv4_repr.emit(&mut ipv4_packet, &ChecksumCapabilities::default());

    buffer
}

/// Build an ICMP echo request (ping) packet from the guest
pub fn icmp_echo_request(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Vec<u8> {
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    };

    let mut buffer = guest_ipv4(src_ip, dst_ip, IpProtocol::Icmp, icmp_repr.buffer_len());
    let mut icmp_packet = Icmpv4Packet::new_unchecked(&mut buffer[14 + 20..]);
    icmp_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());

    buffer
}

/// Parsed ICMP echo reply
#[derive(Debug, Clone)]
pub struct IcmpEchoReply {
    pub eth_dst: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub ident: u16,
    pub seq_no: u16,
    pub data: Vec<u8>,
}

/// Parse an ICMP echo reply from an Ethernet frame; checksums must be valid
pub fn parse_icmp_echo_reply(frame: &[u8]) -> Option<IcmpEchoReply> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }

    let ipv4 = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ipv4.next_header() != IpProtocol::Icmp || !ipv4.verify_checksum() {
        return None;
    }

    let icmp = Icmpv4Packet::new_checked(ipv4.payload()).ok()?;
    if icmp.msg_type() != Icmpv4Message::EchoReply {
        return None;
    }

    let repr = Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::default()).ok()?;

    if let Icmpv4Repr::EchoReply {
        ident,
        seq_no,
        data,
    } = repr
    {
        Some(IcmpEchoReply {
            eth_dst: eth.dst_addr().as_bytes().try_into().ok()?,
            src_ip: ipv4.src_addr(),
            dst_ip: ipv4.dst_addr(),
            ident,
            seq_no,
            data: data.to_vec(),
        })
    } else {
        None
    }
}

/// Build a UDP datagram from the guest
pub fn udp_datagram(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };

    let l4_len = udp_repr.header_len() + payload.len();
    let mut buffer = guest_ipv4(*src.ip(), *dst.ip(), IpProtocol::Udp, l4_len);
    let mut udp_packet = UdpPacket::new_unchecked(&mut buffer[14 + 20..]);
    udp_repr.emit(
        &mut udp_packet,
        &IpAddress::Ipv4(*src.ip()),
        &IpAddress::Ipv4(*dst.ip()),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );

    buffer
}

/// Parsed guest-bound UDP datagram
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: Vec<u8>,
}

/// Parse a UDP datagram from an Ethernet frame; checksums must be valid
pub fn parse_udp(frame: &[u8]) -> Option<UdpDatagram> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }

    let ipv4 = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ipv4.next_header() != IpProtocol::Udp || !ipv4.verify_checksum() {
        return None;
    }

    let src_ip = ipv4.src_addr();
    let dst_ip = ipv4.dst_addr();
    let udp = UdpPacket::new_checked(ipv4.payload()).ok()?;
    if !udp.verify_checksum(&IpAddress::Ipv4(src_ip), &IpAddress::Ipv4(dst_ip)) {
        return None;
    }

    Some(UdpDatagram {
        src: SocketAddrV4::new(src_ip, udp.src_port()),
        dst: SocketAddrV4::new(dst_ip, udp.dst_port()),
        payload: udp.payload().to_vec(),
    })
}

/// TCP control bits for guest segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl Flags {
    pub const SYN: Flags = Flags {
        syn: true,
        ack: false,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const ACK: Flags = Flags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const PSH_ACK: Flags = Flags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: true,
    };
    pub const FIN_ACK: Flags = Flags {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
        psh: false,
    };
    pub const RST: Flags = Flags {
        syn: false,
        ack: false,
        fin: false,
        rst: true,
        psh: false,
    };
}

/// Build a TCP segment from the guest
pub fn tcp_segment(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: Flags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let l4_len = TCP_HEADER_LEN + payload.len();
    let mut buffer = guest_ipv4(*src.ip(), *dst.ip(), IpProtocol::Tcp, l4_len);

    let mut tcp = TcpPacket::new_unchecked(&mut buffer[14 + 20..]);
    tcp.set_src_port(src.port());
    tcp.set_dst_port(dst.port());
    tcp.set_seq_number(TcpSeqNumber(seq as i32));
    tcp.set_ack_number(TcpSeqNumber(ack as i32));
    tcp.set_header_len(TCP_HEADER_LEN as u8);
    tcp.set_syn(flags.syn);
    tcp.set_ack(flags.ack);
    tcp.set_fin(flags.fin);
    tcp.set_rst(flags.rst);
    tcp.set_psh(flags.psh);
    tcp.set_window_len(window);
    tcp.set_urgent_at(0);
    tcp.payload_mut().copy_from_slice(payload);
    tcp.fill_checksum(&IpAddress::Ipv4(*src.ip()), &IpAddress::Ipv4(*dst.ip()));

    buffer
}

/// Parsed guest-bound TCP segment
#[derive(Debug, Clone)]
pub struct TcpSeg {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// Parse a TCP segment from an Ethernet frame; checksums must be valid
pub fn parse_tcp(frame: &[u8]) -> Option<TcpSeg> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }

    let ipv4 = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ipv4.next_header() != IpProtocol::Tcp || !ipv4.verify_checksum() {
        return None;
    }

    let src_ip = ipv4.src_addr();
    let dst_ip = ipv4.dst_addr();
    let tcp = TcpPacket::new_checked(ipv4.payload()).ok()?;
    if !tcp.verify_checksum(&IpAddress::Ipv4(src_ip), &IpAddress::Ipv4(dst_ip)) {
        return None;
    }

    Some(TcpSeg {
        src: SocketAddrV4::new(src_ip, tcp.src_port()),
        dst: SocketAddrV4::new(dst_ip, tcp.dst_port()),
        seq: tcp.seq_number().0 as u32,
        ack: tcp.ack_number().0 as u32,
        flags: Flags {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            psh: tcp.psh(),
        },
        window: tcp.window_len(),
        payload: tcp.payload().to_vec(),
    })
}

/// Recompute the IPv4 header checksum after editing header bytes
pub fn refresh_ipv4_checksum(frame: &mut [u8]) {
    let mut ipv4 = Ipv4Packet::new_unchecked(&mut frame[14..]);
    ipv4.fill_checksum();
}

/// Guest source address for the ICMP/UDP/TCP builders
pub fn guest_addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(super::GUEST_IP, port)
}

