//! Data plane: guest frame classification and guest-bound frame building
//!
//! The [`Dispatcher`] consumes one guest-transmitted Ethernet frame at a
//! time. ARP and ICMP echo are answered inline; UDP and TCP are handed to
//! the relays. Replies are built by [`tx`] into pool buffers.

pub mod arp;
pub mod icmp;
pub mod tx;

use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::trace;

use crate::config::StackConfig;
use crate::error::{NetError, Result};
use crate::relay::{FlowKey, TcpRelay, UdpRelay};
use crate::wire::{ArpPacket, EthernetFrame, IcmpPacket, Ipv4Packet, TcpPacket, UdpPacket};
use crate::wire::{ethertype, ip_proto};

pub use arp::ArpResponder;
pub use icmp::IcmpResponder;
pub use tx::{GuestTx, Layer2, TcpSegment};

/// Routes guest frames to the responders and relays.
pub struct Dispatcher {
    arp: ArpResponder,
    icmp: IcmpResponder,
    tx: Arc<GuestTx>,
    udp: Arc<UdpRelay>,
    tcp: Arc<TcpRelay>,
    verify_checksums: bool,
}

impl Dispatcher {
    pub fn new(
        config: &StackConfig,
        tx: Arc<GuestTx>,
        udp: Arc<UdpRelay>,
        tcp: Arc<TcpRelay>,
    ) -> Self {
        Self {
            arp: ArpResponder::new(config.host_mac, config.host_ip),
            icmp: IcmpResponder::new(config.host_mac),
            tx,
            udp,
            tcp,
            verify_checksums: config.verify_checksums,
        }
    }

    /// Handle one guest Ethernet frame (vendor header already stripped).
    ///
    /// Frames the stack does not handle come back as an error; the caller
    /// drops them. No pool buffer is held when this returns.
    pub fn dispatch(&self, frame: &[u8]) -> Result<()> {
        let eth = EthernetFrame::new_checked(frame)?;
        match eth.ethertype() {
            ethertype::ARP => self.handle_arp(frame),
            ethertype::IPV4 => self.handle_ipv4(frame),
            other => Err(NetError::UnsupportedEtherType(other)),
        }
    }

    fn handle_arp(&self, frame: &[u8]) -> Result<()> {
        let arp = ArpPacket::new_checked(frame)?;
        if !self.arp.wants_reply(&arp) {
            return Ok(());
        }

        let mut buf = self.tx.acquire()?;
        let len = self.arp.write_reply(frame, buf.frame_mut());
        buf.set_frame_len(len);
        buf.publish();
        Ok(())
    }

    fn handle_ipv4(&self, frame: &[u8]) -> Result<()> {
        let ip = Ipv4Packet::new_checked(frame)?;
        if ip.is_fragment() {
            return Err(NetError::Fragmented);
        }
        if self.verify_checksums && !ip.verify_checksum() {
            return Err(NetError::BadChecksum("ipv4"));
        }

        trace!(
            src_ip = %ip.src_addr(),
            dst_ip = %ip.dst_addr(),
            protocol = ip.protocol(),
            len = ip.total_len(),
            "Guest IPv4 packet"
        );

        match ip.protocol() {
            ip_proto::ICMP => self.handle_icmp(frame),
            ip_proto::UDP => self.handle_udp(frame),
            ip_proto::TCP => self.handle_tcp(frame),
            other => Err(NetError::UnsupportedProtocol(other)),
        }
    }

    fn handle_icmp(&self, frame: &[u8]) -> Result<()> {
        let icmp = IcmpPacket::new_checked(frame)?;
        if self.verify_checksums && !icmp.verify_checksum() {
            return Err(NetError::BadChecksum("icmp"));
        }
        if !self.icmp.wants_reply(&icmp) {
            return Ok(());
        }

        let mut buf = self.tx.acquire()?;
        let len = self.icmp.write_reply(frame, buf.frame_mut());
        buf.set_frame_len(len);
        buf.publish();
        Ok(())
    }

    fn handle_udp(&self, frame: &[u8]) -> Result<()> {
        let udp = UdpPacket::new_checked(frame)?;
        if self.verify_checksums && !udp.verify_checksum() {
            return Err(NetError::BadChecksum("udp"));
        }

        let ip = udp.ip();
        let key = FlowKey::new(
            SocketAddrV4::new(ip.src_addr(), udp.src_port()),
            SocketAddrV4::new(ip.dst_addr(), udp.dst_port()),
        );
        self.udp.send(key, udp.payload())
    }

    fn handle_tcp(&self, frame: &[u8]) -> Result<()> {
        let tcp = TcpPacket::new_checked(frame)?;
        if self.verify_checksums && !tcp.verify_checksum() {
            return Err(NetError::BadChecksum("tcp"));
        }
        self.tcp.handle_segment(&tcp)
    }
}
