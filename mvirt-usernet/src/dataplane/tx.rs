//! Guest-bound frame construction.
//!
//! Builders write headers into a frame buffer whose payload (if any) is
//! already in place at [`UDP_PAYLOAD_OFFSET`] or [`TCP_PAYLOAD_OFFSET`], so
//! relays can read host data straight into a pool buffer. Each returns the
//! finished Ethernet frame length.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::Result;
use crate::pool::{BufferPool, PoolBuffer};
use crate::wire::{
    EthernetFrame, Ipv4Packet, L4_OFFSET, TCP_HDR_LEN, TcpFlags, TcpPacket, UDP_HDR_LEN,
    UdpPacket, ethertype, ip_proto, udp,
};

/// Frame offset of a relayed UDP payload
pub const UDP_PAYLOAD_OFFSET: usize = udp::PAYLOAD_OFFSET;

/// Frame offset of a relayed TCP payload (no options)
pub const TCP_PAYLOAD_OFFSET: usize = L4_OFFSET + TCP_HDR_LEN;

/// Link-layer addressing for frames sent to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer2 {
    pub guest_mac: [u8; 6],
    pub host_mac: [u8; 6],
}

/// Header fields of a guest-bound TCP segment
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub from: SocketAddrV4,
    pub to: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

fn emit_ipv4(
    frame: &mut [u8],
    l2: &Layer2,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: usize,
    ident: u16,
) {
    let mut eth = EthernetFrame::new_unchecked(&mut *frame);
    eth.set_dst_mac(l2.guest_mac);
    eth.set_src_mac(l2.host_mac);
    eth.set_ethertype(ethertype::IPV4);

    let mut ip = Ipv4Packet::new_unchecked(frame);
    ip.emit_header(src, dst, protocol, payload_len, ident);
    ip.fill_checksum();
}

/// Wrap `payload_len` bytes at [`UDP_PAYLOAD_OFFSET`] in UDP/IPv4/Ethernet.
pub fn udp_datagram(
    frame: &mut [u8],
    l2: &Layer2,
    from: SocketAddrV4,
    to: SocketAddrV4,
    payload_len: usize,
    ident: u16,
) -> usize {
    let udp_len = UDP_HDR_LEN + payload_len;
    emit_ipv4(frame, l2, *from.ip(), *to.ip(), ip_proto::UDP, udp_len, ident);

    let mut udp = UdpPacket::new_unchecked(&mut *frame);
    udp.set_src_port(from.port());
    udp.set_dst_port(to.port());
    udp.set_len(udp_len);
    udp.fill_checksum();

    L4_OFFSET + udp_len
}

/// Wrap `payload_len` bytes at [`TCP_PAYLOAD_OFFSET`] in TCP/IPv4/Ethernet.
pub fn tcp_segment(
    frame: &mut [u8],
    l2: &Layer2,
    seg: &TcpSegment,
    payload_len: usize,
    ident: u16,
) -> usize {
    let segment_len = TCP_HDR_LEN + payload_len;
    emit_ipv4(
        frame,
        l2,
        *seg.from.ip(),
        *seg.to.ip(),
        ip_proto::TCP,
        segment_len,
        ident,
    );

    let mut tcp = TcpPacket::new_unchecked(&mut *frame);
    tcp.emit_header(
        seg.from.port(),
        seg.to.port(),
        seg.seq,
        seg.ack,
        seg.flags,
        seg.window,
    );
    tcp.fill_checksum();

    L4_OFFSET + segment_len
}

/// Publishes guest-bound frames into the buffer pool.
///
/// Shared by the dispatcher and every relay thread. Also owns the IPv4
/// identification counter for generated datagrams.
pub struct GuestTx {
    pool: Arc<BufferPool>,
    l2: Layer2,
    ident: AtomicU16,
}

impl GuestTx {
    pub fn new(pool: Arc<BufferPool>, l2: Layer2) -> Self {
        Self {
            pool,
            l2,
            ident: AtomicU16::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn layer2(&self) -> &Layer2 {
        &self.l2
    }

    pub fn next_ident(&self) -> u16 {
        self.ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim a free buffer, blocking while the pool is exhausted.
    pub fn acquire(&self) -> Result<PoolBuffer> {
        self.pool.acquire_free()
    }

    /// Finish a UDP datagram whose payload is already in `buf` and publish it.
    pub fn publish_udp(
        &self,
        mut buf: PoolBuffer,
        from: SocketAddrV4,
        to: SocketAddrV4,
        payload_len: usize,
    ) {
        let ident = self.next_ident();
        let len = udp_datagram(buf.frame_mut(), &self.l2, from, to, payload_len, ident);
        buf.set_frame_len(len);
        buf.publish();
    }

    /// Copy `payload` into `buf`, add the TCP headers and publish it.
    pub fn publish_tcp(&self, mut buf: PoolBuffer, seg: &TcpSegment, payload: &[u8]) {
        let ident = self.next_ident();
        let frame = buf.frame_mut();
        frame[TCP_PAYLOAD_OFFSET..TCP_PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
        let len = tcp_segment(frame, &self.l2, seg, payload.len(), ident);
        buf.set_frame_len(len);
        buf.publish();
    }
}
