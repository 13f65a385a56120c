//! TCP header: ports, seq, ack, data offset, flags, window, checksum, urgent.

use super::checksum;
use super::ipv4::Ipv4Packet;
use super::{L4_OFFSET, TCP_HDR_LEN, get_u16, get_u32, ip_proto, put_u16, put_u32};
use crate::error::{NetError, Result};

mod field {
    use super::L4_OFFSET;

    pub const SPORT: usize = L4_OFFSET;
    pub const DPORT: usize = L4_OFFSET + 2;
    pub const SEQ: usize = L4_OFFSET + 4;
    pub const ACK: usize = L4_OFFSET + 8;
    pub const OFF: usize = L4_OFFSET + 12;
    pub const FLG: usize = L4_OFFSET + 13;
    pub const WIN: usize = L4_OFFSET + 14;
    pub const CSUM: usize = L4_OFFSET + 16;
    pub const URGENT: usize = L4_OFFSET + 18;
}

/// Data offset byte for a 20-byte header
pub const OFF_DEFAULT: u8 = 0x50;

/// TCP control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

/// View over an Ethernet/IPv4 frame carrying TCP.
#[derive(Debug, Clone)]
pub struct TcpPacket<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> TcpPacket<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self> {
        let ip = Ipv4Packet::new_checked(buffer)?;
        let segment_len = ip.payload_len();
        if segment_len < TCP_HDR_LEN {
            return Err(NetError::Truncated {
                needed: TCP_HDR_LEN,
                actual: segment_len,
            });
        }
        let packet = Self {
            buffer: ip.into_inner(),
        };
        let header_len = packet.header_len();
        if header_len < TCP_HDR_LEN || header_len > segment_len {
            return Err(NetError::BadTcpHeader(header_len));
        }
        Ok(packet)
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn ip(&self) -> Ipv4Packet<&[u8]> {
        Ipv4Packet::new_unchecked(self.buffer.as_ref())
    }

    pub fn src_port(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::SPORT)
    }

    pub fn dst_port(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::DPORT)
    }

    pub fn seq(&self) -> u32 {
        get_u32(self.buffer.as_ref(), field::SEQ)
    }

    pub fn ack(&self) -> u32 {
        get_u32(self.buffer.as_ref(), field::ACK)
    }

    /// High nibble of the data-offset byte × 4
    pub fn header_len(&self) -> usize {
        usize::from(self.buffer.as_ref()[field::OFF] >> 4) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags(self.buffer.as_ref()[field::FLG])
    }

    pub fn window(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::WIN)
    }

    pub fn checksum(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::CSUM)
    }

    pub fn urgent(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::URGENT)
    }

    /// TCP header + payload (the IP payload length)
    pub fn segment_len(&self) -> usize {
        self.ip().payload_len()
    }

    pub fn payload_len(&self) -> usize {
        self.segment_len().saturating_sub(self.header_len())
    }

    /// Frame offset of the first payload byte
    pub fn payload_offset(&self) -> usize {
        L4_OFFSET + self.header_len()
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.payload_offset();
        &self.buffer.as_ref()[start..start + self.payload_len()]
    }

    pub fn is_syn(&self) -> bool {
        self.flags().contains(TcpFlags::SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.flags().contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags().contains(TcpFlags::RST)
    }

    pub fn is_ack(&self) -> bool {
        self.flags().contains(TcpFlags::ACK)
    }

    pub fn verify_checksum(&self) -> bool {
        let ip = self.ip();
        let segment = &self.buffer.as_ref()[L4_OFFSET..L4_OFFSET + self.segment_len()];
        checksum::transport(ip.src_addr(), ip.dst_addr(), ip_proto::TCP, segment) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpPacket<T> {
    /// Write an option-less header; the checksum is left zero.
    pub fn emit_header(
        &mut self,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        window: u16,
    ) {
        let buf = self.buffer.as_mut();
        put_u16(buf, field::SPORT, src_port);
        put_u16(buf, field::DPORT, dst_port);
        put_u32(buf, field::SEQ, seq);
        put_u32(buf, field::ACK, ack);
        buf[field::OFF] = OFF_DEFAULT;
        buf[field::FLG] = flags.bits();
        put_u16(buf, field::WIN, window);
        put_u16(buf, field::CSUM, 0);
        put_u16(buf, field::URGENT, 0);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.payload_offset();
        let len = self.payload_len();
        &mut self.buffer.as_mut()[start..start + len]
    }

    pub fn fill_checksum(&mut self) {
        let (src, dst, segment_len) = {
            let ip = self.ip();
            (ip.src_addr(), ip.dst_addr(), ip.payload_len())
        };
        let buf = self.buffer.as_mut();
        put_u16(buf, field::CSUM, 0);
        let end = L4_OFFSET + segment_len;
        let csum = checksum::transport(src, dst, ip_proto::TCP, &buf[L4_OFFSET..end]);
        put_u16(buf, field::CSUM, csum);
    }
}
