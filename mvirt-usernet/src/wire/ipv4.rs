//! IPv4 header without options.
//!
//! `new_checked` rejects options and any total length that does not fit in
//! the buffer. Ethernet padding past the total length is ignored.

use std::net::Ipv4Addr;

use super::checksum;
use super::{
    IP_OFFSET, IPV4_HDR_LEN, L4_OFFSET, ensure_len, get_ipv4, get_u16, put_ipv4, put_u16,
};
use crate::error::{NetError, Result};

mod field {
    use super::IP_OFFSET;

    pub const VHL: usize = IP_OFFSET;
    pub const TOS: usize = IP_OFFSET + 1;
    pub const LEN: usize = IP_OFFSET + 2;
    pub const ID: usize = IP_OFFSET + 4;
    pub const FLGFRAG: usize = IP_OFFSET + 6;
    pub const TTL: usize = IP_OFFSET + 8;
    pub const PROTO: usize = IP_OFFSET + 9;
    pub const CSUM: usize = IP_OFFSET + 10;
    pub const SIP: usize = IP_OFFSET + 12;
    pub const DIP: usize = IP_OFFSET + 16;
}

/// Version 4, header length 5 words
pub const VHL_DEFAULT: u8 = 0x45;

/// Default TTL for generated packets
pub const DEFAULT_TTL: u8 = 64;

/// Don't Fragment flag in the flags/fragment field
pub const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const FRAG_OFFSET_MASK: u16 = 0x1fff;

/// View over an Ethernet frame carrying IPv4.
#[derive(Debug, Clone)]
pub struct Ipv4Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv4Packet<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self> {
        let buf = buffer.as_ref();
        ensure_len(buf, L4_OFFSET)?;

        let version = buf[field::VHL] >> 4;
        if version != 4 {
            return Err(NetError::NotIpv4(version));
        }

        let header_len = usize::from(buf[field::VHL] & 0x0f) * 4;
        if header_len > IPV4_HDR_LEN {
            return Err(NetError::IpOptions(header_len));
        }
        if header_len < IPV4_HDR_LEN {
            return Err(NetError::Truncated {
                needed: IPV4_HDR_LEN,
                actual: header_len,
            });
        }

        let total_len = usize::from(get_u16(buf, field::LEN));
        if total_len < IPV4_HDR_LEN {
            return Err(NetError::Truncated {
                needed: IPV4_HDR_LEN,
                actual: total_len,
            });
        }
        ensure_len(buf, IP_OFFSET + total_len)?;

        Ok(Self { buffer })
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn version(&self) -> u8 {
        self.buffer.as_ref()[field::VHL] >> 4
    }

    /// Header length in bytes (low nibble × 4)
    pub fn header_len(&self) -> usize {
        usize::from(self.buffer.as_ref()[field::VHL] & 0x0f) * 4
    }

    pub fn tos(&self) -> u8 {
        self.buffer.as_ref()[field::TOS]
    }

    /// IP header + IP payload
    pub fn total_len(&self) -> usize {
        usize::from(get_u16(self.buffer.as_ref(), field::LEN))
    }

    /// Total length minus header length
    pub fn payload_len(&self) -> usize {
        self.total_len().saturating_sub(self.header_len())
    }

    pub fn ident(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::ID)
    }

    pub fn flags_frag(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::FLGFRAG)
    }

    /// Whether this datagram is one piece of a fragmented packet.
    pub fn is_fragment(&self) -> bool {
        let ff = self.flags_frag();
        ff & FLAG_MF != 0 || ff & FRAG_OFFSET_MASK != 0
    }

    pub fn ttl(&self) -> u8 {
        self.buffer.as_ref()[field::TTL]
    }

    pub fn protocol(&self) -> u8 {
        self.buffer.as_ref()[field::PROTO]
    }

    pub fn checksum(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::CSUM)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        get_ipv4(self.buffer.as_ref(), field::SIP)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        get_ipv4(self.buffer.as_ref(), field::DIP)
    }

    /// Bytes of the IP datagram (header + payload, without Ethernet padding)
    pub fn datagram(&self) -> &[u8] {
        &self.buffer.as_ref()[IP_OFFSET..IP_OFFSET + self.total_len()]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[L4_OFFSET..IP_OFFSET + self.total_len()]
    }

    /// Ethernet header plus IP datagram
    pub fn frame_len(&self) -> usize {
        IP_OFFSET + self.total_len()
    }

    pub fn verify_checksum(&self) -> bool {
        let buf = self.buffer.as_ref();
        checksum::checksum(&buf[IP_OFFSET..IP_OFFSET + self.header_len()]) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4Packet<T> {
    /// Write a complete option-less header; the checksum is left zero.
    pub fn emit_header(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload_len: usize,
        ident: u16,
    ) {
        let buf = self.buffer.as_mut();
        buf[field::VHL] = VHL_DEFAULT;
        buf[field::TOS] = 0;
        put_u16(buf, field::LEN, (IPV4_HDR_LEN + payload_len) as u16);
        put_u16(buf, field::ID, ident);
        put_u16(buf, field::FLGFRAG, FLAG_DF);
        buf[field::TTL] = DEFAULT_TTL;
        buf[field::PROTO] = protocol;
        put_u16(buf, field::CSUM, 0);
        put_ipv4(buf, field::SIP, src);
        put_ipv4(buf, field::DIP, dst);
    }

    pub fn set_total_len(&mut self, len: usize) {
        put_u16(self.buffer.as_mut(), field::LEN, len as u16);
    }

    pub fn set_ident(&mut self, ident: u16) {
        put_u16(self.buffer.as_mut(), field::ID, ident);
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.buffer.as_mut()[field::TTL] = ttl;
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        put_ipv4(self.buffer.as_mut(), field::SIP, addr);
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        put_ipv4(self.buffer.as_mut(), field::DIP, addr);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = IP_OFFSET + self.total_len();
        &mut self.buffer.as_mut()[L4_OFFSET..end]
    }

    /// Recompute and store the header checksum.
    pub fn fill_checksum(&mut self) {
        let header_len = self.header_len();
        let buf = self.buffer.as_mut();
        put_u16(buf, field::CSUM, 0);
        let csum = checksum::checksum(&buf[IP_OFFSET..IP_OFFSET + header_len]);
        put_u16(buf, field::CSUM, csum);
    }
}
