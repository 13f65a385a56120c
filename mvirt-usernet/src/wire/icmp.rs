//! ICMP echo header: type(1) + code(1) + checksum(2) + id(2) + seq(2).
//!
//! The ICMP checksum covers the ICMP message only; there is no
//! pseudo-header for ICMPv4 (RFC 792).

use super::checksum;
use super::{ICMP_HDR_LEN, IP_OFFSET, L4_OFFSET, get_u16, put_u16};
use super::ipv4::Ipv4Packet;
use crate::error::{NetError, Result};

mod field {
    use super::L4_OFFSET;

    pub const TYPE: usize = L4_OFFSET;
    pub const CODE: usize = L4_OFFSET + 1;
    pub const CSUM: usize = L4_OFFSET + 2;
    pub const ID: usize = L4_OFFSET + 4;
    pub const SEQ: usize = L4_OFFSET + 6;
}

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_ECHO_REQUEST: u8 = 8;

/// View over an Ethernet/IPv4 frame carrying ICMP.
#[derive(Debug, Clone)]
pub struct IcmpPacket<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> IcmpPacket<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self> {
        let ip = Ipv4Packet::new_checked(buffer)?;
        if ip.payload_len() < ICMP_HDR_LEN {
            return Err(NetError::Truncated {
                needed: ICMP_HDR_LEN,
                actual: ip.payload_len(),
            });
        }
        Ok(Self {
            buffer: ip.into_inner(),
        })
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn ip(&self) -> Ipv4Packet<&[u8]> {
        Ipv4Packet::new_unchecked(self.buffer.as_ref())
    }

    pub fn msg_type(&self) -> u8 {
        self.buffer.as_ref()[field::TYPE]
    }

    pub fn code(&self) -> u8 {
        self.buffer.as_ref()[field::CODE]
    }

    pub fn checksum(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::CSUM)
    }

    pub fn ident(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::ID)
    }

    pub fn seq(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::SEQ)
    }

    /// Echo payload following the 8-byte header
    pub fn data(&self) -> &[u8] {
        &self.buffer.as_ref()[L4_OFFSET + ICMP_HDR_LEN..self.message_end()]
    }

    pub fn verify_checksum(&self) -> bool {
        checksum::checksum(&self.buffer.as_ref()[L4_OFFSET..self.message_end()]) == 0
    }

    fn message_end(&self) -> usize {
        IP_OFFSET + self.ip().total_len()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IcmpPacket<T> {
    pub fn set_msg_type(&mut self, msg_type: u8) {
        self.buffer.as_mut()[field::TYPE] = msg_type;
    }

    pub fn set_code(&mut self, code: u8) {
        self.buffer.as_mut()[field::CODE] = code;
    }

    pub fn set_ident(&mut self, ident: u16) {
        put_u16(self.buffer.as_mut(), field::ID, ident);
    }

    pub fn set_seq(&mut self, seq: u16) {
        put_u16(self.buffer.as_mut(), field::SEQ, seq);
    }

    pub fn fill_checksum(&mut self) {
        let end = self.message_end();
        let buf = self.buffer.as_mut();
        put_u16(buf, field::CSUM, 0);
        let csum = checksum::checksum(&buf[L4_OFFSET..end]);
        put_u16(buf, field::CSUM, csum);
    }
}
