//! UDP header: src port(2) + dst port(2) + length(2) + checksum(2).

use super::checksum;
use super::ipv4::Ipv4Packet;
use super::{L4_OFFSET, UDP_HDR_LEN, get_u16, ip_proto, put_u16};
use crate::error::{NetError, Result};

mod field {
    use super::L4_OFFSET;

    pub const SPORT: usize = L4_OFFSET;
    pub const DPORT: usize = L4_OFFSET + 2;
    pub const LEN: usize = L4_OFFSET + 4;
    pub const CSUM: usize = L4_OFFSET + 6;
}

/// Offset of the UDP payload within a frame
pub const PAYLOAD_OFFSET: usize = L4_OFFSET + UDP_HDR_LEN;

/// View over an Ethernet/IPv4 frame carrying UDP.
#[derive(Debug, Clone)]
pub struct UdpPacket<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> UdpPacket<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self> {
        let ip = Ipv4Packet::new_checked(buffer)?;
        let ip_payload = ip.payload_len();
        if ip_payload < UDP_HDR_LEN {
            return Err(NetError::Truncated {
                needed: UDP_HDR_LEN,
                actual: ip_payload,
            });
        }
        let packet = Self {
            buffer: ip.into_inner(),
        };
        let udp_len = packet.len();
        if udp_len < UDP_HDR_LEN || udp_len > ip_payload {
            return Err(NetError::Truncated {
                needed: udp_len.max(UDP_HDR_LEN),
                actual: ip_payload,
            });
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

    /// UDP header + payload
    pub fn len(&self) -> usize {
        usize::from(get_u16(self.buffer.as_ref(), field::LEN))
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= UDP_HDR_LEN
    }

    pub fn checksum(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::CSUM)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[PAYLOAD_OFFSET..L4_OFFSET + self.len()]
    }

    /// A zero checksum field means the sender did not compute one.
    pub fn verify_checksum(&self) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        let ip = self.ip();
        let segment = &self.buffer.as_ref()[L4_OFFSET..L4_OFFSET + self.len()];
        checksum::transport(ip.src_addr(), ip.dst_addr(), ip_proto::UDP, segment) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpPacket<T> {
    pub fn set_src_port(&mut self, port: u16) {
        put_u16(self.buffer.as_mut(), field::SPORT, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        put_u16(self.buffer.as_mut(), field::DPORT, port);
    }

    pub fn set_len(&mut self, len: usize) {
        put_u16(self.buffer.as_mut(), field::LEN, len as u16);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = L4_OFFSET + self.len();
        &mut self.buffer.as_mut()[PAYLOAD_OFFSET..end]
    }

    /// Compute the checksum over pseudo-header, header and payload.
    ///
    /// A computed value of zero is sent as 0xffff (RFC 768).
    pub fn fill_checksum(&mut self) {
        let (src, dst) = {
            let ip = self.ip();
            (ip.src_addr(), ip.dst_addr())
        };
        let end = L4_OFFSET + self.len();
        let buf = self.buffer.as_mut();
        put_u16(buf, field::CSUM, 0);
        let csum = match checksum::transport(src, dst, ip_proto::UDP, &buf[L4_OFFSET..end]) {
            0 => 0xffff,
            c => c,
        };
        put_u16(buf, field::CSUM, csum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn udp_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; PAYLOAD_OFFSET + payload.len()];
        let mut ip = Ipv4Packet::new_unchecked(&mut frame[..]);
        ip.emit_header(
            Ipv4Addr::new(192, 168, 33, 15),
            Ipv4Addr::new(8, 8, 8, 8),
            ip_proto::UDP,
            UDP_HDR_LEN + payload.len(),
            0,
        );
        ip.fill_checksum();

        let mut udp = UdpPacket::new_unchecked(&mut frame[..]);
        udp.set_src_port(40000);
        udp.set_dst_port(53);
        udp.set_len(UDP_HDR_LEN + payload.len());
        udp.payload_mut().copy_from_slice(payload);
        udp.fill_checksum();
        frame
    }

    #[test]
    fn test_udp_fields() {
        let frame = udp_frame(b"query");
        let udp = UdpPacket::new_checked(&frame[..]).unwrap();
        assert_eq!(udp.src_port(), 40000);
        assert_eq!(udp.dst_port(), 53);
        assert_eq!(udp.len(), 13);
        assert_eq!(udp.payload(), b"query");
        assert!(udp.verify_checksum());
    }

    #[test]
    fn test_zero_checksum_accepted() {
        let mut frame = udp_frame(b"x");
        frame[field::CSUM..field::CSUM + 2].copy_from_slice(&[0, 0]);
        assert!(UdpPacket::new_checked(&frame[..]).unwrap().verify_checksum());
    }

    #[test]
    fn test_bad_checksum_detected() {
        let mut frame = udp_frame(b"data");
        frame[PAYLOAD_OFFSET] ^= 0x01;
        assert!(!UdpPacket::new_checked(&frame[..]).unwrap().verify_checksum());
    }

    #[test]
    fn test_length_beyond_ip_payload() {
        let mut frame = udp_frame(b"data");
        frame[field::LEN..field::LEN + 2].copy_from_slice(&64u16.to_be_bytes());
        assert!(UdpPacket::new_checked(&frame[..]).is_err());
    }
}
