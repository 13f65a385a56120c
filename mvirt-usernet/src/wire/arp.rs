//! ARP for Ethernet/IPv4, laid out right after the Ethernet header.

use std::net::Ipv4Addr;

use super::{
    ARP_PACKET_LEN, ETH_HDR_LEN, ensure_len, ethertype, get_ipv4, get_mac, get_u16, put_ipv4,
    put_u16,
};
use crate::error::Result;

mod field {
    use super::ETH_HDR_LEN;

    pub const HWTYPE: usize = ETH_HDR_LEN;
    pub const PROTO: usize = ETH_HDR_LEN + 2;
    pub const HWLEN: usize = ETH_HDR_LEN + 4;
    pub const PROTOLEN: usize = ETH_HDR_LEN + 5;
    pub const OP: usize = ETH_HDR_LEN + 6;
    pub const SMAC: usize = ETH_HDR_LEN + 8;
    pub const SIP: usize = ETH_HDR_LEN + 14;
    pub const DMAC: usize = ETH_HDR_LEN + 18;
    pub const DIP: usize = ETH_HDR_LEN + 24;
}

/// Hardware type for Ethernet
pub const HWTYPE_ETHERNET: u16 = 1;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

/// Total frame length of an Ethernet ARP packet
pub const ARP_FRAME_LEN: usize = ETH_HDR_LEN + ARP_PACKET_LEN;

/// View over an Ethernet frame carrying ARP.
#[derive(Debug, Clone)]
pub struct ArpPacket<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> ArpPacket<T> {
    pub fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Self> {
        ensure_len(buffer.as_ref(), ARP_FRAME_LEN)?;
        Ok(Self { buffer })
    }

    pub fn hwtype(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::HWTYPE)
    }

    pub fn proto(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::PROTO)
    }

    pub fn hwlen(&self) -> u8 {
        self.buffer.as_ref()[field::HWLEN]
    }

    pub fn protolen(&self) -> u8 {
        self.buffer.as_ref()[field::PROTOLEN]
    }

    pub fn op(&self) -> u16 {
        get_u16(self.buffer.as_ref(), field::OP)
    }

    pub fn sender_mac(&self) -> [u8; 6] {
        get_mac(self.buffer.as_ref(), field::SMAC)
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        get_ipv4(self.buffer.as_ref(), field::SIP)
    }

    pub fn target_mac(&self) -> [u8; 6] {
        get_mac(self.buffer.as_ref(), field::DMAC)
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        get_ipv4(self.buffer.as_ref(), field::DIP)
    }

    /// Whether this is the Ethernet/IPv4 flavour of ARP.
    pub fn is_ethernet_ipv4(&self) -> bool {
        self.hwtype() == HWTYPE_ETHERNET
            && self.proto() == ethertype::IPV4
            && self.hwlen() == 6
            && self.protolen() == 4
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ArpPacket<T> {
    /// Write the fixed Ethernet/IPv4 preamble and the operation.
    pub fn set_ethernet_ipv4(&mut self, op: u16) {
        let buf = self.buffer.as_mut();
        put_u16(buf, field::HWTYPE, HWTYPE_ETHERNET);
        put_u16(buf, field::PROTO, ethertype::IPV4);
        buf[field::HWLEN] = 6;
        buf[field::PROTOLEN] = 4;
        put_u16(buf, field::OP, op);
    }

    pub fn set_sender(&mut self, mac: [u8; 6], ip: Ipv4Addr) {
        let buf = self.buffer.as_mut();
        buf[field::SMAC..field::SMAC + 6].copy_from_slice(&mac);
        put_ipv4(buf, field::SIP, ip);
    }

    pub fn set_target(&mut self, mac: [u8; 6], ip: Ipv4Addr) {
        let buf = self.buffer.as_mut();
        buf[field::DMAC..field::DMAC + 6].copy_from_slice(&mac);
        put_ipv4(buf, field::DIP, ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arp_fields_round_trip() {
        let mut data = [0u8; ARP_FRAME_LEN];
        let mut arp = ArpPacket::new_unchecked(&mut data[..]);
        arp.set_ethernet_ipv4(OP_REQUEST);
        arp.set_sender([0x52, 0x54, 0, 0x12, 0x34, 0x56], Ipv4Addr::new(192, 168, 33, 15));
        arp.set_target([0; 6], Ipv4Addr::new(192, 168, 33, 1));

        let arp = ArpPacket::new_checked(&data[..]).unwrap();
        assert!(arp.is_ethernet_ipv4());
        assert_eq!(arp.op(), OP_REQUEST);
        assert_eq!(arp.sender_ip(), Ipv4Addr::new(192, 168, 33, 15));
        assert_eq!(arp.target_ip(), Ipv4Addr::new(192, 168, 33, 1));
        assert_eq!(&data[14..16], &[0x00, 0x01]);
        assert_eq!(&data[16..18], &[0x08, 0x00]);
    }

    #[test]
    fn test_truncated_arp() {
        let data = [0u8; ARP_FRAME_LEN - 1];
        assert!(ArpPacket::new_checked(&data[..]).is_err());
    }
}
