//! ARP responder for the host address
//!
//! Answers Ethernet/IPv4 ARP requests whose target is the configured host
//! IPv4 address with the host MAC. Everything else is ignored.

use std::net::Ipv4Addr;

use tracing::{debug, trace};

use crate::wire::arp::{ARP_FRAME_LEN, OP_REPLY, OP_REQUEST};
use crate::wire::ethernet::format_mac;
use crate::wire::{ArpPacket, EthernetFrame, ethertype};

/// ARP responder configuration
#[derive(Debug, Clone)]
pub struct ArpResponder {
    host_mac: [u8; 6],
    host_ip: Ipv4Addr,
}

impl ArpResponder {
    pub fn new(host_mac: [u8; 6], host_ip: Ipv4Addr) -> Self {
        Self { host_mac, host_ip }
    }

    /// Whether `request` is a request this responder answers.
    pub fn wants_reply<T: AsRef<[u8]>>(&self, request: &ArpPacket<T>) -> bool {
        if !request.is_ethernet_ipv4() || request.op() != OP_REQUEST {
            trace!(op = request.op(), "Ignoring non-request ARP packet");
            return false;
        }
        if request.target_ip() != self.host_ip {
            trace!(target_ip = %request.target_ip(), "ARP request for another address");
            return false;
        }
        true
    }

    /// Write the reply to `request` into `out` and return its length.
    pub fn write_reply(&self, request: &[u8], out: &mut [u8]) -> usize {
        let eth = EthernetFrame::new_unchecked(request);
        let arp = ArpPacket::new_unchecked(request);
        let requester_mac = eth.src_mac();

        debug!(
            target_ip = %arp.target_ip(),
            source_ip = %arp.sender_ip(),
            source_mac = %format_mac(&requester_mac),
            "ARP request received"
        );

        let mut reply_eth = EthernetFrame::new_unchecked(&mut *out);
        reply_eth.set_dst_mac(requester_mac);
        reply_eth.set_src_mac(self.host_mac);
        reply_eth.set_ethertype(ethertype::ARP);

        let mut reply = ArpPacket::new_unchecked(out);
        reply.set_ethernet_ipv4(OP_REPLY);
        reply.set_sender(self.host_mac, self.host_ip);
        reply.set_target(arp.sender_mac(), arp.sender_ip());

        ARP_FRAME_LEN
    }
}
