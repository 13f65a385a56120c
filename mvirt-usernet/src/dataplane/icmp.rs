//! ICMP echo responder
//!
//! Every echo request is answered, whatever its destination address. The
//! reply is the request with addresses swapped, type set to echo reply and
//! fresh checksums; id, sequence and payload are carried over unchanged.

use tracing::{debug, trace};

use crate::wire::icmp::{TYPE_ECHO_REPLY, TYPE_ECHO_REQUEST};
use crate::wire::ipv4::DEFAULT_TTL;
use crate::wire::{EthernetFrame, IcmpPacket, Ipv4Packet};

#[derive(Debug, Clone)]
pub struct IcmpResponder {
    host_mac: [u8; 6],
}

impl IcmpResponder {
    pub fn new(host_mac: [u8; 6]) -> Self {
        Self { host_mac }
    }

    pub fn wants_reply<T: AsRef<[u8]>>(&self, request: &IcmpPacket<T>) -> bool {
        if request.msg_type() != TYPE_ECHO_REQUEST || request.code() != 0 {
            trace!(
                icmp_type = request.msg_type(),
                code = request.code(),
                "Ignoring non-echo ICMP"
            );
            return false;
        }
        true
    }

    /// Write the echo reply for `request` into `out` and return its length.
    ///
    /// `request` must have passed [`IcmpPacket::new_checked`].
    pub fn write_reply(&self, request: &[u8], out: &mut [u8]) -> usize {
        let icmp = IcmpPacket::new_unchecked(request);
        let ip = icmp.ip();
        let frame_len = ip.frame_len();
        let (src, dst) = (ip.src_addr(), ip.dst_addr());
        let requester_mac = EthernetFrame::new_unchecked(request).src_mac();

        debug!(
            src_ip = %src,
            dst_ip = %dst,
            ident = icmp.ident(),
            seq = icmp.seq(),
            len = icmp.data().len(),
            "ICMP echo request"
        );

        out[..frame_len].copy_from_slice(&request[..frame_len]);

        let mut eth = EthernetFrame::new_unchecked(&mut *out);
        eth.set_dst_mac(requester_mac);
        eth.set_src_mac(self.host_mac);

        let mut reply_ip = Ipv4Packet::new_unchecked(&mut *out);
        reply_ip.set_src_addr(dst);
        reply_ip.set_dst_addr(src);
        reply_ip.set_ttl(DEFAULT_TTL);
        reply_ip.fill_checksum();

        let mut reply = IcmpPacket::new_unchecked(out);
        reply.set_msg_type(TYPE_ECHO_REPLY);
        reply.set_code(0);
        reply.fill_checksum();

        frame_len
    }
}
