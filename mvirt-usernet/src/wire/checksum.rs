//! Internet checksum (RFC 1071) and the IPv4 pseudo-header.
//!
//! All routines return the value to store in the header field. A header
//! whose checksum is already filled in sums to zero under [`checksum`].

use std::net::Ipv4Addr;

/// One's-complement sum of `data` as big-endian 16-bit words, unfolded.
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
/// The result stays below 2^32 for any single IPv4 datagram.
pub fn sum(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut acc: u32 = 0;
    for word in &mut chunks {
        acc += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u32::from(*last) << 8;
    }
    acc
}

/// Fold carries back into the low 16 bits.
pub fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

/// Checksum of a plain byte range (IPv4 header, ICMP message).
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum(data))
}

/// Unfolded sum of the 12-byte pseudo-header
/// `{src, dst, zero, protocol, length}`.
pub fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let mut hdr = [0u8; 12];
    hdr[0..4].copy_from_slice(&src.octets());
    hdr[4..8].copy_from_slice(&dst.octets());
    hdr[9] = protocol;
    hdr[10..12].copy_from_slice(&len.to_be_bytes());
    sum(&hdr)
}

/// Checksum of a UDP or TCP segment (header + payload) with its pseudo-header.
///
/// `segment` must cover exactly the bytes counted in the pseudo-header length.
pub fn transport(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let pseudo = pseudo_header(src, dst, protocol, segment.len() as u16);
    !fold(pseudo + sum(segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1071_example() {
        // RFC 1071 section 3: sum is 0xddf2
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(fold(sum(&data)), 0xddf2);
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn test_ipv4_header_vector() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let csum = checksum(&header);
        assert_eq!(csum, 0xb861);

        // Receiver's view: summing with the field filled in yields zero
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn test_odd_length_is_zero_padded() {
        assert_eq!(checksum(&[0xab]), 0x54ff);
        assert_eq!(checksum(&[0xab]), checksum(&[0xab, 0x00]));
    }

    #[test]
    fn test_fold_carries() {
        assert_eq!(fold(0x0001_ffff), 0x0001);
        assert_eq!(fold(0xffff_ffff), 0xffff);
        assert_eq!(fold(0x1234), 0x1234);
    }

    #[test]
    fn test_transport_round_trip() {
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(192, 168, 33, 1);
        // UDP header (checksum zeroed) + odd-length payload
        let mut segment = vec![0x30, 0x39, 0x00, 0x35, 0x00, 0x0d, 0x00, 0x00];
        segment.extend_from_slice(b"hello");

        let csum = transport(src, dst, 17, &segment);
        segment[6..8].copy_from_slice(&csum.to_be_bytes());

        let pseudo = pseudo_header(src, dst, 17, segment.len() as u16);
        assert_eq!(!fold(pseudo + sum(&segment)), 0);
    }
}
