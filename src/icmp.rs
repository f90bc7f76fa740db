//! ICMP echo (ping) responder.
//!
//! The teacher delegates all wire parsing to `etherparse` but that crate's
//! 0.13 API has no ICMP support, so this module follows the same
//! byte-at-a-time discipline `splax-s-splax_os`'s `kernel/src/net/icmp.rs`
//! uses by hand.

use std::net::Ipv4Addr;

use etherparse::{Ipv4Header, Ipv4HeaderSlice};
use log::trace;

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;

/// Builds the IPv4+ICMP reply to an Echo Request addressed to `self_addr`,
/// or `None` if `payload` isn't a well-formed Echo Request for this stack.
pub fn echo_reply(ip4h: &Ipv4HeaderSlice, payload: &[u8], self_addr: Ipv4Addr) -> Option<Vec<u8>> {
    if ip4h.destination_addr() != self_addr {
        return None;
    }

    if payload.len() < 8 || payload[0] != ECHO_REQUEST || payload[1] != 0 {
        return None;
    }

    let mut reply = payload.to_vec();
    reply[0] = ECHO_REPLY;
    reply[2] = 0;
    reply[3] = 0;

    let sum = checksum(&reply);
    reply[2] = (sum >> 8) as u8;
    reply[3] = (sum & 0xff) as u8;

    let ip4_reply = Ipv4Header::new(reply.len() as u16, 64, 1, ip4h.destination(), ip4h.source());

    let mut buf = Vec::with_capacity(20 + reply.len());
    ip4_reply.write(&mut buf).ok()?;
    buf.extend_from_slice(&reply);

    trace!("replying to ICMP echo from {:?}", ip4h.source_addr());

    Some(buf)
}

/// RFC 1071 one's-complement checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = *chunks.remainder() {
        sum += (last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_zeroes_is_all_ones() {
        assert_eq!(checksum(&[0u8; 8]), 0xffff);
    }

    #[test]
    fn echo_reply_rejects_non_echo_request() {
        // type = 0 (echo reply, not a request)
        let payload = [0u8, 0, 0, 0, 0, 1, 0, 2];
        let ip4 = Ipv4Header::new(payload.len() as u16, 64, 1, [10, 0, 0, 1], [10, 0, 0, 2]);
        let mut buf = Vec::new();
        ip4.write(&mut buf).unwrap();
        let slice = Ipv4HeaderSlice::from_slice(&buf).unwrap();

        assert!(echo_reply(&slice, &payload, Ipv4Addr::new(10, 0, 0, 2)).is_none());
    }

    #[test]
    fn echo_reply_rejects_request_for_a_different_address() {
        let payload = [ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 2];
        let ip4 = Ipv4Header::new(payload.len() as u16, 64, 1, [10, 0, 0, 1], [10, 0, 0, 2]);
        let mut buf = Vec::new();
        ip4.write(&mut buf).unwrap();
        let slice = Ipv4HeaderSlice::from_slice(&buf).unwrap();

        assert!(echo_reply(&slice, &payload, Ipv4Addr::new(10, 0, 0, 99)).is_none());
    }
}
