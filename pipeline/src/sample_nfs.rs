// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Small example network functions.

use crate::static_nf::NetworkFunction;
use net::checksum;
use net::packet::Packet;
use tracing::debug;

/// Forwards every packet untouched.
#[derive(Debug, Clone, Copy)]
pub struct Passthrough;

impl NetworkFunction for Passthrough {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        input
    }
}

/// Logs the addresses of each packet at debug level.
#[derive(Debug, Clone, Copy)]
pub struct InspectHeaders;

impl NetworkFunction for InspectHeaders {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        input.inspect(|pkt| {
            if let Ok(ip) = pkt.ipv4() {
                debug!(
                    "packet {} -> {} proto {} len {}",
                    ip.src(),
                    ip.dst(),
                    ip.protocol(),
                    pkt.len()
                );
            }
        })
    }
}

/// Decrements the IPv4 TTL, updating the header checksum incrementally;
/// drops packets whose TTL reaches zero.
#[derive(Debug, Clone, Copy)]
pub struct DecrementTtl;

impl NetworkFunction for DecrementTtl {
    fn process<'a, Input: Iterator<Item = Packet> + 'a>(
        &'a mut self,
        input: Input,
    ) -> impl Iterator<Item = Packet> + 'a {
        input.filter_map(|mut pkt| {
            let Ok(mut ip) = pkt.ipv4_mut() else {
                return Some(pkt);
            };
            let ttl = ip.ttl();
            if ttl <= 1 {
                debug!("ttl expired, dropping packet from {}", ip.src());
                return None;
            }
            // The TTL shares a halfword with the protocol byte.
            let proto = u16::from(ip.protocol().as_u8());
            let old = (u16::from(ttl) << 8) | proto;
            let new = (u16::from(ttl - 1) << 8) | proto;
            ip.set_ttl(ttl - 1);
            let csum = checksum::update(ip.header_checksum(), old, new);
            ip.set_header_checksum(csum);
            Some(pkt)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkFunction;
    use net::packet::test_utils::udp_packet;
    use std::net::Ipv4Addr;

    #[test]
    fn decrement_ttl_keeps_checksum_valid() {
        let pkt = udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            1234,
            Ipv4Addr::new(10, 0, 0, 2),
            5678,
            b"x",
        );
        let mut nf = DecrementTtl;
        let out: Vec<_> = nf.process(std::iter::once(pkt)).collect();
        let ip = out[0].ipv4().unwrap();
        assert_eq!(ip.ttl(), 63);
        assert!(ip.checksum_valid());
    }
}
