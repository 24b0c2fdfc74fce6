// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The 4-tuple flow identifier.

use core::fmt::{Display, Formatter};
use net::packet::Packet;
use net::HeaderError;
use std::net::Ipv4Addr;

/// A flow identifier: source and destination address and port.
///
/// Addresses are held as [`Ipv4Addr`] and ports as host-order `u16`;
/// conversion to and from network byte order happens exactly once at the
/// packet boundary.  [`FlowId::halfwords`] exposes the big-endian 16-bit
/// view used for checksum deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    /// Source address.
    pub saddr: Ipv4Addr,
    /// Source port (or ICMP identifier).
    pub sport: u16,
    /// Destination address.
    pub daddr: Ipv4Addr,
    /// Destination port (or ICMP identifier).
    pub dport: u16,
}

impl FlowId {
    /// Assemble a flow identifier.
    #[must_use]
    pub const fn new(saddr: Ipv4Addr, sport: u16, daddr: Ipv4Addr, dport: u16) -> FlowId {
        FlowId {
            saddr,
            sport,
            daddr,
            dport,
        }
    }

    /// The identifier of the opposite direction: source and destination
    /// swapped.
    #[must_use]
    pub const fn reverse(self) -> FlowId {
        FlowId {
            saddr: self.daddr,
            sport: self.dport,
            daddr: self.saddr,
            dport: self.sport,
        }
    }

    /// The six halfwords a rewrite touches, in wire order: source
    /// address, destination address, then both ports.
    #[must_use]
    pub fn halfwords(&self) -> [u16; 6] {
        let s = self.saddr.octets();
        let d = self.daddr.octets();
        [
            u16::from_be_bytes([s[0], s[1]]),
            u16::from_be_bytes([s[2], s[3]]),
            u16::from_be_bytes([d[0], d[1]]),
            u16::from_be_bytes([d[2], d[3]]),
            self.sport,
            self.dport,
        ]
    }

    /// Extract the flow identifier of a TCP or UDP packet.  Both
    /// protocols carry their port pair in the first four transport bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the IP header does not parse or the
    /// transport region is shorter than the port pair.
    pub fn from_transport(pkt: &Packet) -> Result<FlowId, HeaderError> {
        let ip = pkt.ipv4()?;
        let t = pkt.transport();
        if t.len() < 4 {
            return Err(HeaderError::Truncated {
                need: 4,
                have: t.len(),
            });
        }
        Ok(FlowId::new(
            ip.src(),
            u16::from_be_bytes([t[0], t[1]]),
            ip.dst(),
            u16::from_be_bytes([t[2], t[3]]),
        ))
    }

    /// Extract the identifier-keyed flow of an ICMP echo packet: the
    /// identifier stands in for both ports.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the headers do not parse.
    pub fn from_icmp_echo(pkt: &Packet) -> Result<FlowId, HeaderError> {
        let ip = pkt.ipv4()?;
        let icmp = pkt.icmp()?;
        let id = icmp.identifier();
        Ok(FlowId::new(ip.src(), id, ip.dst(), id))
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "({}/{}, {}/{})",
            self.saddr, self.sport, self.daddr, self.dport
        )
    }
}
