// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The owned packet buffer and its out-of-band metadata.
//!
//! A [`Packet`] starts at the IPv4 header; layer 2 is stripped upstream.
//! The buffer is validated once at construction (version, IHL, total
//! length) and thereafter mutated in place through the header views.  The
//! header length is cached: none of the rewrite paths ever change the IHL.

use crate::icmp4::{Icmp4, Icmp4Mut};
use crate::ipv4::{Ipv4, Ipv4Mut};
use crate::tcp::{Tcp, TcpMut};
use crate::udp::{Udp, UdpMut};
use crate::view::HeaderError;
use std::net::Ipv4Addr;

/// Size of the per-packet annotation area, in bytes.
pub const ANNO_LEN: usize = 16;

/// An error raised when a byte buffer cannot be adopted as a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// The IPv4 header is malformed.
    #[error(transparent)]
    Header(#[from] HeaderError),
    /// The total-length field disagrees with the buffer.
    #[error("total length {total_len} outside buffer of {available} bytes")]
    BadTotalLength {
        /// The total-length field value.
        total_len: u16,
        /// Bytes available in the buffer.
        available: usize,
    },
    /// A tail shrink would remove more bytes than the packet holds.
    #[error("cannot take {take} bytes from a {len} byte packet")]
    TailUnderflow {
        /// Bytes requested to remove.
        take: usize,
        /// Current packet length.
        len: usize,
    },
}

/// Out-of-band metadata carried alongside the packet buffer.
#[derive(Debug, Clone, Default)]
pub struct PacketMeta {
    /// The element input port this packet arrived on.
    pub in_port: u16,
    /// The element output port chosen for this packet.
    pub out_port: u16,
    /// The destination-IP annotation, when stamped.
    pub dst_ip: Option<Ipv4Addr>,
    anno: [u8; ANNO_LEN],
}

impl PacketMeta {
    /// Read one annotation byte.
    #[must_use]
    pub fn anno_u8(&self, off: usize) -> u8 {
        self.anno[off]
    }

    /// Write one annotation byte.
    pub fn set_anno_u8(&mut self, off: usize, value: u8) {
        self.anno[off] = value;
    }
}

/// An owned IPv4 packet plus metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Vec<u8>,
    header_len: usize,
    meta: PacketMeta,
}

impl Packet {
    /// Adopt `data`, which must start at a valid IPv4 header.  Trailing
    /// bytes beyond the total-length field are trimmed.
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] when the header does not parse or the
    /// total length does not fit the buffer.
    pub fn from_ip(mut data: Vec<u8>) -> Result<Packet, PacketError> {
        let ip = Ipv4::new(&data)?;
        let header_len = ip.header_len();
        let total_len = ip.total_len();
        let total = usize::from(total_len);
        if total < header_len || total > data.len() {
            return Err(PacketError::BadTotalLength {
                total_len,
                available: data.len(),
            });
        }
        data.truncate(total);
        Ok(Packet {
            data,
            header_len,
            meta: PacketMeta::default(),
        })
    }

    /// Packet length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the packet holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw packet bytes, starting at the IP header.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The raw packet bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The cached IP header length.
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Offset of the transport header.
    #[must_use]
    pub fn transport_offset(&self) -> usize {
        self.header_len
    }

    /// Bytes from the transport header to the end of the packet.
    #[must_use]
    pub fn transport_length(&self) -> usize {
        self.data.len().saturating_sub(self.header_len)
    }

    /// The transport region of the packet.
    #[must_use]
    pub fn transport(&self) -> &[u8] {
        &self.data[self.header_len.min(self.data.len())..]
    }

    /// The transport region of the packet, mutably.
    pub fn transport_mut(&mut self) -> &mut [u8] {
        let start = self.header_len.min(self.data.len());
        &mut self.data[start..]
    }

    /// View the IPv4 header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] if the buffer no longer parses (only
    /// possible after out-of-band mutation through [`Packet::data_mut`]).
    pub fn ipv4(&self) -> Result<Ipv4<'_>, HeaderError> {
        Ipv4::new(&self.data)
    }

    /// View the IPv4 header mutably.
    ///
    /// # Errors
    ///
    /// See [`Packet::ipv4`].
    pub fn ipv4_mut(&mut self) -> Result<Ipv4Mut<'_>, HeaderError> {
        Ipv4Mut::new(&mut self.data)
    }

    /// View the transport region as TCP.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the region is too short.
    pub fn tcp(&self) -> Result<Tcp<'_>, HeaderError> {
        Tcp::new(self.transport())
    }

    /// View the transport region as TCP, mutably.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the region is too short.
    pub fn tcp_mut(&mut self) -> Result<TcpMut<'_>, HeaderError> {
        TcpMut::new(self.transport_mut())
    }

    /// View the transport region as UDP.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the region is too short.
    pub fn udp(&self) -> Result<Udp<'_>, HeaderError> {
        Udp::new(self.transport())
    }

    /// View the transport region as UDP, mutably.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the region is too short.
    pub fn udp_mut(&mut self) -> Result<UdpMut<'_>, HeaderError> {
        UdpMut::new(self.transport_mut())
    }

    /// View the transport region as ICMPv4.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the region is too short.
    pub fn icmp(&self) -> Result<Icmp4<'_>, HeaderError> {
        Icmp4::new(self.transport())
    }

    /// View the transport region as ICMPv4, mutably.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the region is too short.
    pub fn icmp_mut(&mut self) -> Result<Icmp4Mut<'_>, HeaderError> {
        Icmp4Mut::new(self.transport_mut())
    }

    /// Grow the packet tail by `n` zero bytes.
    pub fn grow_tail(&mut self, n: usize) {
        self.data.resize(self.data.len() + n, 0);
    }

    /// Shrink the packet tail by `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TailUnderflow`] when the packet is shorter
    /// than `n` bytes past its IP header.
    pub fn shrink_tail(&mut self, n: usize) -> Result<(), PacketError> {
        if self.data.len().saturating_sub(n) < self.header_len {
            return Err(PacketError::TailUnderflow {
                take: n,
                len: self.data.len(),
            });
        }
        self.data.truncate(self.data.len() - n);
        Ok(())
    }

    /// The packet metadata.
    #[must_use]
    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    /// The packet metadata, mutably.
    pub fn meta_mut(&mut self) -> &mut PacketMeta {
        &mut self.meta
    }
}

#[cfg(any(test, feature = "test_utils"))]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_panics_doc)]
pub mod test_utils {
    //! Builders producing well-formed packets with correct checksums.

    use super::Packet;
    use crate::checksum;
    use crate::ip::IpProto;
    use std::net::Ipv4Addr;

    fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, proto: IpProto, total_len: u16) -> [u8; 20] {
        let mut h = [0u8; 20];
        h[0] = 0x45;
        h[2..4].copy_from_slice(&total_len.to_be_bytes());
        h[8] = 64; // ttl
        h[9] = proto.as_u8();
        h[12..16].copy_from_slice(&src.octets());
        h[16..20].copy_from_slice(&dst.octets());
        let csum = checksum::checksum(&h);
        h[10..12].copy_from_slice(&csum.to_be_bytes());
        h
    }

    /// Build a packet from a finished transport segment.
    #[must_use]
    pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: IpProto, transport: &[u8]) -> Packet {
        let total = u16::try_from(20 + transport.len()).expect("test packet too large");
        let mut data = ipv4_header(src, dst, proto, total).to_vec();
        data.extend_from_slice(transport);
        Packet::from_ip(data).expect("test packet must parse")
    }

    /// Build a TCP packet with options and payload; all checksums are
    /// correct on return.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn tcp_packet_with_options(
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        options: &[u8],
        payload: &[u8],
    ) -> Packet {
        assert!(options.len() % 4 == 0, "TCP options must be padded");
        assert!(options.len() <= 40, "TCP options too long");
        let header_len = 20 + options.len();
        let mut seg = vec![0u8; header_len];
        seg[0..2].copy_from_slice(&sport.to_be_bytes());
        seg[2..4].copy_from_slice(&dport.to_be_bytes());
        seg[4..8].copy_from_slice(&seq.to_be_bytes());
        seg[8..12].copy_from_slice(&ack.to_be_bytes());
        seg[12] = u8::try_from(header_len / 4).unwrap() << 4;
        seg[13] = flags;
        seg[14..16].copy_from_slice(&8192u16.to_be_bytes());
        seg[20..].copy_from_slice(options);
        seg.extend_from_slice(payload);
        let csum = checksum::transport_checksum(src, dst, IpProto::TCP.as_u8(), &seg);
        seg[16..18].copy_from_slice(&csum.to_be_bytes());
        ipv4_packet(src, dst, IpProto::TCP, &seg)
    }

    /// Build an option-less TCP packet.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn tcp_packet(
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> Packet {
        tcp_packet_with_options(src, sport, dst, dport, seq, ack, flags, &[], payload)
    }

    /// Build a UDP packet with a valid checksum.
    #[must_use]
    pub fn udp_packet(
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        payload: &[u8],
    ) -> Packet {
        let len = u16::try_from(8 + payload.len()).expect("test payload too large");
        let mut seg = vec![0u8; 8];
        seg[0..2].copy_from_slice(&sport.to_be_bytes());
        seg[2..4].copy_from_slice(&dport.to_be_bytes());
        seg[4..6].copy_from_slice(&len.to_be_bytes());
        seg.extend_from_slice(payload);
        let csum = match checksum::transport_checksum(src, dst, IpProto::UDP.as_u8(), &seg) {
            0 => 0xFFFF, // transmitted as all-ones when the sum is zero (RFC 768)
            c => c,
        };
        seg[6..8].copy_from_slice(&csum.to_be_bytes());
        ipv4_packet(src, dst, IpProto::UDP, &seg)
    }

    /// Build a UDP packet with the checksum disabled (field zero).
    #[must_use]
    pub fn udp_packet_no_checksum(
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        payload: &[u8],
    ) -> Packet {
        let len = u16::try_from(8 + payload.len()).expect("test payload too large");
        let mut seg = vec![0u8; 8];
        seg[0..2].copy_from_slice(&sport.to_be_bytes());
        seg[2..4].copy_from_slice(&dport.to_be_bytes());
        seg[4..6].copy_from_slice(&len.to_be_bytes());
        seg.extend_from_slice(payload);
        ipv4_packet(src, dst, IpProto::UDP, &seg)
    }

    /// Build an ICMP echo request or reply.
    #[must_use]
    pub fn icmp_echo_packet(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        icmp_type: u8,
        identifier: u16,
        seq_no: u16,
        payload: &[u8],
    ) -> Packet {
        let mut seg = vec![0u8; 8];
        seg[0] = icmp_type;
        seg[4..6].copy_from_slice(&identifier.to_be_bytes());
        seg[6..8].copy_from_slice(&seq_no.to_be_bytes());
        seg.extend_from_slice(payload);
        let csum = checksum::checksum(&seg);
        seg[2..4].copy_from_slice(&csum.to_be_bytes());
        ipv4_packet(src, dst, IpProto::ICMP, &seg)
    }

    /// Build an ICMP error message embedding the given packet's bytes.
    #[must_use]
    pub fn icmp_error_packet(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        icmp_type: u8,
        code: u8,
        embedded: &Packet,
    ) -> Packet {
        let mut seg = vec![0u8; 8];
        seg[0] = icmp_type;
        seg[1] = code;
        // An error message quotes the embedded IP header plus at least the
        // first 8 bytes of its payload; quoting the whole packet is legal
        // and keeps tests simple.
        seg.extend_from_slice(embedded.data());
        let csum = checksum::checksum(&seg);
        seg[2..4].copy_from_slice(&csum.to_be_bytes());
        ipv4_packet(src, dst, IpProto::ICMP, &seg)
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::{tcp_packet, udp_packet};
    use super::*;
    use crate::checksum;

    #[test]
    fn adopt_trims_to_total_length() {
        let mut pkt = tcp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            80,
            1000,
            0,
            crate::tcp::flags::SYN,
            b"",
        );
        assert_eq!(pkt.len(), 40);
        assert_eq!(pkt.transport_length(), 20);
        assert_eq!(pkt.tcp().unwrap().src_port(), 33000);

        let mut padded = pkt.data().to_vec();
        padded.extend_from_slice(&[0u8; 6]); // ethernet-style padding
        let readopted = Packet::from_ip(padded).unwrap();
        assert_eq!(readopted.len(), 40);

        pkt.grow_tail(4);
        assert_eq!(pkt.len(), 44);
        pkt.shrink_tail(4).unwrap();
        assert_eq!(pkt.len(), 40);
        assert!(pkt.shrink_tail(100).is_err());
    }

    #[test]
    fn bad_total_length_is_rejected() {
        let pkt = udp_packet(
            Ipv4Addr::new(1, 1, 1, 1),
            5000,
            Ipv4Addr::new(2, 2, 2, 2),
            53,
            b"x",
        );
        let mut data = pkt.data().to_vec();
        data[2] = 0xFF;
        data[3] = 0xFF;
        assert!(matches!(
            Packet::from_ip(data).unwrap_err(),
            PacketError::BadTotalLength { .. }
        ));
    }

    #[test]
    fn annotations_roundtrip() {
        let mut pkt = udp_packet(
            Ipv4Addr::new(1, 1, 1, 1),
            5000,
            Ipv4Addr::new(2, 2, 2, 2),
            53,
            b"",
        );
        pkt.meta_mut().set_anno_u8(3, 0x7E);
        pkt.meta_mut().dst_ip = Some(Ipv4Addr::new(9, 9, 9, 9));
        assert_eq!(pkt.meta().anno_u8(3), 0x7E);
        assert_eq!(pkt.meta().dst_ip, Some(Ipv4Addr::new(9, 9, 9, 9)));
    }

    #[test]
    fn udp_checksum_verifies_against_recompute() {
        let pkt = udp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            33000,
            Ipv4Addr::new(2, 0, 0, 2),
            53,
            b"payload",
        );
        let udp = pkt.udp().unwrap();
        let mut seg = pkt.transport().to_vec();
        seg[6] = 0;
        seg[7] = 0;
        let ip = pkt.ipv4().unwrap();
        assert_eq!(
            udp.checksum(),
            checksum::transport_checksum(ip.src(), ip.dst(), 17, &seg)
        );
    }
}
