// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Zero-copy TCP header views.

use crate::checksum;
use crate::view::{HeaderError, check_len, get_be16, get_be32, put_be16, put_be32};
use std::net::Ipv4Addr;

/// Minimum TCP header length (data offset 5).
pub const MIN_HEADER_LEN: usize = 20;

/// TCP flag bits, as found in the low byte of the flags field.
pub mod flags {
    /// No more data from sender.
    pub const FIN: u8 = 0x01;
    /// Synchronize sequence numbers.
    pub const SYN: u8 = 0x02;
    /// Reset the connection.
    pub const RST: u8 = 0x04;
    /// Push function.
    pub const PSH: u8 = 0x08;
    /// Acknowledgment field significant.
    pub const ACK: u8 = 0x10;
    /// Urgent pointer field significant.
    pub const URG: u8 = 0x20;
}

const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_DATA_OFFSET: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_WINDOW: usize = 14;
const OFF_CHECKSUM: usize = 16;

macro_rules! tcp_getters {
    () => {
        /// The source port.
        #[must_use]
        pub fn src_port(&self) -> u16 {
            get_be16(self.bytes, OFF_SRC_PORT)
        }

        /// The destination port.
        #[must_use]
        pub fn dst_port(&self) -> u16 {
            get_be16(self.bytes, OFF_DST_PORT)
        }

        /// The sequence number.
        #[must_use]
        pub fn seq(&self) -> u32 {
            get_be32(self.bytes, OFF_SEQ)
        }

        /// The acknowledgment number.
        #[must_use]
        pub fn ack(&self) -> u32 {
            get_be32(self.bytes, OFF_ACK)
        }

        /// Header length in bytes (data offset times four), clamped to the
        /// backing slice.
        #[must_use]
        pub fn header_len(&self) -> usize {
            self.claimed_header_len().min(self.bytes.len())
        }

        /// Header length as claimed by the data-offset field, unclamped.
        /// May exceed the backing slice on malformed segments.
        #[must_use]
        pub fn claimed_header_len(&self) -> usize {
            usize::from(self.bytes[OFF_DATA_OFFSET] >> 4) * 4
        }

        /// The flags byte.
        #[must_use]
        pub fn flags(&self) -> u8 {
            self.bytes[OFF_FLAGS]
        }

        /// The window field.
        #[must_use]
        pub fn window(&self) -> u16 {
            get_be16(self.bytes, OFF_WINDOW)
        }

        /// The checksum field.
        #[must_use]
        pub fn checksum(&self) -> u16 {
            get_be16(self.bytes, OFF_CHECKSUM)
        }

        /// The option bytes between the fixed header and the payload.
        #[must_use]
        pub fn options(&self) -> &[u8] {
            &self.bytes[MIN_HEADER_LEN.min(self.header_len())..self.header_len()]
        }

        /// Read a 32-bit big-endian value at `off` within the option area.
        #[must_use]
        pub fn option_u32(&self, off: usize) -> u32 {
            get_be32(self.bytes, MIN_HEADER_LEN + off)
        }
    };
}

/// Read-only view of a TCP segment (header plus payload).
#[derive(Debug)]
pub struct Tcp<'a> {
    bytes: &'a [u8],
}

impl<'a> Tcp<'a> {
    /// Wrap `bytes`, which must start at a TCP header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when fewer than 20 bytes are available.
    pub fn new(bytes: &'a [u8]) -> Result<Self, HeaderError> {
        check_len(bytes, MIN_HEADER_LEN)?;
        Ok(Tcp { bytes })
    }

    tcp_getters!();
}

/// Mutable view of a TCP segment (header plus payload).
#[derive(Debug)]
pub struct TcpMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> TcpMut<'a> {
    /// Wrap `bytes`, which must start at a TCP header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when fewer than 20 bytes are available.
    pub fn new(bytes: &'a mut [u8]) -> Result<Self, HeaderError> {
        check_len(bytes, MIN_HEADER_LEN)?;
        Ok(TcpMut { bytes })
    }

    tcp_getters!();

    /// Set the source port.
    pub fn set_src_port(&mut self, value: u16) {
        put_be16(self.bytes, OFF_SRC_PORT, value);
    }

    /// Set the destination port.
    pub fn set_dst_port(&mut self, value: u16) {
        put_be16(self.bytes, OFF_DST_PORT, value);
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, value: u32) {
        put_be32(self.bytes, OFF_SEQ, value);
    }

    /// Set the acknowledgment number.
    pub fn set_ack(&mut self, value: u32) {
        put_be32(self.bytes, OFF_ACK, value);
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        put_be16(self.bytes, OFF_CHECKSUM, value);
    }

    /// Write a 32-bit big-endian value at `off` within the option area.
    pub fn set_option_u32(&mut self, off: usize, value: u32) {
        put_be32(self.bytes, MIN_HEADER_LEN + off, value);
    }

    /// Zero the checksum field and recompute it over the whole segment
    /// with the IPv4 pseudo-header.
    pub fn recompute_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
        put_be16(self.bytes, OFF_CHECKSUM, 0);
        let csum = checksum::transport_checksum(src, dst, crate::ip::IpProto::TCP.as_u8(), self.bytes);
        put_be16(self.bytes, OFF_CHECKSUM, csum);
    }
}
