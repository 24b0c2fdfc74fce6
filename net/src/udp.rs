// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Zero-copy UDP header views.

use crate::view::{HeaderError, check_len, get_be16, put_be16};

/// UDP header length.
pub const HEADER_LEN: usize = 8;

const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_LENGTH: usize = 4;
const OFF_CHECKSUM: usize = 6;

macro_rules! udp_getters {
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

        /// The length field (header plus payload).
        #[must_use]
        pub fn length(&self) -> u16 {
            get_be16(self.bytes, OFF_LENGTH)
        }

        /// The checksum field.  Zero means "no checksum" (RFC 768).
        #[must_use]
        pub fn checksum(&self) -> u16 {
            get_be16(self.bytes, OFF_CHECKSUM)
        }
    };
}

/// Read-only view of a UDP datagram.
#[derive(Debug)]
pub struct Udp<'a> {
    bytes: &'a [u8],
}

impl<'a> Udp<'a> {
    /// Wrap `bytes`, which must start at a UDP header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when fewer than 8 bytes are available.
    pub fn new(bytes: &'a [u8]) -> Result<Self, HeaderError> {
        check_len(bytes, HEADER_LEN)?;
        Ok(Udp { bytes })
    }

    udp_getters!();
}

/// Mutable view of a UDP datagram.
#[derive(Debug)]
pub struct UdpMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> UdpMut<'a> {
    /// Wrap `bytes`, which must start at a UDP header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when fewer than 8 bytes are available.
    pub fn new(bytes: &'a mut [u8]) -> Result<Self, HeaderError> {
        check_len(bytes, HEADER_LEN)?;
        Ok(UdpMut { bytes })
    }

    udp_getters!();

    /// Set the source port.
    pub fn set_src_port(&mut self, value: u16) {
        put_be16(self.bytes, OFF_SRC_PORT, value);
    }

    /// Set the destination port.
    pub fn set_dst_port(&mut self, value: u16) {
        put_be16(self.bytes, OFF_DST_PORT, value);
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        put_be16(self.bytes, OFF_CHECKSUM, value);
    }
}
