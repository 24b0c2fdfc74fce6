// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Zero-copy ICMPv4 header views.
//!
//! The rewriters care about two shapes: echo requests/replies (whose
//! identifier doubles as a port-like key) and error messages carrying an
//! embedded IP header at a fixed 8-byte offset.

use crate::checksum;
use crate::view::{HeaderError, check_len, get_be16, put_be16};

/// ICMP header length for the message types handled here.
pub const HEADER_LEN: usize = 8;

/// Echo reply.
pub const ECHO_REPLY: u8 = 0;
/// Destination unreachable.
pub const DEST_UNREACHABLE: u8 = 3;
/// Source quench.
pub const SOURCE_QUENCH: u8 = 4;
/// Redirect.
pub const REDIRECT: u8 = 5;
/// Echo request.
pub const ECHO: u8 = 8;
/// Time exceeded.
pub const TIME_EXCEEDED: u8 = 11;
/// Parameter problem.
pub const PARAMETER_PROBLEM: u8 = 12;

/// True for the error message types that carry an embedded IP header.
#[must_use]
pub fn is_error_message(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        DEST_UNREACHABLE | SOURCE_QUENCH | REDIRECT | TIME_EXCEEDED | PARAMETER_PROBLEM
    )
}

const OFF_TYPE: usize = 0;
const OFF_CODE: usize = 1;
const OFF_CHECKSUM: usize = 2;
const OFF_IDENTIFIER: usize = 4;
const OFF_SEQ_NO: usize = 6;

macro_rules! icmp_getters {
    () => {
        /// The message type.
        #[must_use]
        pub fn icmp_type(&self) -> u8 {
            self.bytes[OFF_TYPE]
        }

        /// The message code.
        #[must_use]
        pub fn code(&self) -> u8 {
            self.bytes[OFF_CODE]
        }

        /// The checksum field.
        #[must_use]
        pub fn checksum(&self) -> u16 {
            get_be16(self.bytes, OFF_CHECKSUM)
        }

        /// The echo identifier.
        #[must_use]
        pub fn identifier(&self) -> u16 {
            get_be16(self.bytes, OFF_IDENTIFIER)
        }

        /// The echo sequence number.
        #[must_use]
        pub fn seq_no(&self) -> u16 {
            get_be16(self.bytes, OFF_SEQ_NO)
        }
    };
}

/// Read-only view of an ICMPv4 message.
#[derive(Debug)]
pub struct Icmp4<'a> {
    bytes: &'a [u8],
}

impl<'a> Icmp4<'a> {
    /// Wrap `bytes`, which must start at an ICMPv4 header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when fewer than 8 bytes are available.
    pub fn new(bytes: &'a [u8]) -> Result<Self, HeaderError> {
        check_len(bytes, HEADER_LEN)?;
        Ok(Icmp4 { bytes })
    }

    icmp_getters!();
}

/// Mutable view of an ICMPv4 message.
#[derive(Debug)]
pub struct Icmp4Mut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Icmp4Mut<'a> {
    /// Wrap `bytes`, which must start at an ICMPv4 header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when fewer than 8 bytes are available.
    pub fn new(bytes: &'a mut [u8]) -> Result<Self, HeaderError> {
        check_len(bytes, HEADER_LEN)?;
        Ok(Icmp4Mut { bytes })
    }

    icmp_getters!();

    /// Set the echo identifier.
    pub fn set_identifier(&mut self, value: u16) {
        put_be16(self.bytes, OFF_IDENTIFIER, value);
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        put_be16(self.bytes, OFF_CHECKSUM, value);
    }

    /// Zero the checksum field and recompute it over the whole message.
    /// ICMP checksums do not cover a pseudo-header.
    pub fn recompute_checksum(&mut self) {
        put_be16(self.bytes, OFF_CHECKSUM, 0);
        let csum = checksum::checksum(self.bytes);
        put_be16(self.bytes, OFF_CHECKSUM, csum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_messages() {
        assert!(is_error_message(DEST_UNREACHABLE));
        assert!(is_error_message(TIME_EXCEEDED));
        assert!(is_error_message(REDIRECT));
        assert!(!is_error_message(ECHO));
        assert!(!is_error_message(ECHO_REPLY));
    }

    #[test]
    fn echo_fields_roundtrip() {
        let mut bytes = vec![0u8; 16];
        bytes[OFF_TYPE] = ECHO;
        let mut icmp = Icmp4Mut::new(&mut bytes).unwrap();
        icmp.set_identifier(0x4242);
        icmp.recompute_checksum();
        assert_eq!(icmp.icmp_type(), ECHO);
        assert_eq!(icmp.identifier(), 0x4242);

        // A valid ICMP checksum sums (with the field included) to 0xFFFF.
        assert_eq!(
            checksum::fold(checksum::sum_be_words(&bytes)),
            0xFFFF
        );
    }
}
