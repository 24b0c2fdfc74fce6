// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Zero-copy IPv4 header views.

use crate::checksum;
use crate::ip::IpProto;
use crate::view::{HeaderError, check_len, get_be16, get_be32, put_be16, put_be32};
use std::net::Ipv4Addr;

/// Minimum IPv4 header length (IHL 5).
pub const MIN_HEADER_LEN: usize = 20;

const OFF_TOTAL_LEN: usize = 2;
const OFF_IDENT: usize = 4;
const OFF_FLAGS_FRAG: usize = 6;
const OFF_TTL: usize = 8;
const OFF_PROTO: usize = 9;
const OFF_CHECKSUM: usize = 10;
const OFF_SRC: usize = 12;
const OFF_DST: usize = 16;

/// Fragment offset mask within the flags/fragment halfword.
const FRAG_OFFSET_MASK: u16 = 0x1FFF;
/// More-fragments flag within the flags/fragment halfword.
const FRAG_MORE: u16 = 0x2000;

fn validate(bytes: &[u8]) -> Result<usize, HeaderError> {
    check_len(bytes, MIN_HEADER_LEN)?;
    let version = bytes[0] >> 4;
    if version != 4 {
        return Err(HeaderError::BadVersion(version));
    }
    let ihl = bytes[0] & 0x0F;
    let header_len = usize::from(ihl) * 4;
    if ihl < 5 || bytes.len() < header_len {
        return Err(HeaderError::BadHeaderLength(ihl));
    }
    Ok(header_len)
}

macro_rules! ipv4_getters {
    () => {
        /// Header length in bytes (IHL times four).
        #[must_use]
        pub fn header_len(&self) -> usize {
            self.header_len
        }

        /// The total-length field.
        #[must_use]
        pub fn total_len(&self) -> u16 {
            get_be16(self.bytes, OFF_TOTAL_LEN)
        }

        /// The identification field.
        #[must_use]
        pub fn ident(&self) -> u16 {
            get_be16(self.bytes, OFF_IDENT)
        }

        /// The combined flags and fragment-offset halfword.
        #[must_use]
        pub fn flags_fragment(&self) -> u16 {
            get_be16(self.bytes, OFF_FLAGS_FRAG)
        }

        /// True for unfragmented packets and first fragments.
        #[must_use]
        pub fn is_first_fragment(&self) -> bool {
            self.flags_fragment() & FRAG_OFFSET_MASK == 0
        }

        /// True when the more-fragments flag is set.
        #[must_use]
        pub fn more_fragments(&self) -> bool {
            self.flags_fragment() & FRAG_MORE != 0
        }

        /// The time-to-live field.
        #[must_use]
        pub fn ttl(&self) -> u8 {
            self.bytes[OFF_TTL]
        }

        /// The protocol field.
        #[must_use]
        pub fn protocol(&self) -> IpProto {
            IpProto(self.bytes[OFF_PROTO])
        }

        /// The header checksum field.
        #[must_use]
        pub fn header_checksum(&self) -> u16 {
            get_be16(self.bytes, OFF_CHECKSUM)
        }

        /// The source address.
        #[must_use]
        pub fn src(&self) -> Ipv4Addr {
            Ipv4Addr::from(get_be32(self.bytes, OFF_SRC))
        }

        /// The destination address.
        #[must_use]
        pub fn dst(&self) -> Ipv4Addr {
            Ipv4Addr::from(get_be32(self.bytes, OFF_DST))
        }

        /// True when the header checksum matches a full recomputation.
        #[must_use]
        pub fn checksum_valid(&self) -> bool {
            checksum::fold(checksum::sum_be_words(&self.bytes[..self.header_len])) == 0xFFFF
        }
    };
}

/// Read-only view of an IPv4 header.
#[derive(Debug)]
pub struct Ipv4<'a> {
    bytes: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4<'a> {
    /// Wrap `bytes`, which must start at an IPv4 header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the slice is too short, the version
    /// nibble is not 4, or the IHL does not fit the slice.
    pub fn new(bytes: &'a [u8]) -> Result<Self, HeaderError> {
        let header_len = validate(bytes)?;
        Ok(Ipv4 { bytes, header_len })
    }

    ipv4_getters!();
}

/// Mutable view of an IPv4 header.
#[derive(Debug)]
pub struct Ipv4Mut<'a> {
    bytes: &'a mut [u8],
    header_len: usize,
}

impl<'a> Ipv4Mut<'a> {
    /// Wrap `bytes`, which must start at an IPv4 header.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] when the slice cannot back the view; see
    /// [`Ipv4::new`].
    pub fn new(bytes: &'a mut [u8]) -> Result<Self, HeaderError> {
        let header_len = validate(bytes)?;
        Ok(Ipv4Mut { bytes, header_len })
    }

    ipv4_getters!();

    /// Set the total-length field.
    pub fn set_total_len(&mut self, value: u16) {
        put_be16(self.bytes, OFF_TOTAL_LEN, value);
    }

    /// Set the header checksum field.
    pub fn set_header_checksum(&mut self, value: u16) {
        put_be16(self.bytes, OFF_CHECKSUM, value);
    }

    /// Set the time-to-live field.
    pub fn set_ttl(&mut self, value: u8) {
        self.bytes[OFF_TTL] = value;
    }

    /// Set the source address.
    pub fn set_src(&mut self, addr: Ipv4Addr) {
        put_be32(self.bytes, OFF_SRC, u32::from(addr));
    }

    /// Set the destination address.
    pub fn set_dst(&mut self, addr: Ipv4Addr) {
        put_be32(self.bytes, OFF_DST, u32::from(addr));
    }

    /// Zero the checksum field and recompute it over the header.
    pub fn recompute_checksum(&mut self) {
        put_be16(self.bytes, OFF_CHECKSUM, 0);
        let csum = checksum::checksum(&self.bytes[..self.header_len]);
        put_be16(self.bytes, OFF_CHECKSUM, csum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut bytes = vec![0u8; 20];
        bytes[0] = 0x45;
        put_be16(&mut bytes, OFF_TOTAL_LEN, 40);
        bytes[OFF_TTL] = 64;
        bytes[OFF_PROTO] = 6;
        put_be32(&mut bytes, OFF_SRC, u32::from(Ipv4Addr::new(10, 0, 0, 2)));
        put_be32(&mut bytes, OFF_DST, u32::from(Ipv4Addr::new(2, 0, 0, 2)));
        bytes
    }

    #[test]
    fn parses_fields() {
        let bytes = sample_header();
        let ip = Ipv4::new(&bytes).unwrap();
        assert_eq!(ip.header_len(), 20);
        assert_eq!(ip.total_len(), 40);
        assert_eq!(ip.protocol(), IpProto::TCP);
        assert_eq!(ip.src(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.dst(), Ipv4Addr::new(2, 0, 0, 2));
        assert!(ip.is_first_fragment());
    }

    #[test]
    fn rejects_bad_version_and_length() {
        let mut bytes = sample_header();
        bytes[0] = 0x65;
        assert_eq!(Ipv4::new(&bytes).unwrap_err(), HeaderError::BadVersion(6));
        bytes[0] = 0x4F; // IHL 15 does not fit a 20-byte slice
        assert_eq!(
            Ipv4::new(&bytes).unwrap_err(),
            HeaderError::BadHeaderLength(15)
        );
        assert!(matches!(
            Ipv4::new(&bytes[..10]).unwrap_err(),
            HeaderError::Truncated { .. }
        ));
    }

    #[test]
    fn fragment_bits() {
        let mut bytes = sample_header();
        put_be16(&mut bytes, OFF_FLAGS_FRAG, FRAG_MORE);
        let ip = Ipv4::new(&bytes).unwrap();
        assert!(ip.is_first_fragment());
        assert!(ip.more_fragments());

        put_be16(&mut bytes, OFF_FLAGS_FRAG, 0x0010);
        let ip = Ipv4::new(&bytes).unwrap();
        assert!(!ip.is_first_fragment());
    }

    #[test]
    fn recomputed_checksum_matches_etherparse() {
        let mut bytes = sample_header();
        let mut ip = Ipv4Mut::new(&mut bytes).unwrap();
        ip.recompute_checksum();
        assert!(ip.checksum_valid());

        let reference = etherparse::Ipv4Header::from_slice(&bytes).unwrap().0;
        assert_eq!(
            reference.calc_header_checksum(),
            Ipv4::new(&bytes).unwrap().header_checksum()
        );
    }
}
