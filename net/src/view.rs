// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Shared plumbing for the raw header views.

/// An error raised when a byte slice cannot back the requested header view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// The slice is shorter than the fixed part of the header.
    #[error("header truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required by the header.
        need: usize,
        /// Bytes available in the slice.
        have: usize,
    },
    /// The version nibble is not 4.
    #[error("not an IPv4 header (version {0})")]
    BadVersion(u8),
    /// The IHL field describes a header that is too short or does not fit.
    #[error("bad IPv4 header length {0}")]
    BadHeaderLength(u8),
}

pub(crate) fn check_len(bytes: &[u8], need: usize) -> Result<(), HeaderError> {
    if bytes.len() < need {
        return Err(HeaderError::Truncated {
            need,
            have: bytes.len(),
        });
    }
    Ok(())
}

pub(crate) fn get_be16(bytes: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([bytes[off], bytes[off + 1]])
}

pub(crate) fn put_be16(bytes: &mut [u8], off: usize, value: u16) {
    bytes[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn get_be32(bytes: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

pub(crate) fn put_be32(bytes: &mut [u8], off: usize, value: u32) {
    bytes[off..off + 4].copy_from_slice(&value.to_be_bytes());
}
