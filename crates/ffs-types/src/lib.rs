#![forbid(unsafe_code)]
//! Shared newtypes, size constants and byte-parsing helpers.
//!
//! Addresses inside the allocator are plain `u64` logical byte offsets;
//! the newtypes here exist for values that must not be mixed with them
//! (transaction ids, filesystem generations, device ids).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SZ_4K: u64 = 4 * 1024;
pub const SZ_16K: u64 = 16 * 1024;
pub const SZ_64K: u64 = 64 * 1024;
pub const SZ_128K: u64 = 128 * 1024;
pub const SZ_1M: u64 = 1024 * 1024;
pub const SZ_2M: u64 = 2 * SZ_1M;
pub const SZ_8M: u64 = 8 * SZ_1M;
pub const SZ_32M: u64 = 32 * SZ_1M;
pub const SZ_64M: u64 = 64 * SZ_1M;
pub const SZ_256M: u64 = 256 * SZ_1M;
pub const SZ_1G: u64 = 1024 * SZ_1M;

/// First superblock copy; everything below it is reserved.
pub const SUPER_INFO_OFFSET: u64 = SZ_64K;
pub const SUPER_INFO_SIZE: u64 = SZ_4K;
/// Number of superblock mirror locations on every device.
pub const SUPER_MIRROR_MAX: u32 = 3;
/// Granularity at which superblock copies are excluded from a block group.
pub const STRIPE_LEN: u64 = SZ_64K;

/// Physical byte offset of superblock mirror `mirror` (0, 1 or 2).
///
/// Mirror 0 lives at 64KiB; mirror `n` at `16KiB << (12 * n)`, which gives
/// 64MiB and 256GiB for the two copies.
#[must_use]
pub fn super_mirror_offset(mirror: u32) -> u64 {
    if mirror == 0 {
        SUPER_INFO_OFFSET
    } else {
        SZ_16K << (12 * mirror)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Filesystem generation: the id of the last committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

/// Device identifier as stored in device extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl TxnId {
    /// The generation a commit of this transaction produces.
    #[must_use]
    pub fn generation(self) -> Generation {
        Generation(self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "devid {}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Append `value` as little-endian bytes.
#[inline]
pub fn put_le_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Align `value` down to `alignment` (which must be a power of two).
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Align `value` up to `alignment` (which must be a power of two).
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// `numerator * percent / 100` without intermediate overflow.
#[must_use]
pub fn mult_perc(value: u64, percent: u64) -> u64 {
    let wide = u128::from(value) * u128::from(percent) / 100;
    u64::try_from(wide).unwrap_or(u64::MAX)
}

/// Format a byte count with a binary unit suffix, for log lines.
#[must_use]
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut unit = 0;
    let mut value = bytes;
    while value >= 1024 && value % 1024 == 0 && unit + 1 < UNITS.len() {
        value /= 1024;
        unit += 1;
    }
    format!("{value}{}", UNITS[unit])
}
