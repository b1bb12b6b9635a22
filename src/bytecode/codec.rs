//! Fixed-width integer access for the binary image.
//!
//! All multi-byte fields in a cinder image are big-endian on the wire.
//! How those bytes are accessed is a build-time choice, selected by
//! exactly one of the cargo features:
//!
//! - `codec-le` (default): native little-endian load, then a byte swap.
//!   For targets with unrestricted unaligned access, e.g. Cortex-M4, x86.
//! - `codec-be`: direct big-endian load, unrestricted access.
//! - `codec-be-aligned`: byte-by-byte assembly, for targets that fault
//!   on unaligned multi-byte loads.
//!
//! Every mode decodes the same wire bytes to the same value, and encode
//! is the exact inverse of decode. This module has no runtime failure
//! modes; callers guarantee the slice is long enough.

#[cfg(not(any(
    feature = "codec-le",
    feature = "codec-be",
    feature = "codec-be-aligned"
)))]
compile_error!("select a codec access mode: codec-le, codec-be or codec-be-aligned");

#[cfg(any(
    all(feature = "codec-le", feature = "codec-be"),
    all(feature = "codec-le", feature = "codec-be-aligned"),
    all(feature = "codec-be", feature = "codec-be-aligned"),
))]
compile_error!("codec access modes are mutually exclusive: enable exactly one");

/// Decode a big-endian u32 from the first four bytes of `b`.
#[cfg(feature = "codec-le")]
pub fn read_u32(b: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[..4]);
    u32::from_le_bytes(raw).swap_bytes()
}

/// Decode a big-endian u32 from the first four bytes of `b`.
#[cfg(feature = "codec-be")]
pub fn read_u32(b: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[..4]);
    u32::from_be_bytes(raw)
}

/// Decode a big-endian u32 from the first four bytes of `b`.
#[cfg(feature = "codec-be-aligned")]
pub fn read_u32(b: &[u8]) -> u32 {
    let mut x = b[0] as u32;
    x = (x << 8) | b[1] as u32;
    x = (x << 8) | b[2] as u32;
    (x << 8) | b[3] as u32
}

/// Decode a big-endian u16 from the first two bytes of `b`.
#[cfg(feature = "codec-le")]
pub fn read_u16(b: &[u8]) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&b[..2]);
    u16::from_le_bytes(raw).swap_bytes()
}

/// Decode a big-endian u16 from the first two bytes of `b`.
#[cfg(feature = "codec-be")]
pub fn read_u16(b: &[u8]) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&b[..2]);
    u16::from_be_bytes(raw)
}

/// Decode a big-endian u16 from the first two bytes of `b`.
#[cfg(feature = "codec-be-aligned")]
pub fn read_u16(b: &[u8]) -> u16 {
    ((b[0] as u16) << 8) | b[1] as u16
}

/// Encode `v` big-endian into the first four bytes of `d`.
///
/// Written byte-by-byte in every mode, like the original encoder.
pub fn write_u32(v: u32, d: &mut [u8]) {
    d[0] = (v >> 24) as u8;
    d[1] = (v >> 16) as u8;
    d[2] = (v >> 8) as u8;
    d[3] = v as u8;
}

/// Encode `v` big-endian into the first two bytes of `d`.
pub fn write_u16(v: u16, d: &mut [u8]) {
    d[0] = (v >> 8) as u8;
    d[1] = v as u8;
}
