//! Rolling CRC accumulator used for frame hashes and GameLogic CRCs.
//!
//! Every peer must produce bit-identical digests for identical state, so the mixing step is a
//! wire-compatibility artifact and must not change:
//!
//! ```text
//! crc = crc.rotate_left(1) + word        (wrapping)
//! ```
//!
//! Values are fed as byte runs. Each primitive is written little-endian and fed as one run:
//! complete 4-byte groups are read as little-endian words, and a trailing 1-3 byte remainder is
//! packed high-first into one zero-padded word.
//!
//! # Example
//!
//! ```
//! use fortress_lockstep::CrcAccumulator;
//!
//! let mut crc = CrcAccumulator::new();
//! crc.add_unsigned_int(0x0102_0304);
//! assert_eq!(crc.value(), 0x0102_0304);
//! crc.add_unsigned_int(0x0a0b_0c0d);
//! assert_eq!(crc.value(), 0x0c0f_1215);
//! ```

use serde::Serialize;

use crate::network::codec::{encode, CodecError};

/// The rolling accumulator. Starts at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrcAccumulator {
    crc: u32,
}

impl CrcAccumulator {
    /// Creates an accumulator with value 0.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { crc: 0 }
    }

    /// The current digest.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.crc
    }

    #[inline]
    fn add_word(&mut self, word: u32) {
        self.crc = self.crc.rotate_left(1).wrapping_add(word);
    }

    /// Feeds a run of bytes.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut words = bytes.chunks_exact(4);
        for word in &mut words {
            let value = word
                .iter()
                .rev()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
            self.add_word(value);
        }
        let tail = words.remainder();
        if !tail.is_empty() {
            let value = tail
                .iter()
                .enumerate()
                .fold(0u32, |acc, (i, &b)| acc | (u32::from(b) << (24 - 8 * i)));
            self.add_word(value);
        }
    }

    /// Feeds one byte.
    pub fn add_unsigned_byte(&mut self, value: u8) {
        self.add_bytes(&[value]);
    }

    /// Feeds a signed byte.
    pub fn add_byte(&mut self, value: i8) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Feeds a bool as one byte (0 or 1).
    pub fn add_bool(&mut self, value: bool) {
        self.add_unsigned_byte(u8::from(value));
    }

    /// Feeds a `u16`.
    pub fn add_unsigned_short(&mut self, value: u16) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Feeds an `i16`.
    pub fn add_short(&mut self, value: i16) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Feeds a `u32`.
    pub fn add_unsigned_int(&mut self, value: u32) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Feeds an `i32`.
    pub fn add_int(&mut self, value: i32) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Feeds a `u64` as two words, low word first.
    pub fn add_unsigned_int64(&mut self, value: u64) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Feeds an `f32` by its bit pattern.
    pub fn add_real(&mut self, value: f32) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Feeds an ASCII string: one length byte followed by the bytes.
    ///
    /// Strings longer than 255 bytes are truncated, matching the one-byte length prefix.
    pub fn add_ascii_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(usize::from(u8::MAX));
        self.add_unsigned_byte(len as u8);
        self.add_bytes(&bytes[..len]);
    }

    /// Feeds a string as UTF-16: one unit-count byte followed by the little-endian units.
    pub fn add_unicode_string(&mut self, value: &str) {
        let units: Vec<u16> = value.encode_utf16().take(usize::from(u8::MAX)).collect();
        self.add_unsigned_byte(units.len() as u8);
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        self.add_bytes(&bytes);
    }

    /// Feeds the fixed-int bincode encoding of `value`.
    ///
    /// Convenient for section writers that keep their state in serde types.
    pub fn add_serialized<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let bytes = encode(value)?;
        self.add_bytes(&bytes);
        Ok(())
    }
}

/// Computes the accumulator digest of a serializable value in one call.
///
/// # Example
///
/// ```
/// use fortress_lockstep::crc::checksum_of;
///
/// let a = checksum_of(&(1u32, 2u32)).unwrap();
/// assert_eq!(a, checksum_of(&(1u32, 2u32)).unwrap());
/// ```
pub fn checksum_of<T: Serialize>(value: &T) -> Result<u32, CodecError> {
    let mut crc = CrcAccumulator::new();
    crc.add_serialized(value)?;
    Ok(crc.value())
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_int_vectors() {
        let mut crc = CrcAccumulator::new();
        crc.add_unsigned_int(0x0102_0304);
        assert_eq!(crc.value(), 0x0102_0304);
        crc.add_unsigned_int(0x0a0b_0c0d);
        assert_eq!(crc.value(), 0x0c0f_1215);
    }

    #[test]
    fn unsigned_short_vector() {
        let mut crc = CrcAccumulator::new();
        crc.add_unsigned_short(0xabcd);
        assert_eq!(crc.value(), 0xcdab_0000);
    }

    #[test]
    fn ascii_string_vector() {
        let mut crc = CrcAccumulator::new();
        crc.add_ascii_string("ABC");
        assert_eq!(crc.value(), 0x4742_4300);
    }

    // Widths beyond the vectors above are pinned here so any change is caught.

    #[test]
    fn unsigned_byte_is_packed_high() {
        let mut crc = CrcAccumulator::new();
        crc.add_unsigned_byte(0x7f);
        assert_eq!(crc.value(), 0x7f00_0000);
    }

    #[test]
    fn bool_is_one_byte() {
        let mut crc = CrcAccumulator::new();
        crc.add_bool(true);
        assert_eq!(crc.value(), 0x0100_0000);
    }

    #[test]
    fn int64_feeds_low_word_first() {
        let mut crc = CrcAccumulator::new();
        crc.add_unsigned_int64(0x0000_0002_0000_0001);
        // rotl(1, 1) + 2
        assert_eq!(crc.value(), 4);
    }

    #[test]
    fn negative_int_uses_twos_complement() {
        let mut crc = CrcAccumulator::new();
        crc.add_int(-1);
        assert_eq!(crc.value(), 0xffff_ffff);
        crc.add_int(1);
        // rotl(0xffffffff, 1) = 0xffffffff, + 1 wraps to 0
        assert_eq!(crc.value(), 0);
    }

    #[test]
    fn real_uses_bit_pattern() {
        let mut crc = CrcAccumulator::new();
        crc.add_real(1.0);
        assert_eq!(crc.value(), 0x3f80_0000);
    }

    #[test]
    fn unicode_string_feeds_units() {
        let mut crc = CrcAccumulator::new();
        crc.add_unicode_string("A");
        // length byte 0x01000000, then [0x41, 0x00] packed high
        assert_eq!(crc.value(), 0x0200_0000u32.wrapping_add(0x4100_0000));
    }

    #[test]
    fn high_bit_rotates_into_low_bit() {
        let mut crc = CrcAccumulator::new();
        crc.add_unsigned_int(0x8000_0000);
        crc.add_unsigned_int(0);
        assert_eq!(crc.value(), 1);
    }

    #[test]
    fn long_ascii_strings_are_truncated() {
        let long = "x".repeat(300);
        let mut a = CrcAccumulator::new();
        a.add_ascii_string(&long);
        let mut b = CrcAccumulator::new();
        b.add_ascii_string(&long[..255]);
        assert_eq!(a, b);
    }

    #[test]
    fn serialized_values_are_deterministic() {
        let a = checksum_of(&(7u32, "state")).unwrap();
        let b = checksum_of(&(7u32, "state")).unwrap();
        let c = checksum_of(&(8u32, "state")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
