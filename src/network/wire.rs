//! Little-endian byte reader and writer for the command wire format.
//!
//! The reader never panics: every read checks the remaining length and returns a
//! [`WireError`] instead. Public decode functions collapse these errors into `None`.

use std::fmt;

use tracing::trace;

/// Why a wire read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
    /// Fewer bytes were left than the field needs.
    Truncated {
        /// Offset of the failed read.
        offset: usize,
        /// Bytes the field needs.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },
    /// A header byte was not one of the known markers.
    UnknownMarker {
        /// The offending byte.
        marker: u8,
        /// Offset of the byte.
        offset: usize,
    },
    /// The command type byte does not name a known command.
    UnknownCommandType {
        /// The offending value.
        value: u8,
    },
    /// A command header ended without a type marker.
    MissingCommandType,
    /// Text was not valid UTF-16 / UTF-8.
    InvalidText {
        /// Offset where the text started.
        offset: usize,
    },
    /// A length field disagrees with the data that follows it.
    LengthMismatch {
        /// Length announced by the field.
        declared: usize,
        /// Length actually present.
        actual: usize,
    },
    /// Bytes were left after a complete command.
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },
    /// A value is too long for its length prefix.
    FieldTooLong {
        /// Length of the value.
        len: usize,
        /// Largest length the prefix can express.
        max: usize,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated {
                offset,
                needed,
                remaining,
            } => write!(
                f,
                "truncated read at offset {offset}: needed {needed} bytes, {remaining} left"
            ),
            Self::UnknownMarker { marker, offset } => {
                write!(f, "unknown marker 0x{marker:02x} at offset {offset}")
            },
            Self::UnknownCommandType { value } => write!(f, "unknown command type {value}"),
            Self::MissingCommandType => write!(f, "command header has no type marker"),
            Self::InvalidText { offset } => write!(f, "invalid text at offset {offset}"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "length field says {declared} bytes but {actual} are present")
            },
            Self::TrailingBytes { remaining } => {
                write!(f, "{remaining} unread bytes after command")
            },
            Self::FieldTooLong { len, max } => {
                write!(f, "value of length {len} exceeds its prefix limit of {max}")
            },
        }
    }
}

impl std::error::Error for WireError {}

/// Result type for wire reads.
pub type WireResult<T> = Result<T, WireError>;

/// A cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// The current read position.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// True once every byte has been read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> WireResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(WireError::Truncated {
                offset: self.offset,
                needed: len,
                remaining: self.remaining(),
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Reads a `u8`.
    pub fn read_u8(&mut self) -> WireResult<u8> {
        self.read_array::<1>().map(|[b]| b)
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> WireResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> WireResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> WireResult<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Reads a little-endian `f32`.
    pub fn read_f32(&mut self) -> WireResult<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    /// Reads `units` UTF-16LE code units as a string.
    pub fn read_utf16(&mut self, units: usize) -> WireResult<String> {
        let start = self.offset;
        let raw = self.read_bytes(units.saturating_mul(2))?;
        let decoded: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&decoded).map_err(|err| {
            trace!(offset = start, %err, "invalid utf-16 text");
            WireError::InvalidText { offset: start }
        })
    }

    /// Reads a NUL-terminated UTF-8 string, consuming the terminator.
    pub fn read_cstring(&mut self) -> WireResult<String> {
        let start = self.offset;
        let rest = &self.bytes[self.offset..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::Truncated {
                offset: start,
                needed: rest.len() + 1,
                remaining: rest.len(),
            })?;
        let raw = self.read_bytes(len)?;
        self.offset += 1;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|err| {
                trace!(offset = start, %err, "invalid utf-8 text");
                WireError::InvalidText { offset: start }
            })
    }
}

/// An append-only little-endian writer.
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consumes the writer and returns the bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Writes a `u8`.
    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    /// Writes a little-endian `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes a little-endian `f32`.
    pub fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Writes UTF-16LE code units (no length prefix).
    pub fn write_utf16(&mut self, units: &[u16]) {
        for unit in units {
            self.write_u16(*unit);
        }
    }

    /// Writes a string followed by a NUL terminator.
    pub fn write_cstring(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
        self.write_u8(0);
    }
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
    fn reads_little_endian_integers() {
        let bytes = [0x04, 0x03, 0x02, 0x01, 0xcd, 0xab, 0x7f];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(reader.read_u16().unwrap(), 0xabcd);
        assert_eq!(reader.read_u8().unwrap(), 0x7f);
        assert!(reader.is_empty());
    }

    #[test]
    fn truncated_read_reports_position_and_keeps_cursor() {
        let bytes = [1, 2, 3];
        let mut reader = ByteReader::new(&bytes);
        reader.read_u8().unwrap();
        let err = reader.read_u32().unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                offset: 1,
                needed: 4,
                remaining: 2
            }
        );
        assert_eq!(reader.offset(), 1);
    }

    #[test]
    fn cstring_requires_terminator() {
        let mut reader = ByteReader::new(b"maps/a.map\0rest");
        assert_eq!(reader.read_cstring().unwrap(), "maps/a.map");
        assert_eq!(reader.remaining(), 4);

        let mut reader = ByteReader::new(b"no terminator");
        assert!(matches!(
            reader.read_cstring(),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn utf16_rejects_lone_surrogate() {
        let mut reader = ByteReader::new(&[0x00, 0xd8]);
        assert!(matches!(
            reader.read_utf16(1),
            Err(WireError::InvalidText { offset: 0 })
        ));
    }

    #[test]
    fn writer_mirrors_reader() {
        let mut writer = ByteWriter::new();
        writer.write_u32(7);
        writer.write_i32(-2);
        writer.write_f32(1.5);
        let units: Vec<u16> = "hi".encode_utf16().collect();
        writer.write_utf16(&units);
        writer.write_cstring("x");
        let bytes = writer.into_bytes();

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_i32().unwrap(), -2);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.read_utf16(2).unwrap(), "hi");
        assert_eq!(reader.read_cstring().unwrap(), "x");
        assert!(reader.is_empty());
    }
}
