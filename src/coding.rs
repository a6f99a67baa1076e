// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Serialization primitives: the on-disk records described in spec §6 are
//! `be16 tag | leb128 weight | leb128 size | payload`, little-endian
//! everywhere else. This module provides the shared `Encode`/`Decode`
//! traits plus the leb128 and fixed-width helpers every on-disk type is
//! built from.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

fn map_eof(e: std::io::Error) -> DecodeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodeError::Eof
    } else {
        DecodeError::Io(e)
    }
}

/// Error during serialization.
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error while writing.
    Io(std::io::Error),
    /// A value exceeded the field width it was encoded into.
    Overflow,
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Overflow => write!(f, "value overflows its on-disk field"),
        }
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Overflow => None,
        }
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Error during deserialization.
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error while reading.
    Io(std::io::Error),
    /// Buffer ran out before a complete record was parsed.
    Eof,
    /// A tag, version, or other enumerated field held an unknown value.
    InvalidTag(u16),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Eof => write!(f, "unexpected end of record"),
            Self::InvalidTag(t) => write!(f, "unrecognised tag 0x{t:04x}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Serializes a type into its on-disk byte representation.
pub trait Encode {
    /// Serializes into `writer`.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into a freshly allocated vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("in-memory write cannot fail");
        v
    }
}

/// Deserializes a type from its on-disk byte representation.
pub trait Decode {
    /// Deserializes from `reader`.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Writes an unsigned LEB128 varint, as used for every `weight`/`size`/mid
/// field in the on-disk format.
pub fn write_leb128_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), EncodeError> {
    writer.write_u32_varint(value)?;
    Ok(())
}

/// Reads an unsigned LEB128 varint.
pub fn read_leb128_u32<R: Read>(reader: &mut R) -> Result<u32, DecodeError> {
    reader.read_u32_varint().map_err(map_eof)
}

/// Writes a signed value zig-zag encoded as a LEB128 varint (used for
/// weight deltas, which may be negative during range-removal).
pub fn write_leb128_i32<W: Write>(writer: &mut W, value: i32) -> Result<(), EncodeError> {
    let zigzag = ((value << 1) ^ (value >> 31)) as u32;
    write_leb128_u32(writer, zigzag)
}

/// Reads a zig-zag encoded signed LEB128 varint.
pub fn read_leb128_i32<R: Read>(reader: &mut R) -> Result<i32, DecodeError> {
    let zigzag = read_leb128_u32(reader)?;
    Ok(((zigzag >> 1) as i32) ^ -((zigzag & 1) as i32))
}

/// Writes a big-endian `u16`, used only for the tag field itself.
pub fn write_be16<W: Write>(writer: &mut W, value: u16) -> Result<(), EncodeError> {
    writer.write_u16::<BigEndian>(value)?;
    Ok(())
}

/// Reads a big-endian `u16`.
pub fn read_be16<R: Read>(reader: &mut R) -> Result<u16, DecodeError> {
    reader.read_u16::<BigEndian>().map_err(map_eof)
}

/// Writes a little-endian `u32`, used for revision counts and cksums.
pub fn write_le32<W: Write>(writer: &mut W, value: u32) -> Result<(), EncodeError> {
    writer.write_u32::<LittleEndian>(value)?;
    Ok(())
}

/// Reads a little-endian `u32`.
pub fn read_le32<R: Read>(reader: &mut R) -> Result<u32, DecodeError> {
    reader.read_u32::<LittleEndian>().map_err(map_eof)
}

/// Returns the number of bytes `write_leb128_u32` would emit for `value`.
#[must_use]
pub fn leb128_u32_size(value: u32) -> usize {
    let mut v = value;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_roundtrip() {
        for value in [0u32, 1, 127, 128, 300, 16384, u32::from(u16::MAX), u32::MAX >> 4] {
            let mut buf = vec![];
            write_leb128_u32(&mut buf, value).unwrap();
            assert_eq!(buf.len(), leb128_u32_size(value));
            let mut cursor = &buf[..];
            let decoded = read_leb128_u32(&mut cursor).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn leb128_signed_roundtrip() {
        for value in [0i32, 1, -1, 63, -64, 1000, -1000, i32::MAX >> 3, -(i32::MAX >> 3)] {
            let mut buf = vec![];
            write_leb128_i32(&mut buf, value).unwrap();
            let mut cursor = &buf[..];
            let decoded = read_leb128_i32(&mut cursor).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn be16_roundtrip() {
        let mut buf = vec![];
        write_be16(&mut buf, 0xABCD).unwrap();
        assert_eq!(buf, vec![0xAB, 0xCD]);
        let mut cursor = &buf[..];
        assert_eq!(read_be16(&mut cursor).unwrap(), 0xABCD);
    }
}
