// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Polymorphic data reference (spec §9): a payload is either already in
//! RAM, a slice of an on-disk block, or a slice of an on-disk block whose
//! checksum the caller has already computed (a [`Bptr`]-backed read, which
//! can then skip re-verifying it). Modelled as a sum type rather than a
//! union, per the design notes.

use crate::checksum::crc32c;
use std::sync::Arc;

/// A reference-counted, cheaply cloned byte buffer — the in-RAM half of
/// [`Data`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bytes(Arc<[u8]>);

impl Bytes {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(value: Vec<u8>) -> Self {
        Self(value.into())
    }
}

impl From<&[u8]> for Bytes {
    fn from(value: &[u8]) -> Self {
        Self(value.into())
    }
}

/// A location on disk, without an attached checksum.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DiskSlice {
    pub block: u32,
    pub off: u32,
    pub size: u32,
}

/// A location on disk whose crc32c over `[off, off+cksize)` is already
/// known, carried alongside a [`Bptr`] so large data blocks can be
/// reopened, extended in their erased tail, and re-checksummed without a
/// copy (spec §3 "bptr").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DiskSliceChecksummed {
    pub block: u32,
    pub off: u32,
    pub size: u32,
    /// Length of the prefix the carried checksum covers; always
    /// `>= size` (the checksum may cover more than the live data, up to
    /// the erased tail).
    pub cksize: u32,
    pub cksum: u32,
}

/// A payload reference: either already materialized in RAM, or a pointer
/// into on-disk storage (optionally pre-checksummed).
#[derive(Clone, Debug)]
pub enum Data {
    Buf(Bytes),
    Disk(DiskSlice),
    DiskChecksummed(DiskSliceChecksummed),
}

impl Data {
    #[must_use]
    pub fn from_buf(bytes: impl Into<Bytes>) -> Self {
        Self::Buf(bytes.into())
    }

    /// Size of the payload in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            Self::Buf(b) => b.len() as u32,
            Self::Disk(d) => d.size,
            Self::DiskChecksummed(d) => d.size,
        }
    }

    /// Resolves this reference to owned bytes by reading through `cache`
    /// if necessary.
    pub fn materialize<D: crate::device::BlockDevice>(
        &self,
        cache: &mut crate::cache::CachedDevice<D>,
    ) -> crate::Result<Bytes> {
        match self {
            Self::Buf(b) => Ok(b.clone()),
            Self::Disk(d) => {
                let mut buf = vec![0u8; d.size as usize];
                cache.read(d.block, d.off, &mut buf)?;
                Ok(buf.into())
            }
            Self::DiskChecksummed(d) => {
                let mut buf = vec![0u8; d.size as usize];
                cache.read(d.block, d.off, &mut buf)?;
                // The carried checksum covers `cksize` bytes, which may
                // exceed the live `size`; only verify when they coincide,
                // otherwise the cheap crc32c check happens at the bptr
                // layer where the full covered range is read.
                if d.cksize == d.size && crc32c(&buf) != d.cksum {
                    return Err(crate::Error::Corrupt);
                }
                Ok(buf.into())
            }
        }
    }
}
