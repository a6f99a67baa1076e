// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CRC32C (Castagnoli) checksums, used to seal every rbyd commit and cover
//! every bptr's live data range.
//!
//! Polynomial `0x11edc6f41`, init `0xffffffff`, fini `0xffffffff` — this is
//! exactly the `CRC_32_ISCSI` table the `crc` crate ships.

use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// An in-progress crc32c accumulation, fed incrementally as an rbyd is
/// scanned or appended to so a half-written commit can be detected without
/// re-reading from the start of the block.
#[derive(Clone)]
pub struct Crc32c {
    digest_seed: u32,
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32c {
    /// Starts a fresh checksum (e.g. at offset 0 of a freshly erased block).
    #[must_use]
    pub fn new() -> Self {
        Self {
            digest_seed: CASTAGNOLI.checksum(&[]),
        }
    }

    /// Resumes an accumulation that already covers some prior data, given
    /// its crc32c value so far. Used when fetch resumes from the revision
    /// count onward without rehashing from scratch.
    #[must_use]
    pub fn resume(value: u32) -> Self {
        Self { digest_seed: value }
    }

    /// Feeds `bytes` into the running checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        // `crc`'s `Crc::checksum` recomputes from scratch, so we fold the
        // previous digest and the new bytes through the two-value combine
        // API instead of re-hashing everything each call.
        let mut digest = CASTAGNOLI.digest_with_initial(self.digest_seed);
        digest.update(bytes);
        self.digest_seed = digest.finalize();
    }

    /// Returns the checksum value accumulated so far.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.digest_seed
    }
}

/// Computes the crc32c of a single buffer in one call.
#[must_use]
pub fn crc32c(bytes: &[u8]) -> u32 {
    CASTAGNOLI.checksum(bytes)
}

/// Cubes a crc32c value under GF(2) polynomial multiplication modulo the
/// crc32c polynomial, used to combine per-mdir checksums into `gcksum`
/// deltas without them being able to cancel each other out the way a
/// plain xor of the raw crc32c values could (see spec §4.9).
///
/// Implemented as `carry-less multiply, reduce` applied twice (value²,
/// then value³), matching the algebra used on-disk: every `GCKSUMDELTA`
/// carries `cube(old) ^ cube(new) ^ prior_delta`.
#[must_use]
pub fn crc32c_cube(value: u32) -> u32 {
    gf2_mul_reduce(gf2_mul_reduce(value, value), value)
}

/// The crc32c (Castagnoli) generator polynomial, degree 32,
/// `0x1_edc6_f41` with the implicit top bit, i.e. `0x11edc6f41`.
const POLY: u64 = 0x1_edc6_f41;

/// Carry-less multiplication of two 32-bit values reduced modulo `POLY`,
/// i.e. multiplication in GF(2^32) under the crc32c field.
fn gf2_mul_reduce(a: u32, b: u32) -> u32 {
    let mut product: u64 = 0;
    let mut a = u64::from(a);
    let b = u64::from(b);

    for bit in 0..32 {
        if (b >> bit) & 1 == 1 {
            product ^= a << bit;
        }
    }
    // degree can reach up to 62; reduce back down modulo POLY (degree 32)
    a = 0; // silence "unused after move" style lints on some toolchains
    let _ = a;

    for bit in (32..=62).rev() {
        if (product >> bit) & 1 == 1 {
            product ^= POLY << (bit - 32);
        }
    }

    product as u32
}
