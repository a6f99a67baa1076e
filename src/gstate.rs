// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Global filesystem state: `gcksum` and `grm` (spec §4.9).
//!
//! Both pieces are reconstructed by xoring per-mdir deltas rather than
//! being stored once anywhere, so that any single mdir commit can update
//! its own delta without touching every other mdir. `GlobalState` keeps
//! the reconciled, in-RAM view; `_p`-suffixed fields (named after the
//! spec's own `gcksum_p`/`grm_p`) are the last known-durable snapshot,
//! restored on any commit failure per §7's rollback policy.

use crate::checksum::crc32c_cube;
use crate::coding::{read_leb128_u32, write_leb128_u32};

/// Up to two mids pending removal, persisted as `GRMDELTA`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Grm {
    mids: Vec<u32>,
}

impl Grm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mids(&self) -> &[u32] {
        &self.mids
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, mid: u32) -> bool {
        self.mids.contains(&mid)
    }

    /// Enqueues `mid` for removal. Mid 0 (the root bookmark) may never
    /// be queued; the queue holds at most two entries at a time.
    pub fn push(&mut self, mid: u32) -> crate::Result<()> {
        if mid == 0 {
            return Err(crate::Error::Inval);
        }
        if self.mids.len() >= 2 {
            return Err(crate::Error::NoMem);
        }
        self.mids.push(mid);
        Ok(())
    }

    /// Removes `mid` from the queue once its physical removal lands.
    pub fn cancel(&mut self, mid: u32) {
        self.mids.retain(|&m| m != mid);
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for &mid in &self.mids {
            write_leb128_u32(&mut buf, mid).expect("vec write cannot fail");
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        let mut cursor = buf;
        let mut mids = Vec::new();
        while !cursor.is_empty() && mids.len() < 2 {
            mids.push(read_leb128_u32(&mut cursor)?);
        }
        Ok(Self { mids })
    }
}

/// Computes the `GCKSUMDELTA` one mdir should emit this commit, folding
/// in the cksum transition it just made and the delta it previously
/// contributed (0 if this mdir has never changed cksum before).
#[must_use]
pub fn next_gcksum_delta(old_cksum: u32, new_cksum: u32, prior_delta: u32) -> u32 {
    crc32c_cube(old_cksum) ^ crc32c_cube(new_cksum) ^ prior_delta
}

/// Reconstructs `cube(gcksum)` by xoring every mdir's currently stored
/// delta together (each delta already supersedes that mdir's earlier
/// contribution, so summing the *current* set telescopes to the total).
#[must_use]
pub fn reconstruct_cubed_gcksum(deltas: impl IntoIterator<Item = u32>) -> u32 {
    deltas.into_iter().fold(0, |acc, d| acc ^ d)
}

/// Checks a reconstructed `gcksum` against the xor of every delta found
/// during a mount-time traversal.
#[must_use]
pub fn verify(gcksum: u32, deltas: impl IntoIterator<Item = u32>) -> bool {
    crc32c_cube(gcksum) == reconstruct_cubed_gcksum(deltas)
}

/// The reconciled global state plus a rollback snapshot.
#[derive(Clone, Debug, Default)]
pub struct GlobalState {
    pub gcksum: u32,
    pub grm: Grm,
    gcksum_p: u32,
    grm_p: Grm,
}

impl GlobalState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds `gcksum` from a mount-time traversal's per-mdir cksums
    /// (xor of every active mdir's final cksum, per spec).
    #[must_use]
    pub fn from_mdir_cksums(cksums: impl IntoIterator<Item = u32>) -> Self {
        let gcksum = cksums.into_iter().fold(0, |acc, c| acc ^ c);
        Self {
            gcksum,
            grm: Grm::new(),
            gcksum_p: gcksum,
            grm_p: Grm::new(),
        }
    }

    /// Folds in one mdir's cksum transition as it happens in RAM, ahead
    /// of that commit actually landing.
    pub fn note_cksum_change(&mut self, old_cksum: u32, new_cksum: u32) {
        self.gcksum ^= old_cksum ^ new_cksum;
    }

    /// Marks the current in-RAM state as durable, called right after a
    /// top-level commit succeeds.
    pub fn checkpoint(&mut self) {
        self.gcksum_p = self.gcksum;
        self.grm_p = self.grm.clone();
    }

    /// Restores the last durable snapshot, called when a commit fails
    /// partway through (spec §7).
    pub fn rollback(&mut self) {
        self.gcksum = self.gcksum_p;
        self.grm = self.grm_p.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grm_roundtrips_through_encoding() {
        let mut grm = Grm::new();
        grm.push(5).unwrap();
        grm.push(9).unwrap();
        let decoded = Grm::decode(&grm.encode()).unwrap();
        assert_eq!(decoded.mids(), &[5, 9]);
    }

    #[test]
    fn grm_rejects_root_mid_and_overflow() {
        let mut grm = Grm::new();
        assert!(matches!(grm.push(0), Err(crate::Error::Inval)));
        grm.push(1).unwrap();
        grm.push(2).unwrap();
        assert!(matches!(grm.push(3), Err(crate::Error::NoMem)));
    }

    #[test]
    fn delta_chain_reconstructs_after_repeated_commits() {
        let mut delta = 0u32;
        let mut cksum = 0u32;
        for next in [0x1111_1111u32, 0x2222_2222, 0x3333_3333] {
            delta = next_gcksum_delta(cksum, next, delta);
            cksum = next;
        }
        assert!(verify(cksum, [delta]));
    }

    #[test]
    fn checkpoint_and_rollback_round_trip() {
        let mut state = GlobalState::new();
        state.note_cksum_change(0, 0xdead_beef);
        state.checkpoint();
        state.note_cksum_change(0xdead_beef, 0xbad_c0de);
        state.rollback();
        assert_eq!(state.gcksum, 0xdead_beef);
    }
}
