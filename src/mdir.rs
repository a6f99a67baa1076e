// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! mdir: a two-block atomic metadata pair (spec §4.5).
//!
//! The "active" block is whichever of the pair holds a valid rbyd with
//! the higher revision (sequence-compared, so revision wraparound is
//! handled); the other is the standby target for the next commit. Since
//! every `Rbyd::commit` already rewrites a block's full state (see
//! `rbyd/mod.rs`), this engine's append/compact/relocate ladder
//! collapses to one step at this layer too: a commit always targets the
//! standby block, so an interrupted commit leaves the previously active
//! block untouched and `fetch` simply keeps returning the old state.
//! Relocating to an entirely new pair (when a commit doesn't fit even a
//! freshly erased block) is the caller's job — see `mtree.rs`.
//!
//! A shrub's tree lives as the payload of a `SHRUBCOMMIT` attribute on
//! its owning rid, self-contained (encoded starting at offset 0, not
//! spliced into the host block's absolute byte stream the way a real
//! inline trunk would be). This reuses `Rbyd::commit`/`RidEntry`
//! unchanged instead of teaching the block layout code about a second,
//! independently rooted trunk sharing the same bytes.

use crate::bshrub::Bshrub;
use crate::cache::CachedDevice;
use crate::data::Data;
use crate::device::BlockDevice;
use crate::rbyd::{compact, Edit, RidEntry, Rbyd};
use crate::tag::Tag;

/// One metadata pair: two block numbers, plus the currently active
/// block's parsed state.
#[derive(Clone, Debug)]
pub struct Mdir {
    pub blocks: [u32; 2],
    active: usize,
    rbyd: Rbyd,
}

impl Mdir {
    /// Formats a brand new, empty pair over two freshly allocated blocks.
    pub fn format<D: BlockDevice>(
        cache: &mut CachedDevice<D>,
        blocks: [u32; 2],
    ) -> crate::Result<Self> {
        let mut rbyd = Rbyd::new_empty(blocks[0], 0);
        rbyd.commit(cache)?;
        Ok(Self {
            blocks,
            active: 0,
            rbyd,
        })
    }

    /// Reads both blocks of `blocks` and adopts whichever holds the
    /// newer valid commit, tolerating exactly one corrupt block.
    pub fn fetch<D: BlockDevice>(
        cache: &mut CachedDevice<D>,
        blocks: [u32; 2],
    ) -> crate::Result<Self> {
        let a = Rbyd::fetch(cache, blocks[0]);
        let b = Rbyd::fetch(cache, blocks[1]);
        match (a, b) {
            (Ok(a), Ok(b)) => {
                if seq_gt(b.revision, a.revision) {
                    Ok(Self { blocks, active: 1, rbyd: b })
                } else {
                    Ok(Self { blocks, active: 0, rbyd: a })
                }
            }
            (Ok(a), Err(_)) => Ok(Self { blocks, active: 0, rbyd: a }),
            (Err(_), Ok(b)) => Ok(Self { blocks, active: 1, rbyd: b }),
            (Err(_), Err(_)) => Err(crate::Error::Corrupt),
        }
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.rbyd.weight()
    }

    #[must_use]
    pub fn rid_count(&self) -> u32 {
        self.rbyd.rid_count()
    }

    #[must_use]
    pub fn cksum(&self) -> u32 {
        self.rbyd.cksum
    }

    #[must_use]
    pub fn active_block(&self) -> u32 {
        self.blocks[self.active]
    }

    #[must_use]
    pub fn standby_block(&self) -> u32 {
        self.blocks[1 - self.active]
    }

    #[must_use]
    pub fn lookup(&self, rid: u32, tag: Tag) -> Option<&Data> {
        self.rbyd.lookup(rid, tag)
    }

    #[must_use]
    pub fn lookupnext(&self, rid: u32, tag: Tag) -> Option<(u32, &Data)> {
        self.rbyd.lookupnext(rid, tag)
    }

    #[must_use]
    pub fn namelookup(&self, did: u32, name: &[u8]) -> Option<(u32, &RidEntry)> {
        self.rbyd.namelookup(did, name)
    }

    #[must_use]
    pub fn entry(&self, rid: u32) -> Option<&RidEntry> {
        self.rbyd.entry(rid)
    }

    #[must_use]
    pub fn entries(&self) -> &[RidEntry] {
        self.rbyd.entries()
    }

    /// Decodes rid's `SHRUBCOMMIT` attribute, if it carries one.
    pub fn read_shrub(&self, rid: u32) -> crate::Result<Option<Bshrub>> {
        let Some(Data::Buf(blob)) = self.rbyd.lookup(rid, Tag::ShrubCommit) else {
            return Ok(None);
        };
        let entries = compact::parse(blob.as_slice(), 0, blob.len() as u32)?;
        Ok(Some(Bshrub::from_entries(entries)))
    }

    /// Builds the `(tag, data)` pair to attach `shrub`'s tree to `rid`
    /// via an [`Edit`].
    #[must_use]
    pub fn shrub_attr(shrub: &Bshrub) -> (Tag, Data) {
        (Tag::ShrubCommit, Data::from_buf(shrub.encode(0)))
    }

    /// Applies `edit` and writes the result to the standby block,
    /// promoting it to active on success. Returns `Err(Error::Range)`
    /// unchanged from `Rbyd::commit` if the result doesn't fit one
    /// block — the caller must then relocate to a fresh pair.
    pub fn commit<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        edit: &Edit,
    ) -> crate::Result<()> {
        let mut next = self.rbyd.clone();
        next.apply(edit)?;
        let standby = 1 - self.active;
        next.block = self.blocks[standby];
        next.commit(cache)?;
        self.rbyd = next;
        self.active = standby;
        Ok(())
    }
}

/// Sequence-compares two revision counts, tolerating wraparound (spec's
/// "higher revision, sequence-compared").
#[must_use]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Geometry, RamDevice};

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 8,
        }
    }

    #[test]
    fn commit_swaps_active_block_each_time() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut mdir = Mdir::format(&mut cache, [0, 1]).unwrap();
        assert_eq!(mdir.active_block(), 0);

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Name, Data::from_buf(crate::rbyd::attr::encode_name(0, b"a")));
        mdir.commit(&mut cache, &edit).unwrap();
        assert_eq!(mdir.active_block(), 1);

        let mut edit2 = Edit::new();
        edit2.create(1, 1);
        edit2.set(1, Tag::Name, Data::from_buf(crate::rbyd::attr::encode_name(0, b"b")));
        mdir.commit(&mut cache, &edit2).unwrap();
        assert_eq!(mdir.active_block(), 0);
        assert_eq!(mdir.weight(), 2);
    }

    #[test]
    fn fetch_recovers_newer_block_after_reopen() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut mdir = Mdir::format(&mut cache, [2, 3]).unwrap();
        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Name, Data::from_buf(crate::rbyd::attr::encode_name(0, b"a")));
        mdir.commit(&mut cache, &edit).unwrap();

        let reopened = Mdir::fetch(&mut cache, [2, 3]).unwrap();
        assert_eq!(reopened.weight(), 1);
        assert_eq!(reopened.active_block(), mdir.active_block());
    }

    #[test]
    fn shrub_roundtrips_through_commit() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut mdir = Mdir::format(&mut cache, [0, 1]).unwrap();

        let mut shrub = Bshrub::new();
        let mut shrub_edit = Edit::new();
        shrub_edit.create(0, 1);
        shrub_edit.set(0, Tag::Data, Data::from_buf(vec![7, 7, 7]));
        shrub.apply(&shrub_edit).unwrap();

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Reg, Data::from_buf(crate::rbyd::attr::encode_name(0, b"file")));
        let (tag, data) = Mdir::shrub_attr(&shrub);
        edit.set(0, tag, data);
        mdir.commit(&mut cache, &edit).unwrap();

        let decoded = mdir.read_shrub(0).unwrap().unwrap();
        assert_eq!(decoded.weight(), 1);
    }
}
