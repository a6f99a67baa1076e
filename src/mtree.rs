// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Global metadata tree + mroot chain (spec §4.6).
//!
//! The mtree is a [`Btree`] whose leaves carry `MDIR` tags (a pair of
//! block numbers) instead of the generic btree's usual `BLOCK`/`DATA`
//! leaves; everything else — split, promote-to-branch, index addressing
//! — is the exact same machinery `btree.rs` already provides. A
//! filesystem small enough to fit in one mdir skips the mtree entirely
//! ("2b-only" mode): the mroot pair itself is the sole container.
//!
//! The mroot chain is discovered by walking from the fixed anchor
//! `{0,1}`: each mroot may carry an `MROOT` tag pointing at the next
//! pair in the chain: the last one reached is active. Cycle detection is
//! a seen-set rather than spec's constant-memory Brent's algorithm —
//! chains are expected to be a handful of entries deep in practice, so
//! the O(n) memory is immaterial; see DESIGN.md.

use crate::btree::Btree;
use crate::cache::CachedDevice;
use crate::data::Data;
use crate::device::BlockDevice;
use crate::mdir::Mdir;
use crate::rbyd::{attr, Edit};
use crate::tag::Tag;
use rustc_hash::FxHashSet;

/// Global metadata id: `(mbid, mrid)` packed into one `u32`.
pub type Mid = u32;

/// Bits of a mid reserved for the rid-within-mdir half, derived from
/// block size: `floor(log2(block_size)) - 3`, clamped to stay sane for
/// tiny test geometries.
#[must_use]
pub fn mbits_for(block_size: u32) -> u32 {
    let log2 = 31 - block_size.max(1).leading_zeros();
    log2.saturating_sub(3).max(4)
}

#[must_use]
pub fn split_mid(mid: Mid, mbits: u32) -> (u32, u32) {
    let mask = (1u32 << mbits) - 1;
    (mid & !mask, mid & mask)
}

#[must_use]
pub fn join_mid(mbid: u32, mrid: u32, mbits: u32) -> Mid {
    let mask = (1u32 << mbits) - 1;
    (mbid & !mask) | (mrid & mask)
}

/// Encodes an `MDIR`/`MROOT` payload: two leb128 block numbers.
#[must_use]
pub fn encode_block_pair(blocks: [u32; 2]) -> Vec<u8> {
    let mut buf = Vec::new();
    crate::coding::write_leb128_u32(&mut buf, blocks[0]).unwrap();
    crate::coding::write_leb128_u32(&mut buf, blocks[1]).unwrap();
    buf
}

pub fn decode_block_pair(buf: &[u8]) -> crate::Result<[u32; 2]> {
    let mut cursor = buf;
    let a = crate::coding::read_leb128_u32(&mut cursor)?;
    let b = crate::coding::read_leb128_u32(&mut cursor)?;
    Ok([a, b])
}

/// A btree of mdirs, or nothing at all in 2b-only mode.
pub struct Mtree {
    pub mbits: u32,
    inner: Option<Btree>,
}

impl Mtree {
    #[must_use]
    pub fn new_empty(mbits: u32) -> Self {
        Self { mbits, inner: None }
    }

    #[must_use]
    pub fn from_btree(mbits: u32, btree: Btree) -> Self {
        Self { mbits, inner: Some(btree) }
    }

    #[must_use]
    pub fn is_2b_only(&self) -> bool {
        self.inner.is_none()
    }

    /// Number of mdir leaves, 0 in 2b-only mode.
    #[must_use]
    pub fn leaf_count(&self) -> u32 {
        match &self.inner {
            Some(btree) => btree.len(),
            None => 0,
        }
    }

    /// The struct tag an mroot should carry to reference this mtree, if
    /// it has grown past 2b-only mode.
    #[must_use]
    pub fn struct_tag(&self) -> Option<(Tag, Data)> {
        let btree = self.inner.as_ref()?;
        let rbyd = btree.root.rbyd();
        Some((
            Tag::MTree,
            Data::from_buf(attr::encode_branch(rbyd.weight(), rbyd.block, rbyd.trunk_off(), rbyd.cksum)),
        ))
    }

    /// Looks up the block pair for the mdir holding `mbid`.
    pub fn lookup_blocks<D: BlockDevice>(
        &self,
        cache: &mut CachedDevice<D>,
        mbid: u32,
    ) -> crate::Result<[u32; 2]> {
        let Some(btree) = &self.inner else {
            return Err(crate::Error::NoEnt);
        };
        let index = mbid >> self.mbits;
        let Some(entry) = btree.get(cache, index)? else {
            return Err(crate::Error::NoEnt);
        };
        let Some(Data::Buf(b)) = entry.get(Tag::MDir) else {
            return Err(crate::Error::Corrupt);
        };
        decode_block_pair(b.as_slice())
    }

    /// Appends a newly allocated mdir's block pair as the mtree's next
    /// leaf, promoting from 2b-only mode on the very first call. Returns
    /// the mbid assigned to the new mdir's first rid.
    pub fn push_mdir<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut crate::alloc::Allocator,
        blocks: [u32; 2],
    ) -> crate::Result<u32> {
        let tag = (Tag::MDir, Data::from_buf(encode_block_pair(blocks)));
        let index = match &self.inner {
            Some(btree) => btree.len(),
            None => 0,
        };
        match &mut self.inner {
            Some(btree) => {
                btree.push(cache, alloc, vec![tag])?;
            }
            None => {
                let root_block = alloc.alloc()?;
                let mut btree = Btree::new_empty(root_block);
                btree.push(cache, alloc, vec![tag])?;
                self.inner = Some(btree);
            }
        }
        Ok(index << self.mbits)
    }

    /// Repoints the mtree leaf for `mbid`'s mdir at a relocated block
    /// pair, after that mdir outgrows even a freshly erased pair.
    pub fn set_mdir<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut crate::alloc::Allocator,
        mbid: u32,
        blocks: [u32; 2],
    ) -> crate::Result<()> {
        let Some(btree) = &mut self.inner else {
            return Err(crate::Error::NoEnt);
        };
        let index = mbid >> self.mbits;
        let tag = (Tag::MDir, Data::from_buf(encode_block_pair(blocks)));
        btree.set(cache, alloc, index, vec![tag])
    }
}

/// The chain of mroot pairs rooted at the fixed anchor `{0,1}`.
pub struct MrootChain {
    mdirs: Vec<Mdir>,
}

impl MrootChain {
    /// Walks from `{0,1}` following `MROOT` tags on rid 0 until a pair
    /// carries none, adopting the last one reached as active.
    pub fn open<D: BlockDevice>(cache: &mut CachedDevice<D>) -> crate::Result<Self> {
        let mut mdirs = vec![Mdir::fetch(cache, [0, 1])?];
        let mut seen: FxHashSet<[u32; 2]> = FxHashSet::default();
        seen.insert([0, 1]);
        loop {
            let last = mdirs.last().expect("always has the anchor");
            let Some(Data::Buf(b)) = last.lookup(0, Tag::MRoot) else {
                break;
            };
            let next_blocks = decode_block_pair(b.as_slice())?;
            if !seen.insert(next_blocks) {
                return Err(crate::Error::Corrupt);
            }
            mdirs.push(Mdir::fetch(cache, next_blocks)?);
        }
        Ok(Self { mdirs })
    }

    /// Formats a fresh, empty filesystem: just the anchor pair, config
    /// tags asserted, no successor.
    pub fn format<D: BlockDevice>(
        cache: &mut CachedDevice<D>,
        block_size: u32,
        block_count: u32,
        name_limit: u32,
        file_limit: u32,
    ) -> crate::Result<Self> {
        let mut anchor = Mdir::format(cache, [0, 1])?;
        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Magic, Data::from_buf(b"littlefs".to_vec()));
        edit.set(0, Tag::Version, Data::from_buf(vec![3, 0]));
        edit.set(0, Tag::Geometry, Data::from_buf(encode_geometry(block_size, block_count)));
        edit.set(0, Tag::NameLimit, Data::from_buf(encode_leb128(name_limit)));
        edit.set(0, Tag::FileLimit, Data::from_buf(encode_leb128(file_limit)));
        anchor.commit(cache, &edit)?;
        Ok(Self { mdirs: vec![anchor] })
    }

    #[must_use]
    pub fn active(&self) -> &Mdir {
        self.mdirs.last().expect("always has the anchor")
    }

    pub fn active_mut(&mut self) -> &mut Mdir {
        self.mdirs.last_mut().expect("always has the anchor")
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.mdirs.len()
    }

    /// Every mroot pair in the chain, anchor first.
    #[must_use]
    pub fn mdirs(&self) -> &[Mdir] {
        &self.mdirs
    }

    /// Extends the chain when the active mroot itself must relocate:
    /// allocates a fresh pair, commits the config tags there, then
    /// stamps the old active pair with an `MROOT` tag pointing at it.
    pub fn extend<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        new_blocks: [u32; 2],
    ) -> crate::Result<()> {
        let mut new_mroot = Mdir::format(cache, new_blocks)?;
        let old = self.active();
        let mut carry = Edit::new();
        carry.create(0, 1);
        for tag in [
            Tag::Magic,
            Tag::Version,
            Tag::RCompat,
            Tag::WCompat,
            Tag::OCompat,
            Tag::Geometry,
            Tag::NameLimit,
            Tag::FileLimit,
        ] {
            if let Some(data) = old.lookup(0, tag) {
                carry.set(0, tag, data.clone());
            }
        }
        new_mroot.commit(cache, &carry)?;

        let mut redirect = Edit::new();
        redirect.set(0, Tag::MRoot, Data::from_buf(encode_block_pair(new_blocks)));
        self.active_mut().commit(cache, &redirect)?;
        self.mdirs.push(new_mroot);
        Ok(())
    }
}

fn encode_geometry(block_size: u32, block_count: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    crate::coding::write_leb128_u32(&mut buf, block_size - 1).unwrap();
    crate::coding::write_leb128_u32(&mut buf, block_count - 1).unwrap();
    buf
}

fn encode_leb128(value: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    crate::coding::write_leb128_u32(&mut buf, value).unwrap();
    buf
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
            block_count: 16,
        }
    }

    #[test]
    fn mbits_split_and_join_round_trip() {
        let mbits = mbits_for(256);
        let mid = join_mid(3 << mbits, 2, mbits);
        assert_eq!(split_mid(mid, mbits), (3 << mbits, 2));
    }

    #[test]
    fn format_then_open_round_trips_the_anchor() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        MrootChain::format(&mut cache, 256, 16, 255, 0x7fff_ffff).unwrap();

        let chain = MrootChain::open(&mut cache).unwrap();
        assert_eq!(chain.depth(), 1);
        assert!(chain.active().lookup(0, Tag::Magic).is_some());
    }

    #[test]
    fn extend_chains_to_a_new_anchor() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut chain = MrootChain::format(&mut cache, 256, 16, 255, 0x7fff_ffff).unwrap();
        chain.extend(&mut cache, [4, 5]).unwrap();
        assert_eq!(chain.depth(), 2);

        let reopened = MrootChain::open(&mut cache).unwrap();
        assert_eq!(reopened.depth(), 2);
        assert!(reopened.active().lookup(0, Tag::Magic).is_some());
    }
}
