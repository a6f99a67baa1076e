// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bshrub: a btree root small enough to live inline inside its parent
//! mdir block instead of owning a block of its own (spec §4.4).
//!
//! A shrub's tags are just another [`RidEntry`] tree, built and walked
//! with the exact same `rbyd::compact` machinery as a real block — the
//! only difference is where the bytes end up. `mdir.rs` embeds a shrub's
//! encoded tree as a `SHRUBCOMMIT` record inside its own full-block
//! rewrite, so a shrub never calls `commit` itself; it just reports how
//! many bytes it would take and hands that encoding to its host.

use crate::alloc::Allocator;
use crate::btree::{Btree, Node};
use crate::cache::CachedDevice;
use crate::device::BlockDevice;
use crate::rbyd::{compact, Edit, RidEntry, Rbyd};

/// The inline tree itself: a sorted rid set with no block of its own.
#[derive(Clone, Debug, Default)]
pub struct Bshrub {
    entries: Vec<RidEntry>,
}

impl Bshrub {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[must_use]
    pub fn from_entries(entries: Vec<RidEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    #[must_use]
    pub fn entries(&self) -> &[RidEntry] {
        &self.entries
    }

    pub fn entry(&self, rid: u32) -> Option<&RidEntry> {
        self.entries.get(rid as usize)
    }

    pub fn apply(&mut self, edit: &Edit) -> crate::Result<()> {
        let mut scratch = Rbyd::new_empty(0, 0);
        scratch.adopt_entries(self.entries.clone());
        scratch.apply(edit)?;
        self.entries = scratch.entries().to_vec();
        Ok(())
    }

    /// The number of bytes this shrub's encoded tree would take if
    /// emitted at `base_offset` within its host mdir's commit.
    #[must_use]
    pub fn encoded_size(&self) -> u32 {
        compact::size_of(&self.entries)
    }

    /// Encodes this shrub's tree, to be spliced into the host mdir's
    /// commit buffer as a `SHRUBCOMMIT` record's payload.
    #[must_use]
    pub fn encode(&self, base_offset: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        compact::emit(&self.entries, base_offset, &mut buf);
        buf
    }

    /// Whether this shrub's encoded size fits the mdir's configured
    /// inline threshold.
    #[must_use]
    pub fn fits(&self, inline_size: u32) -> bool {
        self.encoded_size() <= inline_size
    }
}

/// A file or directory's secondary structure: either inline (a
/// [`Bshrub`], free of charge inside the parent mdir) or promoted to a
/// real [`Btree`] once it outgrows `inline_size`.
#[derive(Clone)]
pub enum ShrubRoot {
    Inline(Bshrub),
    Promoted(Btree),
}

impl ShrubRoot {
    #[must_use]
    pub fn new_empty() -> Self {
        Self::Inline(Bshrub::new())
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        match self {
            Self::Inline(shrub) => shrub.weight(),
            Self::Promoted(btree) => btree.len(),
        }
    }

    pub fn get<D: BlockDevice>(
        &self,
        cache: &mut CachedDevice<D>,
        rid: u32,
    ) -> crate::Result<Option<RidEntry>> {
        match self {
            Self::Inline(shrub) => Ok(shrub.entry(rid).cloned()),
            Self::Promoted(btree) => btree.get(cache, rid),
        }
    }

    /// Applies `edit` in place, promoting to a real btree if the result
    /// would no longer fit inline. Promotion allocates one fresh block.
    pub fn apply<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        inline_size: u32,
        edit: &Edit,
    ) -> crate::Result<()> {
        if let Self::Inline(shrub) = self {
            let mut candidate = shrub.clone();
            candidate.apply(edit)?;
            if candidate.fits(inline_size) {
                *self = Self::Inline(candidate);
            } else {
                let btree = promote(cache, alloc, &candidate)?;
                *self = Self::Promoted(btree);
            }
            return Ok(());
        }
        let Self::Promoted(btree) = self else {
            unreachable!()
        };
        apply_via_edit(cache, alloc, btree, edit)
    }

    /// The struct tag payload a REG/DIR record should carry for this
    /// root: `(weight, trunk)` for an inline shrub (trunk is an offset
    /// within the host mdir, assigned by `mdir.rs` at commit time, so the
    /// caller fills it in), or `(weight, block, trunk, cksum)` for a
    /// promoted real btree.
    #[must_use]
    pub fn as_inline(&self) -> Option<&Bshrub> {
        match self {
            Self::Inline(shrub) => Some(shrub),
            Self::Promoted(_) => None,
        }
    }

    #[must_use]
    pub fn as_btree(&self) -> Option<&Btree> {
        match self {
            Self::Inline(_) => None,
            Self::Promoted(btree) => Some(btree),
        }
    }
}

fn promote<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    shrub: &Bshrub,
) -> crate::Result<Btree> {
    let block = alloc.alloc()?;
    let mut rbyd = Rbyd::new_empty(block, 0);
    rbyd.adopt_entries(shrub.entries().to_vec());
    match rbyd.commit(cache) {
        Ok(()) => Ok(Btree::from_root(Node::Leaf(rbyd))),
        Err(crate::Error::Range) => {
            // A shrub that overflows a fresh empty block can't happen in
            // practice (inline_size is always well under block_size), but
            // report it the same way a real btree split would.
            Err(crate::Error::FBig)
        }
        Err(e) => Err(e),
    }
}

/// Once promoted, a shrub's edits are limited to the append/truncate-tail
/// shapes `file.rs` actually produces (crystallization always grows or
/// shrinks from the end); anything else is a programmer error upstream.
fn apply_via_edit<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    btree: &mut Btree,
    edit: &Edit,
) -> crate::Result<()> {
    for op in &edit.ops {
        match *op {
            crate::rbyd::RidOp::Create { at, weight } if at == btree.len() && weight == 1 => {
                btree.push(cache, alloc, Vec::new())?;
            }
            crate::rbyd::RidOp::Delete { at } if at + 1 == btree.len() => {
                btree.truncate(cache, alloc, at)?;
            }
            _ => return Err(crate::Error::NotSup),
        }
    }
    for attr in &edit.attrs {
        match &attr.data {
            Some(data) => btree.set(cache, alloc, attr.rid, vec![(attr.tag, data.clone())])?,
            None => return Err(crate::Error::NotSup),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::device::{Geometry, RamDevice};
    use crate::tag::Tag;

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 32,
        }
    }

    #[test]
    fn small_edits_stay_inline() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(32, 16);
        let mut root = ShrubRoot::new_empty();

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Data, Data::from_buf(vec![1, 2, 3]));
        root.apply(&mut cache, &mut alloc, 128, &edit).unwrap();

        assert!(matches!(root, ShrubRoot::Inline(_)));
        assert_eq!(root.weight(), 1);
    }

    #[test]
    fn overflowing_edits_promote_to_a_real_btree() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(32, 16);
        let mut root = ShrubRoot::new_empty();

        let mut edit = Edit::new();
        for i in 0..10u32 {
            edit.create(i, 1);
            edit.set(i, Tag::Data, Data::from_buf(vec![i as u8; 16]));
        }
        root.apply(&mut cache, &mut alloc, 32, &edit).unwrap();

        assert!(matches!(root, ShrubRoot::Promoted(_)));
        assert_eq!(root.weight(), 10);
    }
}
