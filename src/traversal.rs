// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Traversal & GC (spec §4.10).
//!
//! The real engine exposes this as a pausable state machine
//! (MROOTANCHOR -> MROOTCHAIN -> MTREE -> MDIRS -> MDIR -> BTREE ->
//! OMDIRS -> OBTREE -> DONE) so allocator lookahead, `ckmeta`/`ckdata`,
//! and GC can interleave with ordinary commits one step at a time,
//! re-deriving what's safe whenever a DIRTY flag fires mid-walk. This
//! engine runs the equivalent walk to completion in one call instead of
//! yielding intermediate states: `fs.rs` never holds a traversal open
//! across a commit, so there is nothing for a DIRTY flag to invalidate.
//! The OMDIRS/OBTREE legs (open, not-yet-synced file handles) have no
//! counterpart here either, since a `File` only touches the tree at
//! `sync` time — see DESIGN.md.
//!
//! One recursive sweep from the mroot chain covers every leg: mroot
//! pairs, the mtree's own branch nodes, every mdir it addresses, and
//! each mdir's `BTREE`/`BSHRUB` file content down to the data blocks a
//! `BLOCK` tag points at.

use crate::cache::CachedDevice;
use crate::config::CheckFlags;
use crate::data::Data;
use crate::device::BlockDevice;
use crate::mdir::Mdir;
use crate::mtree::{decode_block_pair, MrootChain};
use crate::rbyd::{attr, Rbyd};
use crate::tag::Tag;
use rustc_hash::FxHashSet;

/// Accumulated result of a full traversal: every block reachable from
/// the mroot chain, plus any mismatches `flags` asked to check for.
#[derive(Clone, Debug, Default)]
pub struct TraversalReport {
    pub blocks: FxHashSet<u32>,
    /// Blocks whose rbyd/mdir failed to parse or checksum.
    pub meta_errors: Vec<u32>,
    /// Data blocks whose covered range didn't match its bptr cksum.
    pub data_errors: Vec<u32>,
}

impl TraversalReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.meta_errors.is_empty() && self.data_errors.is_empty()
    }
}

/// Walks every block reachable from `mroot`, checking what `flags` asks
/// for along the way. Used for `fs_usage`, `ckmeta`/`ckdata`, and the
/// allocator's lookahead scan (which only needs the `blocks` set).
pub fn traverse<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    mroot: &MrootChain,
    flags: CheckFlags,
) -> crate::Result<TraversalReport> {
    let mut report = TraversalReport::default();
    for mdir in mroot.mdirs() {
        visit_mdir(cache, mdir.blocks, &mut report, flags)?;
    }
    Ok(report)
}

fn visit_mdir<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    blocks: [u32; 2],
    report: &mut TraversalReport,
    flags: CheckFlags,
) -> crate::Result<()> {
    let fresh_a = report.blocks.insert(blocks[0]);
    let fresh_b = report.blocks.insert(blocks[1]);
    if !fresh_a && !fresh_b {
        return Ok(());
    }

    let mdir = match Mdir::fetch(cache, blocks) {
        Ok(mdir) => mdir,
        Err(_) => {
            if flags.meta {
                report.meta_errors.push(blocks[0]);
            }
            return Ok(());
        }
    };

    for (rid, entry) in mdir.entries().iter().enumerate() {
        let rid = rid as u32;

        if let Some(Data::Buf(b)) = entry.get(Tag::BTree) {
            let (_weight, block, _trunk, _cksum) = attr::decode_branch(b.as_slice())?;
            visit_tree_block(cache, block, report, flags)?;
        }

        if entry.get(Tag::BShrub).is_some() {
            if let Some(shrub) = mdir.read_shrub(rid)? {
                for shrub_entry in shrub.entries() {
                    if let Some(Data::Buf(b)) = shrub_entry.get(Tag::Block) {
                        visit_bptr(cache, b.as_slice(), report, flags)?;
                    }
                }
            }
        }

        if let Some(Data::Buf(b)) = entry.get(Tag::MTree) {
            let (_weight, block, _trunk, _cksum) = attr::decode_branch(b.as_slice())?;
            visit_tree_block(cache, block, report, flags)?;
        }
    }
    Ok(())
}

/// Visits one node of a generic btree (the mtree itself, or a file's
/// promoted content tree): `BRANCH` leaves recurse into a child node,
/// `MDIR` leaves hand off to [`visit_mdir`], `BLOCK` leaves are data.
fn visit_tree_block<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    block: u32,
    report: &mut TraversalReport,
    flags: CheckFlags,
) -> crate::Result<()> {
    if !report.blocks.insert(block) {
        return Ok(());
    }

    let rbyd = match Rbyd::fetch(cache, block) {
        Ok(rbyd) => rbyd,
        Err(_) => {
            if flags.meta {
                report.meta_errors.push(block);
            }
            return Ok(());
        }
    };

    for entry in rbyd.entries() {
        if let Some(Data::Buf(b)) = entry.get(Tag::Branch) {
            let (_weight, child_block, _trunk, _cksum) = attr::decode_branch(b.as_slice())?;
            visit_tree_block(cache, child_block, report, flags)?;
        } else if let Some(Data::Buf(b)) = entry.get(Tag::MDir) {
            let blocks = decode_block_pair(b.as_slice())?;
            visit_mdir(cache, blocks, report, flags)?;
        } else if let Some(Data::Buf(b)) = entry.get(Tag::Block) {
            visit_bptr(cache, b.as_slice(), report, flags)?;
        }
    }
    Ok(())
}

fn visit_bptr<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    encoded: &[u8],
    report: &mut TraversalReport,
    flags: CheckFlags,
) -> crate::Result<()> {
    let (_size, block, off, cksize, cksum) = attr::decode_bptr(encoded)?;
    report.blocks.insert(block);
    if flags.data {
        match cache.cksum(block, off, cksize) {
            Ok(actual) if actual == cksum => {}
            _ => report.data_errors.push(block),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::commit::{commit, grow_mtree};
    use crate::data::Data;
    use crate::device::{Geometry, RamDevice};
    use crate::file::{Content, File, FileConfig, OpenFlags};
    use crate::gstate::GlobalState;
    use crate::mtree::Mtree;
    use crate::rbyd::{attr, Edit};

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 64,
        }
    }

    #[test]
    fn fresh_format_reaches_only_the_anchor() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mroot = MrootChain::format(&mut cache, 256, 64, 255, 0x7fff_ffff).unwrap();

        let report = traverse(&mut cache, &mroot, CheckFlags::all()).unwrap();
        assert_eq!(report.blocks, FxHashSet::from_iter([0, 1]));
        assert!(report.is_clean());
    }

    #[test]
    fn traversal_follows_mtree_into_mdirs_and_file_content() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 40);
        let mut mroot = MrootChain::format(&mut cache, 256, 64, 255, 0x7fff_ffff).unwrap();
        let mut mtree = Mtree::new_empty(crate::mtree::mbits_for(256));
        let mut gstate = GlobalState::new();

        let mbid = grow_mtree(&mut cache, &mut alloc, &mut mtree).unwrap();

        let cfg = FileConfig { inline_size: 16, fragment_size: 8, crystal_thresh: 16, window_cap: 64 };
        let mut file = File::create_empty(OpenFlags::read_write());
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        file.write(&mut cache, &mut alloc, &cfg, &payload, 0x7fff_ffff).unwrap();
        let content = file.sync(&mut cache, &mut alloc, &cfg).unwrap();
        let (tag, data) = content.struct_tag().expect("chunked content has a struct tag");

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Reg, Data::from_buf(attr::encode_name(0, b"big")));
        edit.set(0, tag, data);
        commit(&mut cache, &mut alloc, &mut mroot, &mut mtree, &mut gstate, mbid, &edit).unwrap();

        let mut edit = Edit::new();
        edit.set(0, Tag::MTree, mtree.struct_tag().unwrap().1);
        mroot.active_mut().commit(&mut cache, &edit).unwrap();

        let report = traverse(&mut cache, &mroot, CheckFlags::all()).unwrap();
        assert!(report.is_clean());
        // anchor pair + the grown mdir's pair + at least one data block.
        assert!(report.blocks.len() >= 5);
    }
}
