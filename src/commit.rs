// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Atomic multi-level commit (spec §4.9, §7 "Crash recovery").
//!
//! A caller never touches an `Mdir` directly: every edit goes through
//! [`commit`], which locates the mdir owning `mbid`, commits into it, and
//! folds the resulting cksum transition into the running [`GlobalState`].
//! For an mtree-addressed mdir, a bad standby block is recoverable:
//! relocate to a fresh pair and repoint the mtree leaf, which is just a
//! value the mtree is free to update. The 2b-only sole container at the
//! fixed anchor `{0,1}` has no such freedom — relocating it means
//! leaving a redirect behind for every future mount to find, which in
//! turn requires carrying forward *all* of its rids (not just the fixed
//! config tags `MrootChain::extend` carries for a real mroot-over-mtree
//! setup). That case is not implemented: a bad block in the 2b-only
//! anchor surfaces as `Corrupt` rather than being recovered. See
//! DESIGN.md.
//!
//! Because every commit here already rewrites an mdir's full minimal
//! state (see `rbyd/mod.rs`), relocating to a same-sized fresh block
//! never recovers space a commit didn't fit in the first place. An edit
//! whose encoded size exceeds one block is a hard `NoSpc`: splitting one
//! overfull mdir into two (growing the mtree mid-commit) is not
//! implemented either.

use crate::alloc::Allocator;
use crate::cache::CachedDevice;
use crate::device::BlockDevice;
use crate::gstate::GlobalState;
use crate::mdir::Mdir;
use crate::mtree::{MrootChain, Mtree};
use crate::rbyd::Edit;

/// What happened to an mdir as a result of a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    InPlace,
    Relocated([u32; 2]),
}

/// Commits `edit` against `mdir` in place: no relocation attempted, so a
/// bad standby block surfaces as `Err(Corrupt)` to the caller. Used for
/// the 2b-only anchor, where relocation isn't implemented.
fn commit_in_place<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    gstate: &mut GlobalState,
    mdir: &mut Mdir,
    edit: &Edit,
) -> crate::Result<()> {
    let old_cksum = mdir.cksum();
    match mdir.commit(cache, edit) {
        Ok(()) => {
            gstate.note_cksum_change(old_cksum, mdir.cksum());
            gstate.checkpoint();
            Ok(())
        }
        Err(crate::Error::Range) => {
            gstate.rollback();
            Err(crate::Error::NoSpc)
        }
        Err(e) => {
            gstate.rollback();
            Err(e)
        }
    }
}

/// Commits `edit` against `mdir`, relocating to a freshly allocated pair
/// if the standby block is bad. Always leaves `gstate` folded in on
/// success, or rolled back to its last checkpoint on failure.
fn commit_relocatable<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    gstate: &mut GlobalState,
    mdir: &mut Mdir,
    edit: &Edit,
) -> crate::Result<CommitOutcome> {
    let old_cksum = mdir.cksum();
    match mdir.commit(cache, edit) {
        Ok(()) => {
            gstate.note_cksum_change(old_cksum, mdir.cksum());
            gstate.checkpoint();
            Ok(CommitOutcome::InPlace)
        }
        Err(crate::Error::Range) => {
            gstate.rollback();
            Err(crate::Error::NoSpc)
        }
        Err(crate::Error::Corrupt) => match relocate(cache, alloc, mdir, edit) {
            Ok(new_blocks) => {
                log::warn!("relocating mdir to {new_blocks:?} after a bad standby block");
                gstate.note_cksum_change(old_cksum, mdir.cksum());
                gstate.checkpoint();
                Ok(CommitOutcome::Relocated(new_blocks))
            }
            Err(e) => {
                gstate.rollback();
                Err(e)
            }
        },
        Err(e) => {
            gstate.rollback();
            Err(e)
        }
    }
}

/// Carries `mdir`'s existing entries plus `edit` onto a freshly allocated
/// pair, replacing `*mdir` with the relocated state in place.
fn relocate<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    mdir: &mut Mdir,
    edit: &Edit,
) -> crate::Result<[u32; 2]> {
    let new_blocks = [alloc.alloc()?, alloc.alloc()?];
    let mut fresh = Mdir::format(cache, new_blocks)?;

    let mut carry = Edit::new();
    for (rid, entry) in mdir.entries().iter().enumerate() {
        carry.create(rid as u32, entry.weight);
        for (tag, data) in &entry.tags {
            carry.set(rid as u32, *tag, data.clone());
        }
    }
    fresh.commit(cache, &carry)?;
    fresh.commit(cache, edit)?;
    *mdir = fresh;
    Ok(new_blocks)
}

/// Commits `edit` against the mdir owning global id `mbid`, or the
/// mroot's sole mdir in 2b-only mode.
pub fn commit<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    mroot: &mut MrootChain,
    mtree: &mut Mtree,
    gstate: &mut GlobalState,
    mbid: u32,
    edit: &Edit,
) -> crate::Result<()> {
    log::trace!("commit: mbid={mbid} 2b_only={}", mtree.is_2b_only());
    if mtree.is_2b_only() {
        return commit_in_place(cache, gstate, mroot.active_mut(), edit);
    }

    let blocks = mtree.lookup_blocks(cache, mbid)?;
    let mut target = Mdir::fetch(cache, blocks)?;
    let outcome = commit_relocatable(cache, alloc, gstate, &mut target, edit)?;
    if let CommitOutcome::Relocated(new_blocks) = outcome {
        mtree.set_mdir(cache, alloc, mbid, new_blocks)?;
    }
    Ok(())
}

/// Appends a brand new mdir (for a newly created directory or an mtree
/// that just outgrew 2b-only mode), returning the mbid assigned to its
/// first rid.
pub fn grow_mtree<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    mtree: &mut Mtree,
) -> crate::Result<u32> {
    let blocks = [alloc.alloc()?, alloc.alloc()?];
    log::debug!("growing mtree with a fresh mdir at {blocks:?}");
    Mdir::format(cache, blocks)?;
    mtree.push_mdir(cache, alloc, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::device::{FaultInjectingDevice, Geometry, RamDevice};
    use crate::rbyd::attr;
    use crate::tag::Tag;

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 64,
        }
    }

    #[test]
    fn commit_to_2b_only_mroot_folds_gcksum() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut mroot = MrootChain::format(&mut cache, 256, 64, 255, 0x7fff_ffff).unwrap();
        let mut mtree = Mtree::new_empty(crate::mtree::mbits_for(256));
        let mut gstate = GlobalState::new();

        let mut edit = Edit::new();
        edit.create(1, 1);
        edit.set(1, Tag::Reg, Data::from_buf(attr::encode_name(0, b"a")));
        commit(&mut cache, &mut alloc, &mut mroot, &mut mtree, &mut gstate, 0, &edit).unwrap();

        assert!(mroot.active().lookup(1, Tag::Reg).is_some());
        assert_ne!(gstate.gcksum, 0);
    }

    #[test]
    fn commit_relocates_a_bad_standby_block_for_an_mtree_leaf() {
        let mut cache = CachedDevice::new(FaultInjectingDevice::new(RamDevice::new(geom())), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut mroot = MrootChain::format(&mut cache, 256, 64, 255, 0x7fff_ffff).unwrap();
        let mut mtree = Mtree::new_empty(crate::mtree::mbits_for(256));
        let mut gstate = GlobalState::new();

        let mbid = grow_mtree(&mut cache, &mut alloc, &mut mtree).unwrap();
        let [_, b] = mtree.lookup_blocks(&mut cache, mbid).unwrap();
        cache.device_mut().mark_bad(b);

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Reg, Data::from_buf(attr::encode_name(0, b"a")));
        commit(&mut cache, &mut alloc, &mut mroot, &mut mtree, &mut gstate, mbid, &edit).unwrap();

        let relocated = mtree.lookup_blocks(&mut cache, mbid).unwrap();
        assert_ne!(relocated[1], b);
        let mdir = Mdir::fetch(&mut cache, relocated).unwrap();
        assert!(mdir.lookup(0, Tag::Reg).is_some());
    }

    #[test]
    fn grow_mtree_then_commit_routes_to_the_right_mdir() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut mtree = Mtree::new_empty(crate::mtree::mbits_for(256));
        let mut gstate = GlobalState::new();
        let mut mroot = MrootChain::format(&mut cache, 256, 64, 255, 0x7fff_ffff).unwrap();

        let mbid = grow_mtree(&mut cache, &mut alloc, &mut mtree).unwrap();

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Reg, Data::from_buf(attr::encode_name(0, b"b")));
        commit(&mut cache, &mut alloc, &mut mroot, &mut mtree, &mut gstate, mbid, &edit).unwrap();

        let blocks = mtree.lookup_blocks(&mut cache, mbid).unwrap();
        let mdir = Mdir::fetch(&mut cache, blocks).unwrap();
        assert!(mdir.lookup(0, Tag::Reg).is_some());
    }
}
