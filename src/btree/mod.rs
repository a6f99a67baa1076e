// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Copy-on-write B-tree of rbyd nodes (spec §4.3).
//!
//! Every leaf rid carries weight 1, so a rid's position in the tree *is*
//! its logical index — sufficient for this engine's one real consumer,
//! `file.rs`'s block-pointer list. The general variable-weight range
//! btree spec.md §4.3 describes is not implemented; see DESIGN.md.
//!
//! Depth is unbounded: a branch whose own rbyd overflows splits exactly
//! like a leaf does (`commit_or_split` doesn't care what the entries it's
//! splitting mean), and the split bubbles up one level at a time. Once
//! the root itself splits, a brand new root is promoted above both
//! halves. A child's kind (leaf, or another branch level) is never
//! stored as a flag — it's re-derived from the child's own contents on
//! every fetch (`node::classify`), so nothing needs to track depth
//! explicitly.

pub mod node;

use crate::alloc::Allocator;
use crate::cache::CachedDevice;
use crate::data::Data;
use crate::device::BlockDevice;
use crate::rbyd::{Edit, RidEntry, Rbyd};
use crate::tag::Tag;

pub use node::Node;

/// A btree, rooted either directly at a leaf or at a branch over leaves.
#[derive(Clone)]
pub struct Btree {
    pub root: Node,
}

impl Btree {
    #[must_use]
    pub fn new_empty(root_block: u32) -> Self {
        Self {
            root: Node::Leaf(Rbyd::new_empty(root_block, 0)),
        }
    }

    #[must_use]
    pub fn from_root(root: Node) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.root.weight()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn root_pointer(&self) -> (u32, u32) {
        (self.root.block(), self.root.cksum())
    }

    /// Returns the rid entry at logical index `idx`.
    pub fn get<D: BlockDevice>(
        &self,
        cache: &mut CachedDevice<D>,
        idx: u32,
    ) -> crate::Result<Option<RidEntry>> {
        get_in_node(cache, &self.root, idx)
    }

    /// Appends a new rightmost entry with weight 1.
    pub fn push<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        tags: Vec<(Tag, Data)>,
    ) -> crate::Result<()> {
        let idx = self.len();
        self.insert_at(cache, alloc, idx, tags)
    }

    /// Inserts a new weight-1 entry at logical index `idx`, shifting
    /// everything at or after `idx` up by one.
    pub fn insert_at<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        idx: u32,
        tags: Vec<(Tag, Data)>,
    ) -> crate::Result<()> {
        self.edit_at(cache, alloc, idx, &mut |leaf, local| {
            let mut edit = Edit::new();
            edit.create(local, 1);
            for (tag, data) in tags.clone() {
                edit.set(local, tag, data);
            }
            leaf.apply(&edit)
        })
    }

    /// Overwrites the tags of the entry at `idx` (must already exist).
    pub fn set<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        idx: u32,
        tags: Vec<(Tag, Data)>,
    ) -> crate::Result<()> {
        self.edit_at(cache, alloc, idx, &mut |leaf, local| {
            let mut edit = Edit::new();
            for (tag, data) in tags.clone() {
                edit.set(local, tag, data);
            }
            leaf.apply(&edit)
        })
    }

    /// Drops every entry at or after `new_len`.
    pub fn truncate<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        new_len: u32,
    ) -> crate::Result<()> {
        while self.len() > new_len {
            self.pop_back(cache, alloc)?;
        }
        Ok(())
    }

    fn pop_back<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
    ) -> crate::Result<()> {
        let idx = self.len() - 1;
        self.edit_at(cache, alloc, idx, &mut |leaf, local| {
            let mut edit = Edit::new();
            edit.delete(local);
            leaf.apply(&edit)
        })
    }

    /// Applies `edit` to the leaf rbyd that owns logical index `idx`,
    /// then commits every level on the path back up to the root,
    /// cascading a split upward however many levels deep it needs to —
    /// promoting a brand new root if the existing one overflows too.
    fn edit_at<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        idx: u32,
        edit: &mut dyn FnMut(&mut Rbyd, u32) -> crate::Result<()>,
    ) -> crate::Result<()> {
        if let Some(right) = apply_in_node(cache, alloc, &mut self.root, idx, edit)? {
            self.promote_root(cache, alloc, right)
        } else {
            Ok(())
        }
    }

    /// Wraps the current root and `right` (its just-split sibling, the
    /// same kind of node as the old root) under a brand new branch.
    fn promote_root<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        right: Node,
    ) -> crate::Result<()> {
        let left = std::mem::replace(&mut self.root, Node::Branch(Rbyd::new_empty(0, 0)));

        let branch_block = alloc.alloc()?;
        let mut branch = Rbyd::new_empty(branch_block, 0);
        let left_tag = node::branch_tag_data(left.rbyd());
        let right_tag = node::branch_tag_data(right.rbyd());
        let mut edit = Edit::new();
        edit.create(0, left.weight());
        edit.set(0, left_tag.0, left_tag.1);
        edit.create(1, right.weight());
        edit.set(1, right_tag.0, right_tag.1);
        branch.apply(&edit)?;
        branch.commit(cache)?;
        self.root = Node::Branch(branch);
        Ok(())
    }
}

/// Looks up `idx` by descending through however many branch levels sit
/// above the leaf that owns it.
fn get_in_node<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    node: &Node,
    idx: u32,
) -> crate::Result<Option<RidEntry>> {
    match node {
        Node::Leaf(rbyd) => Ok(rbyd.entry(idx).cloned()),
        Node::Branch(branch) => {
            let Some((child_idx, branch_entry)) = locate(branch, idx) else {
                return Ok(None);
            };
            let offset = preceding_weight(branch, child_idx);
            let payload = branch_entry.get(Tag::Branch).ok_or(crate::Error::Corrupt)?;
            let child = node::fetch_child_node(cache, payload)?;
            get_in_node(cache, &child, idx - offset)
        }
    }
}

/// Applies `edit` to the leaf owning `idx`, fetching and recursing
/// through intervening branch levels and re-committing each one on the
/// way back up. Returns `Some(right)` if `node` itself split and needs a
/// new sibling entry in its own parent (or, at the root, a promotion).
fn apply_in_node<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    node: &mut Node,
    idx: u32,
    edit: &mut dyn FnMut(&mut Rbyd, u32) -> crate::Result<()>,
) -> crate::Result<Option<Node>> {
    match node {
        Node::Leaf(rbyd) => {
            edit(rbyd, idx)?;
            let split = commit_or_split(cache, alloc, rbyd)?;
            Ok(split.map(Node::Leaf))
        }
        Node::Branch(branch) => {
            let (child_idx, offset) = locate(branch, idx)
                .map(|(i, _)| (i, preceding_weight(branch, i)))
                .ok_or(crate::Error::Inval)?;
            let old_weight = branch.entry(child_idx).map_or(0, |e| e.weight);
            let payload = branch
                .entry(child_idx)
                .and_then(|e| e.get(Tag::Branch))
                .ok_or(crate::Error::Corrupt)?;
            let mut child = node::fetch_child_node(cache, payload)?;

            let child_split = apply_in_node(cache, alloc, &mut child, idx - offset, edit)?;

            let mut branch_edit = Edit::new();
            let child_rbyd = child.rbyd();
            if child_rbyd.weight() == 0 {
                branch_edit.delete(child_idx);
            } else {
                let delta = i64::from(child_rbyd.weight()) as i32 - old_weight as i32;
                branch_edit.grow(child_idx, delta);
                let (tag, data) = node::branch_tag_data(child_rbyd);
                branch_edit.set(child_idx, tag, data);
            }
            if let Some(right) = &child_split {
                let (rtag, rdata) = node::branch_tag_data(right.rbyd());
                branch_edit.create(child_idx + 1, right.weight());
                branch_edit.set(child_idx + 1, rtag, rdata);
            }
            branch.apply(&branch_edit)?;

            let split = commit_or_split(cache, alloc, branch)?;
            Ok(split.map(Node::Branch))
        }
    }
}

/// Finds the rid in `branch` covering logical index `idx`, by linear
/// prefix-sum scan (branch fan-out is small: one block's worth of
/// BRANCH tags).
fn locate(branch: &Rbyd, idx: u32) -> Option<(u32, &RidEntry)> {
    let mut acc = 0u32;
    for (i, entry) in branch.entries().iter().enumerate() {
        if idx < acc + entry.weight {
            return Some((i as u32, entry));
        }
        acc += entry.weight;
    }
    None
}

fn preceding_weight(branch: &Rbyd, child_idx: u32) -> u32 {
    branch.entries()[..child_idx as usize]
        .iter()
        .map(|e| e.weight)
        .sum()
}

/// Commits `rbyd`; on overflow, splits its rid set across a freshly
/// allocated sibling block and commits both halves, returning the new
/// right sibling.
fn commit_or_split<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    rbyd: &mut Rbyd,
) -> crate::Result<Option<Rbyd>> {
    match rbyd.commit(cache) {
        Ok(()) => Ok(None),
        Err(crate::Error::Range) => {
            let entries = rbyd.entries().to_vec();
            if entries.len() < 2 {
                return Err(crate::Error::FBig);
            }
            let mid = entries.len() / 2;

            let right_block = alloc.alloc()?;
            let mut right = Rbyd::new_empty(right_block, 0);
            let mut right_edit = Edit::new();
            for (i, entry) in entries[mid..].iter().enumerate() {
                right_edit.create(i as u32, entry.weight);
                for (tag, data) in &entry.tags {
                    right_edit.set(i as u32, *tag, data.clone());
                }
            }
            right.apply(&right_edit)?;
            right.commit(cache)?;

            let mut left_edit = Edit::new();
            for i in (mid..entries.len()).rev() {
                left_edit.delete(i as u32);
            }
            rbyd.apply(&left_edit)?;
            rbyd.commit(cache)?;

            Ok(Some(right))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::cache::CachedDevice;
    use crate::device::{Geometry, RamDevice};

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 64,
        }
    }

    #[test]
    fn push_and_get_within_one_leaf() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut btree = Btree::new_empty(alloc.alloc().unwrap());

        for i in 0..4u32 {
            btree
                .push(&mut cache, &mut alloc, vec![(Tag::Data, Data::from_buf(vec![i as u8; 4]))])
                .unwrap();
        }
        assert_eq!(btree.len(), 4);
        let entry = btree.get(&mut cache, 2).unwrap().unwrap();
        let Data::Buf(b) = entry.get(Tag::Data).unwrap() else { panic!() };
        assert_eq!(b.as_slice(), &[2, 2, 2, 2]);
    }

    #[test]
    fn push_past_one_block_splits_into_a_branch() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut btree = Btree::new_empty(alloc.alloc().unwrap());

        for i in 0..40u32 {
            btree
                .push(&mut cache, &mut alloc, vec![(Tag::Data, Data::from_buf(vec![i as u8; 8]))])
                .unwrap();
        }
        assert_eq!(btree.len(), 40);
        assert!(matches!(btree.root, Node::Branch(_)));
        let entry = btree.get(&mut cache, 35).unwrap().unwrap();
        let Data::Buf(b) = entry.get(Tag::Data).unwrap() else { panic!() };
        assert_eq!(b.as_slice(), &[35u8; 8]);
    }

    fn depth<D: BlockDevice>(cache: &mut CachedDevice<D>, node: &Node) -> usize {
        match node {
            Node::Leaf(_) => 1,
            Node::Branch(rbyd) => {
                let entry = rbyd.entry(0).unwrap();
                let payload = entry.get(Tag::Branch).unwrap();
                let child = node::fetch_child_node(cache, payload).unwrap();
                1 + depth(cache, &child)
            }
        }
    }

    #[test]
    fn enough_pushes_promote_a_third_level() {
        // Tiny blocks so both a leaf and a one-level branch overflow well
        // before the test would need hundreds of pushes to prove the root
        // can be promoted more than once.
        let tiny = Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 64,
            block_count: 256,
        };
        let mut cache = CachedDevice::new(RamDevice::new(tiny), 256);
        let mut alloc = Allocator::new(256, 128);
        let mut btree = Btree::new_empty(alloc.alloc().unwrap());

        for i in 0..60u32 {
            btree
                .push(&mut cache, &mut alloc, vec![(Tag::Data, Data::from_buf(vec![i as u8]))])
                .unwrap();
        }
        assert_eq!(btree.len(), 60);
        assert!(depth(&mut cache, &btree.root) >= 3);

        for i in [0u32, 29, 59] {
            let entry = btree.get(&mut cache, i).unwrap().unwrap();
            let Data::Buf(b) = entry.get(Tag::Data).unwrap() else { panic!() };
            assert_eq!(b.as_slice(), &[i as u8]);
        }
    }
}
