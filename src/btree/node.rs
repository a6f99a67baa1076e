// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A btree node is just an [`Rbyd`]: either a leaf (every rid carries real
//! data tags) or a branch (every rid carries a single BRANCH tag pointing
//! at a child block). Spec §4.3.

use crate::cache::CachedDevice;
use crate::data::Data;
use crate::device::BlockDevice;
use crate::rbyd::{attr, Rbyd};
use crate::tag::Tag;

/// One level of a [`super::Btree`].
#[derive(Clone)]
pub enum Node {
    Leaf(Rbyd),
    Branch(Rbyd),
}

impl Node {
    #[must_use]
    pub fn weight(&self) -> u32 {
        match self {
            Self::Leaf(r) | Self::Branch(r) => r.weight(),
        }
    }

    #[must_use]
    pub fn block(&self) -> u32 {
        match self {
            Self::Leaf(r) | Self::Branch(r) => r.block,
        }
    }

    #[must_use]
    pub fn cksum(&self) -> u32 {
        match self {
            Self::Leaf(r) | Self::Branch(r) => r.cksum,
        }
    }

    #[must_use]
    pub fn rbyd(&self) -> &Rbyd {
        match self {
            Self::Leaf(r) | Self::Branch(r) => r,
        }
    }

    pub fn rbyd_mut(&mut self) -> &mut Rbyd {
        match self {
            Self::Leaf(r) | Self::Branch(r) => r,
        }
    }

    /// Whether this node's children (if any) are themselves BRANCH levels
    /// rather than data leaves — used to rebuild the same [`Node`] kind a
    /// split produced, one level up.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Branch(_))
    }
}

/// Classifies a freshly fetched rbyd as a leaf or a branch by inspecting
/// its own entries for BRANCH tags — this engine stores no separate
/// "is this a branch node" flag alongside a btree pointer, so the shape
/// is self-describing from the node's own contents. An empty rbyd (no
/// entries to inspect) is treated as a leaf, matching a brand new root.
#[must_use]
pub fn classify(rbyd: Rbyd) -> Node {
    let is_branch = rbyd.entries().iter().any(|e| e.get(Tag::Branch).is_some());
    if is_branch {
        Node::Branch(rbyd)
    } else {
        Node::Leaf(rbyd)
    }
}

/// Fetches the child pointed to by a BRANCH tag's payload and classifies
/// it, so a btree of unbounded depth can tell whether it just stepped
/// into another branch level or reached a leaf.
pub fn fetch_child_node<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    payload: &Data,
) -> crate::Result<Node> {
    let Data::Buf(buf) = payload else {
        return Err(crate::Error::Corrupt);
    };
    let (_, block, _trunk, _cksum) = attr::decode_branch(buf.as_slice())?;
    Ok(classify(Rbyd::fetch(cache, block)?))
}

/// Encodes a BRANCH tag pointing at `child`, whatever its own kind (leaf
/// or, for a deeper tree, another branch level) — readers re-derive that
/// from the child's own contents (see [`classify`]) rather than trusting
/// a flag here.
#[must_use]
pub fn branch_tag_data(child: &Rbyd) -> (Tag, Data) {
    (
        Tag::Branch,
        Data::from_buf(attr::encode_branch(child.weight(), child.block, child.trunk_off(), child.cksum)),
    )
}
