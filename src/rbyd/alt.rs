// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Alt-pointer inner nodes (spec §3/§4.2): each inner node of an rbyd's
//! tag tree carries the weight of its inline ("LE") subtree and an
//! absolute jump to its other ("GT") subtree's first record, plus that
//! subtree's own end offset (`jump_stop`) — needed once the GT side can
//! be a physically disjoint, previously-committed range reused as-is by
//! an incremental append (see `rbyd/mod.rs::append`) rather than always
//! the remainder of the node's own contiguous byte range.
//!
//! Colours are real: `compact::build_colors` derives a genuine red-black
//! coloring (every root-to-rid path visits the same number of black alt
//! nodes) from the shape the balanced-split builder already produces,
//! rather than hard-coding every node black.

use crate::tag::{AltColor, AltDir, Tag};

/// One inner node: `weight` is the rid-count covered by the subtree
/// reached immediately (physically contiguous right after this record);
/// `jump`/`jump_stop` bound the other subtree, which may sit anywhere
/// else in the block rather than only immediately after. `dir` records
/// which logical side (lower-rid "LE", or higher-rid "GT") is the
/// immediate one: a full rewrite always writes LE first and so is
/// immediate (`AltDir::Le`); an incremental append instead grafts new,
/// higher-rid entries immediately after the alt node while reaching the
/// unmoved, lower-rid, previously-committed trunk by jumping backward
/// (`AltDir::Gt`).
#[derive(Copy, Clone, Debug)]
pub struct AltNode {
    pub weight: u32,
    pub jump: u32,
    pub jump_stop: u32,
    pub dir: AltDir,
    pub color: AltColor,
}

/// Width of an [`AltNode`]'s payload: two fixed-size `le32`s (`jump`,
/// `jump_stop`), chosen so a node's on-disk size never depends on the
/// very offsets its own construction needs to compute (see
/// `compact::size_of`).
pub const JUMP_PAYLOAD_SIZE: u32 = 8;

impl AltNode {
    #[must_use]
    pub fn tag(self) -> Tag {
        Tag::Alt {
            dir: self.dir,
            color: self.color,
        }
    }

    #[must_use]
    pub fn encode_payload(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.jump.to_le_bytes());
        buf[4..8].copy_from_slice(&self.jump_stop.to_le_bytes());
        buf
    }

    pub fn decode_payload(buf: &[u8]) -> crate::Result<(u32, u32)> {
        if buf.len() != JUMP_PAYLOAD_SIZE as usize {
            return Err(crate::Error::Corrupt);
        }
        let jump = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let jump_stop = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok((jump, jump_stop))
    }
}
