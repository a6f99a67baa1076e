// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Balanced tree construction and the generic tag-record codec (spec
//! §4.2 "Compact"): builds a balanced binary tree of [`AltNode`]s over a
//! sorted slice of rids, bottom-up, used both by a full rewrite and by
//! `rbyd/mod.rs::append`'s incremental graft of newly-created rids onto
//! an existing on-disk trunk.
//!
//! The split points are chosen the same way every time (always the
//! midpoint), which makes every leaf's depth differ from every other
//! leaf's by at most one level; `build_colors` exploits that to derive a
//! genuine red-black coloring (every root-to-rid path crosses the same
//! number of black alt nodes, no two reds in a row) instead of emitting
//! every alt as black.

use super::alt::AltNode;
use crate::coding::{
    leb128_u32_size, read_be16, read_leb128_u32, write_be16, write_leb128_u32,
};
use crate::data::Data;
use crate::tag::{AltColor, AltDir, Tag};

fn dummy_alt() -> AltNode {
    AltNode { weight: 0, jump: 0, jump_stop: 0, dir: AltDir::Le, color: AltColor::Black }
}

/// The number of alt levels a balanced split of `n` leaves produces (0 if
/// `n <= 1`, i.e. no alt node exists at all). Root-to-deepest-leaf depth
/// is `alt_levels(n) - 1`; every leaf lands at that depth or one shallower,
/// since each split puts `n/2`/`n - n/2` leaves either side.
fn alt_levels(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        let mid = n / 2;
        1 + alt_levels(mid).max(alt_levels(n - mid))
    }
}

/// Colours the alt node splitting `n` leaves at 0-indexed `depth` within a
/// tree whose deepest alt level is `height` (0-indexed): red at the
/// deepest level, black everywhere above. Every leaf sits at depth
/// `height` (through one red alt) or `height` exactly-reached-without-red
/// (via a black alt with no deeper child), so every path crosses exactly
/// `height` black alts — red nodes never have a red parent since their
/// own children, one level deeper than the deepest alt level, don't exist.
fn build_colors(depth: u32, height: u32) -> AltColor {
    if depth == height {
        AltColor::Red
    } else {
        AltColor::Black
    }
}

/// One rid's full tag run: `weight` is this rid's contribution to the
/// rbyd's total weight, `tags` its records sorted by [`crate::tag::sort_key`].
#[derive(Clone, Debug)]
pub struct RidEntry {
    pub weight: u32,
    pub tags: Vec<(Tag, Data)>,
}

impl RidEntry {
    #[must_use]
    pub fn new(weight: u32) -> Self {
        Self {
            weight,
            tags: Vec::new(),
        }
    }

    pub fn get(&self, tag: Tag) -> Option<&Data> {
        let key = crate::tag::sort_key(tag);
        self.tags
            .iter()
            .find(|(t, _)| crate::tag::sort_key(*t) == key)
            .map(|(_, d)| d)
    }

    pub fn set(&mut self, tag: Tag, data: Data) {
        let key = crate::tag::sort_key(tag);
        if let Some(slot) = self.tags.iter_mut().find(|(t, _)| crate::tag::sort_key(*t) == key) {
            slot.1 = data;
        } else {
            self.tags.push((tag, data));
            self.tags.sort_by_key(|(t, _)| crate::tag::sort_key(*t));
        }
    }

    pub fn unset(&mut self, tag: Tag) {
        let key = crate::tag::sort_key(tag);
        self.tags.retain(|(t, _)| crate::tag::sort_key(*t) != key);
    }

    /// Removes every tag of `target`'s mode whose subtype shares `anchor`'s
    /// high bits at `width` (spec §3/§4.2 "MASK0/2/8/12"), in one pass
    /// instead of one `unset` per matching tag.
    pub fn unset_masked(&mut self, target: crate::tag::Mode, width: crate::tag::MaskWidth, anchor: u16) {
        self.tags.retain(|(t, _)| {
            if t.mode() != target {
                return true;
            }
            let sub = t.encode() & 0x7ff;
            !width.covers(anchor, sub)
        });
    }
}

/// Encodes one generic tag record: `be16 tag | leb128 weight | leb128
/// size | payload`.
pub fn encode_record(tag: Tag, weight: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + 5 + 5 + payload.len());
    write_be16(&mut buf, tag.encode()).unwrap();
    write_leb128_u32(&mut buf, weight).unwrap();
    write_leb128_u32(&mut buf, payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
    buf
}

pub fn record_size(tag: Tag, weight: u32, payload_len: u32) -> u32 {
    2 + leb128_u32_size(weight) as u32 + leb128_u32_size(payload_len) as u32 + payload_len
}

/// A decoded record header, with the payload left as a `(start, len)`
/// range into the scanned buffer so callers decide how to materialize it
/// (copy for small structural tags, borrow-as-disk-slice for bulk DATA).
pub struct RawRecord {
    pub tag: Tag,
    pub weight: u32,
    pub payload_off: usize,
    pub payload_len: usize,
    pub record_len: usize,
}

/// Parses one record header from `buf` starting at `off`. The top bit of
/// the on-disk tag is the commit's valid bit (spec §6), not part of the
/// logical tag, so it's masked off before decoding; a bare `0xffff` (the
/// erased-flash pattern) is rejected outright rather than risked against
/// the mode/subtype table.
pub fn decode_record(buf: &[u8], off: usize) -> crate::Result<RawRecord> {
    let mut cursor = buf.get(off..).ok_or(crate::Error::Corrupt)?;
    let remaining_before = cursor.len();
    let raw_tag = read_be16(&mut cursor)?;
    if raw_tag == 0xffff {
        return Err(crate::Error::Corrupt);
    }
    let tag = Tag::decode(raw_tag & 0x7fff)?;
    let weight = read_leb128_u32(&mut cursor)?;
    let size = read_leb128_u32(&mut cursor)? as usize;
    let consumed = remaining_before - cursor.len();
    let payload_off = off + consumed;
    if payload_off + size > buf.len() {
        return Err(crate::Error::Corrupt);
    }
    Ok(RawRecord {
        tag,
        weight,
        payload_off,
        payload_len: size,
        record_len: consumed + size,
    })
}

/// Rbyd leaf payloads are always materialized in RAM before a commit: every
/// record this engine writes full-state on each commit (see `rbyd/mod.rs`),
/// so a stale on-disk reference would silently serialize as empty bytes.
/// `Data::Disk`/`Data::DiskChecksummed` are reserved for bptr-referenced
/// file data blocks, handled by `file.rs`, never for rbyd's own records.
fn leaf_payload(data: &Data) -> Vec<u8> {
    match data {
        Data::Buf(b) => b.as_slice().to_vec(),
        Data::Disk(_) | Data::DiskChecksummed(_) => {
            unreachable!("rbyd records are always materialized before commit")
        }
    }
}

fn leaf_run_size(entry: &RidEntry) -> u32 {
    let mut total = 0u32;
    for (i, (tag, data)) in entry.tags.iter().enumerate() {
        let weight = if i == 0 { entry.weight } else { 0 };
        let payload_len = data.size();
        total += record_size(*tag, weight, payload_len);
    }
    total
}

fn write_leaf_run(buf: &mut Vec<u8>, entry: &RidEntry) {
    for (i, (tag, data)) in entry.tags.iter().enumerate() {
        let weight = if i == 0 { entry.weight } else { 0 };
        let payload = leaf_payload(data);
        buf.extend_from_slice(&encode_record(*tag, weight, &payload));
    }
}

/// Computes the number of bytes [`emit`] would write for `entries`,
/// without knowing any absolute offsets yet.
pub fn size_of(entries: &[RidEntry]) -> u32 {
    if entries.is_empty() {
        return 0;
    }
    if entries.len() == 1 {
        return leaf_run_size(&entries[0]);
    }
    let mid = entries.len() / 2;
    let le_weight: u32 = entries[..mid].iter().map(|e| e.weight).sum();
    let alt_size = record_size(dummy_alt().tag(), le_weight, super::alt::JUMP_PAYLOAD_SIZE);
    alt_size + size_of(&entries[..mid]) + size_of(&entries[mid..])
}

/// Writes a balanced tree over `entries` to `buf`, with the tree's first
/// byte landing at `base_offset` within the final block. Returns the
/// total weight written.
pub fn emit(entries: &[RidEntry], base_offset: u32, buf: &mut Vec<u8>) -> u32 {
    let height = alt_levels(entries.len()).saturating_sub(1);
    emit_at_depth(entries, base_offset, 0, height, buf)
}

fn emit_at_depth(
    entries: &[RidEntry],
    base_offset: u32,
    depth: u32,
    height: u32,
    buf: &mut Vec<u8>,
) -> u32 {
    if entries.is_empty() {
        return 0;
    }
    if entries.len() == 1 {
        write_leaf_run(buf, &entries[0]);
        return entries[0].weight;
    }

    let mid = entries.len() / 2;
    let le_weight: u32 = entries[..mid].iter().map(|e| e.weight).sum();
    let gt_weight: u32 = entries[mid..].iter().map(|e| e.weight).sum();
    let le_size = size_of(&entries[..mid]);
    let gt_size = size_of(&entries[mid..]);
    let alt_tag_size = record_size(dummy_alt().tag(), le_weight, super::alt::JUMP_PAYLOAD_SIZE);
    let jump = base_offset + alt_tag_size + le_size;
    let alt = AltNode {
        weight: le_weight,
        jump,
        jump_stop: jump + gt_size,
        dir: AltDir::Le,
        color: build_colors(depth, height),
    };
    buf.extend_from_slice(&encode_record(alt.tag(), alt.weight, &alt.encode_payload()));
    // Invariant: `buf.len()` always equals the absolute offset of the next
    // byte to be written, since `base_offset` started equal to `buf.len()`
    // and every write advances both in lockstep.
    emit_at_depth(&entries[..mid], buf.len() as u32, depth + 1, height, buf);
    emit_at_depth(&entries[mid..], alt.jump, depth + 1, height, buf);
    le_weight + gt_weight
}

/// Walks a previously emitted tree back into [`RidEntry`]s. An `AltDir::Le`
/// node's immediate subtree is bounded by `stop` like any nested record;
/// an `AltDir::Gt` node's jump target is instead bounded only by its own
/// `jump_stop`, since it may reuse a physically disjoint, earlier range.
pub fn parse(buf: &[u8], offset: u32, stop: u32) -> crate::Result<Vec<RidEntry>> {
    if offset >= stop {
        return Ok(vec![]);
    }
    let record = decode_record(buf, offset as usize)?;
    let record_end = offset + record.record_len as u32;
    if record_end > stop {
        return Err(crate::Error::Corrupt);
    }

    if record.tag.is_alt() {
        let (jump, jump_stop) = AltNode::decode_payload(
            &buf[record.payload_off..record.payload_off + record.payload_len],
        )?;
        if jump_stop < jump || jump_stop > buf.len() as u32 {
            return Err(crate::Error::Corrupt);
        }
        let Tag::Alt { dir, .. } = record.tag else { unreachable!() };
        match dir {
            // A full rewrite's convention: the lower-rid ("LE") subtree is
            // immediately contiguous after this node, bounded by `stop`
            // like any nested record; the higher-rid ("GT") subtree is
            // reached via `jump`/`jump_stop`.
            AltDir::Le => {
                if jump < record_end || jump > stop {
                    return Err(crate::Error::Corrupt);
                }
                let mut le = parse(buf, record_end, jump)?;
                let gt = parse(buf, jump, jump_stop)?;
                le.extend(gt);
                Ok(le)
            }
            // An incremental append's convention: the higher-rid ("GT")
            // subtree is the freshly-written, immediately-contiguous one;
            // the lower-rid ("LE") subtree is an unmoved, previously
            // committed trunk, reached by jumping backward.
            AltDir::Gt => {
                if jump > offset || jump_stop > offset {
                    return Err(crate::Error::Corrupt);
                }
                let mut le = parse(buf, jump, jump_stop)?;
                let gt = parse(buf, record_end, stop)?;
                le.extend(gt);
                Ok(le)
            }
        }
    } else {
        // A leaf run occupies the rest of this subtree's byte range
        // verbatim; walk it tag-by-tag, starting a new RidEntry every
        // time we see a non-zero weight field (our own write convention:
        // only the first tag of a rid's run carries its weight).
        let mut entries = vec![];
        let mut cursor = offset;
        while cursor < stop {
            let rec = decode_record(buf, cursor as usize)?;
            let payload = &buf[rec.payload_off..rec.payload_off + rec.payload_len];
            let data = Data::from_buf(payload.to_vec());
            if rec.weight > 0 || entries.is_empty() {
                entries.push(RidEntry {
                    weight: rec.weight,
                    tags: vec![(rec.tag, data)],
                });
            } else if let Some(last) = entries.last_mut() {
                last.tags.push((rec.tag, data));
            }
            cursor += rec.record_len as u32;
        }
        if cursor != stop {
            return Err(crate::Error::Corrupt);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(weight: u32, name: &str) -> RidEntry {
        let mut e = RidEntry::new(weight);
        e.set(Tag::Name, Data::from_buf(name.as_bytes().to_vec()));
        e
    }

    #[test]
    fn balanced_tree_roundtrips() {
        let entries: Vec<_> = (0..7).map(|i| entry(1, &format!("file{i}"))).collect();
        let mut buf = vec![];
        let weight = emit(&entries, 0, &mut buf);
        assert_eq!(weight, 7);

        let parsed = parse(&buf, 0, buf.len() as u32).unwrap();
        assert_eq!(parsed.len(), 7);
        for (orig, got) in entries.iter().zip(parsed.iter()) {
            assert_eq!(orig.weight, got.weight);
            let Data::Buf(a) = orig.get(Tag::Name).unwrap() else { panic!() };
            let Data::Buf(b) = got.get(Tag::Name).unwrap() else { panic!() };
            assert_eq!(a.as_slice(), b.as_slice());
        }
    }

    #[test]
    fn unset_masked_removes_matching_group_only() {
        let mut e = RidEntry::new(1);
        e.set(Tag::Attr(0b0000_0001), Data::from_buf(vec![1]));
        e.set(Tag::Attr(0b0000_0011), Data::from_buf(vec![2]));
        e.set(Tag::Attr(0b1111_0000), Data::from_buf(vec![3]));
        e.unset_masked(crate::tag::Mode::Attr, crate::tag::MaskWidth::Mask2, 0b0000_0011);
        assert!(e.get(Tag::Attr(0b0000_0001)).is_none());
        assert!(e.get(Tag::Attr(0b0000_0011)).is_none());
        assert!(e.get(Tag::Attr(0b1111_0000)).is_some());
    }

    #[test]
    fn single_entry_has_no_alt_node() {
        let entries = vec![entry(1, "only")];
        let mut buf = vec![];
        emit(&entries, 0, &mut buf);
        let rec = decode_record(&buf, 0).unwrap();
        assert!(!rec.tag.is_alt());
    }
}
