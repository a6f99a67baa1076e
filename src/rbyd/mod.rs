// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `Rbyd`: one checksummed, balanced tag tree living in a single block
//! (spec §3/§4.2), built through two distinct operations:
//!
//! - [`Rbyd::compact`] erases the block and writes a fresh balanced tree
//!   over the full current rid set, from scratch.
//! - [`Rbyd::append`] instead threads only the newly created trailing
//!   rids into the block's already-erased tail, leaving every previously
//!   committed byte untouched: one new [`alt::AltNode`] is written whose
//!   `AltDir::Gt` side is a fresh balanced subtree over the new rids and
//!   whose other side jumps backward into the unmoved old trunk.
//!
//! [`Rbyd::commit`] picks between the two: `append` whenever nothing
//! before the trunk's rid boundary was touched and the tail is known
//! (via a preceding ECKSUM record) to still be erased, `compact`
//! otherwise. Both seal the commit with a CKSUM record carrying the
//! offset of the tree's root (`4` for a compact, the new alt node's own
//! offset for an append) plus a crc32c over everything from the start of
//! the block, and both set a self-synchronizing valid bit (spec §6) on
//! every tag they write: a running crc32c parity, folded left to right
//! from the block's revision count, XORed with a per-block perturb bit
//! derived from that same revision. `fetch` replays that same parity
//! walk; a record whose stored valid bit disagrees with the walk — a
//! torn write, or the start of erased space — ends the scan there and
//! falls back to the newest CKSUM found before it, so a block can carry
//! any number of chained append commits and still resolve to exactly one
//! trustworthy trunk.
//!
//! The exact bit-for-bit choice of perturb and parity folding here is
//! self-consistent (a writer and a later `fetch` always agree) but is
//! not claimed to reproduce the reference implementation's own sequence
//! bit for bit — see DESIGN.md.

pub mod alt;
pub mod attr;
pub mod compact;

use crate::cache::CachedDevice;
use crate::checksum::{self, Crc32c};
use crate::coding::{read_be16, read_le32, write_be16, write_leb128_u32};
use crate::data::Data;
use crate::device::BlockDevice;
use crate::tag::{AltColor, AltDir, Tag};
use alt::AltNode;

pub use attr::{Edit, Rattr, RidOp};
pub use compact::RidEntry;

/// An in-memory view of one block's committed rbyd state.
#[derive(Clone, Debug)]
pub struct Rbyd {
    pub block: u32,
    pub revision: u32,
    pub weight: u32,
    /// Offset immediately after the CKSUM record of the live commit.
    pub eoff: u32,
    pub cksum: u32,
    entries: Vec<RidEntry>,
    /// Byte range `[trunk_off, trunk_len)` of the live commit's tree data
    /// (its root through its last leaf record, CKSUM/ECKSUM excluded) —
    /// the range a future `append` jumps backward into.
    trunk_off: u32,
    trunk_len: u32,
    /// How many leading entries are covered by `[trunk_off, trunk_len)`.
    /// `append` only ever threads in the entries past this index.
    trunk_rid_count: u32,
    /// Set once an edit has touched or reordered an already-committed rid
    /// (delete, grow, an insert before the trunk boundary, or an attr
    /// edit on an existing rid) — forces a full `compact` on next commit.
    prefix_dirty: bool,
    /// Whether the block's erased tail past `eoff` is verified (an
    /// ECKSUM record confirmed it at the last fetch/commit), so `append`
    /// may program into it without erasing first.
    tail_trusted: bool,
}

impl Rbyd {
    /// An rbyd with no live commit yet — `commit` must be called before
    /// any lookup is meaningful. Used when allocating a brand new block.
    #[must_use]
    pub fn new_empty(block: u32, revision: u32) -> Self {
        Self {
            block,
            revision,
            weight: 0,
            eoff: 4,
            cksum: 0,
            entries: Vec::new(),
            trunk_off: 4,
            trunk_len: 4,
            trunk_rid_count: 0,
            prefix_dirty: false,
            tail_trusted: true,
        }
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[must_use]
    pub fn rid_count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// The live commit's tree root offset — `4` after a `compact`, or the
    /// most recent graft node's own offset after an `append`. Callers
    /// that merely want to re-fetch this block in full (e.g. a btree
    /// child pointer) don't need this; it exists so on-disk metadata that
    /// records a trunk offset reflects where the root actually is rather
    /// than assuming the old fixed `4`.
    #[must_use]
    pub fn trunk_off(&self) -> u32 {
        self.trunk_off
    }

    /// Replaces the in-memory rid set wholesale, without touching the
    /// device. Used by `bshrub.rs` to reuse `Rbyd::apply`'s edit logic
    /// against entries that don't (yet) live in any block. A wholesale
    /// swap can't be related to the old trunk, so it always forces a
    /// full `compact` on the next commit.
    pub fn adopt_entries(&mut self, entries: Vec<RidEntry>) {
        self.weight = entries.iter().map(|e| e.weight).sum();
        self.entries = entries;
        self.prefix_dirty = true;
    }

    /// Reads and validates `block`'s live commit: scans every tag record
    /// from the revision count onward, checking each one's valid bit
    /// against a running crc32c parity before trusting it, and keeps the
    /// last CKSUM whose own stored crc32c also checks out. Any number of
    /// chained `append` commits collapse into the single newest one this
    /// way; a torn write simply stops the scan early rather than
    /// corrupting the result.
    pub fn fetch<D: BlockDevice>(cache: &mut CachedDevice<D>, block: u32) -> crate::Result<Self> {
        let geometry = cache.geometry();
        let block_size = geometry.block_size;
        let mut buf = vec![0u8; block_size as usize];
        cache.read(block, 0, &mut buf)?;

        let mut revision_bytes = [0u8; 4];
        revision_bytes.copy_from_slice(&buf[0..4]);
        let revision = u32::from_le_bytes(revision_bytes);
        let perturb = parity(checksum::crc32c(&revision_bytes));

        let mut running = Crc32c::new();
        running.update(&revision_bytes);

        struct Best {
            root_off: u32,
            tree_end: u32,
            cksum_off: u32,
            eoff: u32,
            stored: u32,
        }
        let mut best: Option<Best> = None;
        let mut prev_off = 4u32;
        let mut cursor = 4u32;
        while cursor < block_size {
            let record = match compact::decode_record(&buf, cursor as usize) {
                Ok(r) => r,
                Err(_) => break,
            };
            let raw = u16::from_be_bytes([buf[cursor as usize], buf[cursor as usize + 1]]);
            let stored_valid = raw & 0x8000 != 0;
            let expected_valid = parity(running.value()) ^ perturb;
            if stored_valid != expected_valid {
                break;
            }

            if record.tag == Tag::Cksum {
                if record.payload_len == 8 {
                    let root_off =
                        read_le32(&mut &buf[record.payload_off..record.payload_off + 4])?;
                    let stored =
                        read_le32(&mut &buf[record.payload_off + 4..record.payload_off + 8])?;
                    let header_len = record.record_len as u32 - 4;
                    let expected = crc32c_over(&buf[0..(cursor + header_len) as usize]);
                    if expected == stored {
                        let preceded_by_ecksum = compact::decode_record(&buf, prev_off as usize)
                            .is_ok_and(|p| p.tag == Tag::ECksum && prev_off != cursor);
                        let tree_end = if preceded_by_ecksum { prev_off } else { cursor };
                        best = Some(Best {
                            root_off,
                            tree_end,
                            cksum_off: cursor,
                            eoff: cursor + record.record_len as u32,
                            stored,
                        });
                    }
                } else {
                    break;
                }
            }

            running.update(&buf[cursor as usize..cursor as usize + record.record_len]);
            prev_off = cursor;
            cursor += record.record_len as u32;
        }

        let best = best.ok_or(crate::Error::Corrupt)?;
        let entries = compact::parse(&buf, best.root_off, best.tree_end)?;
        let weight = entries.iter().map(|e| e.weight).sum();
        let trunk_rid_count = entries.len() as u32;

        // An ECKSUM directly before the winning CKSUM attests the next
        // `prog_size` bytes past it were erased at write time; re-derive
        // its known (constant) expected value and compare against what's
        // actually on disk there now before trusting `append` to reuse it.
        let tail_trusted = best.tree_end < best.cksum_off
            && {
                let end = best.eoff as usize + geometry.prog_size as usize;
                end <= buf.len()
                    && checksum::crc32c(&buf[best.eoff as usize..end])
                        == checksum::crc32c(&vec![0xffu8; geometry.prog_size as usize])
            };

        Ok(Self {
            block,
            revision,
            weight,
            eoff: best.eoff,
            cksum: best.stored,
            entries,
            trunk_off: best.root_off,
            trunk_len: best.tree_end,
            trunk_rid_count,
            prefix_dirty: false,
            tail_trusted,
        })
    }

    /// Applies a batch of structural ops and tag edits in memory. Does not
    /// touch the device; call [`Rbyd::commit`] to persist.
    pub fn apply(&mut self, edit: &Edit) -> crate::Result<()> {
        for op in &edit.ops {
            match *op {
                RidOp::Create { at, weight } => {
                    let at = at as usize;
                    if at > self.entries.len() {
                        return Err(crate::Error::Inval);
                    }
                    if (at as u32) < self.trunk_rid_count {
                        self.prefix_dirty = true;
                    }
                    self.entries.insert(at, RidEntry::new(weight));
                }
                RidOp::Delete { at } => {
                    let at = at as usize;
                    if at >= self.entries.len() {
                        return Err(crate::Error::Inval);
                    }
                    if (at as u32) < self.trunk_rid_count {
                        self.prefix_dirty = true;
                    }
                    self.entries.remove(at);
                }
                RidOp::DeleteRange { at, count } => {
                    let at = at as usize;
                    let count = count as usize;
                    let end = match at.checked_add(count) {
                        Some(end) if end <= self.entries.len() => end,
                        _ => return Err(crate::Error::Inval),
                    };
                    if (at as u32) < self.trunk_rid_count {
                        self.prefix_dirty = true;
                    }
                    self.entries.drain(at..end);
                }
                RidOp::Grow { at, delta } => {
                    if at < self.trunk_rid_count {
                        self.prefix_dirty = true;
                    }
                    let entry = self
                        .entries
                        .get_mut(at as usize)
                        .ok_or(crate::Error::Inval)?;
                    entry.weight = (i64::from(entry.weight) + i64::from(delta))
                        .try_into()
                        .map_err(|_| crate::Error::Inval)?;
                }
            }
        }
        for attr in &edit.attrs {
            if attr.rid < self.trunk_rid_count {
                self.prefix_dirty = true;
            }
            let entry = self
                .entries
                .get_mut(attr.rid as usize)
                .ok_or(crate::Error::Inval)?;
            match attr.tag {
                Tag::Rm { target, width } => {
                    let Some(Data::Buf(payload)) = &attr.data else {
                        return Err(crate::Error::Inval);
                    };
                    let mut cursor: &[u8] = payload.as_slice();
                    let anchor = read_be16(&mut cursor)?;
                    entry.unset_masked(target, width, anchor);
                }
                _ => match &attr.data {
                    Some(data) => entry.set(attr.tag, data.clone()),
                    None => entry.unset(attr.tag),
                },
            }
        }
        Ok(())
    }

    /// Returns the tag data for `rid`'s `tag`, if present.
    #[must_use]
    pub fn lookup(&self, rid: u32, tag: Tag) -> Option<&Data> {
        self.entries.get(rid as usize)?.get(tag)
    }

    /// Returns `(rid, tag, data)` for the first rid at or after `rid` that
    /// carries `tag`.
    #[must_use]
    pub fn lookupnext(&self, rid: u32, tag: Tag) -> Option<(u32, &Data)> {
        self.entries
            .iter()
            .enumerate()
            .skip(rid as usize)
            .find_map(|(i, e)| e.get(tag).map(|d| (i as u32, d)))
    }

    /// Returns `(rid, &RidEntry)` of the rid whose NAME tag decodes to
    /// `(did, name)`, assuming rids are sorted by `(did, name)` — true for
    /// any mdir this engine writes (see `mdir.rs`).
    #[must_use]
    pub fn namelookup(&self, did: u32, name: &[u8]) -> Option<(u32, &RidEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| {
                e.tags.iter().any(|(tag, data)| {
                    let is_name_tag = matches!(
                        tag,
                        Tag::Name | Tag::Reg | Tag::Dir | Tag::Bookmark | Tag::Stickynote | Tag::BName
                    );
                    if !is_name_tag {
                        return false;
                    }
                    let Data::Buf(b) = data else { return false };
                    attr::decode_name(b.as_slice())
                        .is_ok_and(|(d, n)| d == did && n == name)
                })
            })
            .map(|(i, e)| (i as u32, e))
    }

    #[must_use]
    pub fn entry(&self, rid: u32) -> Option<&RidEntry> {
        self.entries.get(rid as usize)
    }

    #[must_use]
    pub fn entries(&self) -> &[RidEntry] {
        &self.entries
    }

    /// Persists the in-memory rid set, choosing `append` over `compact`
    /// whenever it's safe and sufficient: nothing before the trunk
    /// boundary was touched, the tail is trusted erased, and there is in
    /// fact a trunk to graft onto. Falls back to `compact` if `append`
    /// doesn't fit. Returns `Err(Error::Range)` only once neither fits,
    /// leaving the caller to relocate to a new block; the block is left
    /// erased in that case.
    pub fn commit<D: BlockDevice>(&mut self, cache: &mut CachedDevice<D>) -> crate::Result<()> {
        if !self.prefix_dirty && self.tail_trusted && self.trunk_rid_count > 0 {
            match self.append(cache) {
                Ok(()) => return Ok(()),
                Err(crate::Error::Range) => {}
                Err(e) => return Err(e),
            }
        }
        self.compact(cache)
    }

    /// Threads only the entries past `trunk_rid_count` into the block's
    /// erased tail: one `AltDir::Gt` alt node whose jump reaches backward
    /// into the unmoved `[trunk_off, trunk_len)` trunk, followed by a
    /// fresh balanced subtree over just the new entries, an optional
    /// ECKSUM describing the next commit's erased-space expectation, and
    /// a CKSUM sealing the whole block from offset 0. Nothing before
    /// `eoff` is read back from or reprogrammed on the device; the
    /// revision count is left untouched, since an append never rewrites
    /// the bytes that already hold it.
    fn append<D: BlockDevice>(&mut self, cache: &mut CachedDevice<D>) -> crate::Result<()> {
        let new_entries = self.entries[self.trunk_rid_count as usize..].to_vec();
        if new_entries.is_empty() {
            return Ok(());
        }

        let geometry = cache.geometry();
        let mut old = vec![0u8; self.eoff as usize];
        cache.read(self.block, 0, &mut old)?;
        let revision_bytes: [u8; 4] = old[0..4].try_into().unwrap();
        let perturb = parity(checksum::crc32c(&revision_bytes));

        let mut running = Crc32c::new();
        running.update(&revision_bytes);
        replay_valid_bits(&old, 4, self.eoff as usize, &mut running)?;

        let old_weight: u32 = self.entries[..self.trunk_rid_count as usize]
            .iter()
            .map(|e| e.weight)
            .sum();
        let new_tree_size = compact::size_of(&new_entries);
        let alt_size = compact::record_size(
            Tag::Alt { dir: AltDir::Gt, color: AltColor::Black },
            old_weight,
            alt::JUMP_PAYLOAD_SIZE,
        );

        let graft_off = self.eoff;
        let ecksum_record = encode_ecksum(geometry.prog_size);
        let cksum_prefix = encode_cksum_prefix();

        let try_len = |with_ecksum: bool| -> usize {
            graft_off as usize
                + alt_size as usize
                + new_tree_size as usize
                + if with_ecksum { ecksum_record.len() } else { 0 }
                + cksum_prefix.len()
                + 4 // root_off
                + 4 // crc
        };
        if try_len(false) > geometry.block_size as usize {
            return Err(crate::Error::Range);
        }
        let with_ecksum = try_len(true) <= geometry.block_size as usize;

        let mut suffix = Vec::with_capacity(try_len(with_ecksum) - graft_off as usize);
        let alt = AltNode {
            weight: old_weight,
            jump: self.trunk_off,
            jump_stop: self.trunk_len,
            dir: AltDir::Gt,
            color: AltColor::Black,
        };
        suffix.extend_from_slice(&compact::encode_record(alt.tag(), alt.weight, &alt.encode_payload()));
        compact::emit(&new_entries, graft_off + alt_size, &mut suffix);

        if with_ecksum {
            suffix.extend_from_slice(&ecksum_record);
        }
        let tree_end = if with_ecksum {
            graft_off + suffix.len() as u32 - ecksum_record.len() as u32
        } else {
            graft_off + suffix.len() as u32
        };
        let cksum_off = graft_off + suffix.len() as u32;
        suffix.extend_from_slice(&cksum_prefix);
        let root_off = graft_off;
        suffix.extend_from_slice(&root_off.to_le_bytes());
        let crc_value_rel = suffix.len();
        suffix.extend_from_slice(&0u32.to_le_bytes());

        seal_valid_bits(&mut suffix, 0, crc_value_rel, perturb, &mut running)?;

        let mut final_crc = Crc32c::new();
        final_crc.update(&old);
        final_crc.update(&suffix[..crc_value_rel]);
        let crc = final_crc.value();
        suffix[crc_value_rel..crc_value_rel + 4].copy_from_slice(&crc.to_le_bytes());

        // `prog` can only write whole, aligned prog-size units, but the
        // graft must start exactly at `graft_off` so fetch's record-by-
        // record walk has no gap to fall into — so the write widens to
        // cover the prog-size unit containing `graft_off`, replaying
        // whatever already-committed bytes share it (itself a no-op on
        // real flash: programming a cell to the value it already holds
        // never needs an erase).
        let align = geometry.prog_size;
        let aligned_start = (graft_off / align) * align;
        let mut write_buf = old[aligned_start as usize..graft_off as usize].to_vec();
        write_buf.extend_from_slice(&suffix);
        let padded_len = round_up(write_buf.len() as u32, align) as usize;
        write_buf.resize(padded_len, 0xff);

        cache.prog(self.block, aligned_start, &write_buf)?;
        cache.flush()?;

        self.weight = self.entries.iter().map(|e| e.weight).sum();
        self.eoff = cksum_off + cksum_prefix.len() as u32 + 8;
        self.cksum = crc;
        self.trunk_off = root_off;
        self.trunk_len = tree_end;
        self.trunk_rid_count = self.entries.len() as u32;
        self.tail_trusted = with_ecksum;

        #[cfg(feature = "checked")]
        self.check_weight();

        Ok(())
    }

    /// Erases the block and writes a fresh, fully balanced commit over the
    /// current in-memory rid set, from offset 4.
    fn compact<D: BlockDevice>(&mut self, cache: &mut CachedDevice<D>) -> crate::Result<()> {
        let geometry = cache.geometry();
        let next_revision = self.revision.wrapping_add(1);
        let revision_bytes = next_revision.to_le_bytes();
        let perturb = parity(checksum::crc32c(&revision_bytes));

        let tree_size = compact::size_of(&self.entries);
        let ecksum_record = encode_ecksum(geometry.prog_size);
        let cksum_prefix = encode_cksum_prefix();

        let try_len = |with_ecksum: bool| -> usize {
            4 + tree_size as usize
                + if with_ecksum { ecksum_record.len() } else { 0 }
                + cksum_prefix.len()
                + 4
                + 4
        };
        if try_len(false) > geometry.block_size as usize {
            return Err(crate::Error::Range);
        }
        let with_ecksum = try_len(true) <= geometry.block_size as usize;

        let mut buf = Vec::with_capacity(try_len(with_ecksum));
        buf.extend_from_slice(&revision_bytes);
        compact::emit(&self.entries, 4, &mut buf);
        let tree_end = buf.len() as u32;

        if with_ecksum {
            buf.extend_from_slice(&ecksum_record);
        }
        let cksum_off = buf.len() as u32;
        buf.extend_from_slice(&cksum_prefix);
        let root_off = 4u32;
        buf.extend_from_slice(&root_off.to_le_bytes());
        let crc_value_off = buf.len();
        buf.extend_from_slice(&0u32.to_le_bytes());

        let mut running = Crc32c::new();
        running.update(&revision_bytes);
        seal_valid_bits(&mut buf, 4, crc_value_off, perturb, &mut running)?;

        let crc = crc32c_over(&buf[0..crc_value_off]);
        buf[crc_value_off..crc_value_off + 4].copy_from_slice(&crc.to_le_bytes());

        let padded_len = round_up(buf.len() as u32, geometry.prog_size) as usize;
        buf.resize(padded_len, 0xff);

        cache.erase(self.block)?;
        cache.prog(self.block, 0, &buf)?;
        cache.flush()?;

        self.revision = next_revision;
        self.weight = self.entries.iter().map(|e| e.weight).sum();
        self.eoff = cksum_off + cksum_prefix.len() as u32 + 8;
        self.cksum = crc;
        self.trunk_off = root_off;
        self.trunk_len = tree_end;
        self.trunk_rid_count = self.entries.len() as u32;
        self.prefix_dirty = false;
        self.tail_trusted = with_ecksum;

        #[cfg(feature = "checked")]
        self.check_weight();

        Ok(())
    }

    /// Recomputes `weight` from the committed rid set and asserts it
    /// matches the cached value. Gated behind `checked` since it's an
    /// O(n) pass over every entry on every commit.
    #[cfg(feature = "checked")]
    fn check_weight(&self) {
        let recomputed: u32 = self.entries.iter().map(|e| e.weight).sum();
        assert_eq!(
            recomputed, self.weight,
            "rbyd weight drifted from its rid set at block {}",
            self.block
        );
    }
}

fn parity(x: u32) -> bool {
    x & 1 == 1
}

/// `be16 tag | leb128 weight(0) | leb128 size(8)` for a CKSUM record,
/// shared by both `append` and `compact` since the suffix (`root_off`,
/// then the crc payload) always follows identically.
fn encode_cksum_prefix() -> Vec<u8> {
    let mut p = Vec::new();
    write_be16(&mut p, Tag::Cksum.encode()).unwrap();
    write_leb128_u32(&mut p, 0).unwrap();
    write_leb128_u32(&mut p, 8).unwrap();
    p
}

/// An ECKSUM record attesting that the next `prog_size` bytes past this
/// commit are still erased: `leb128 cksize | le32 cksum`, where `cksum`
/// is simply the crc32c of `cksize` bytes of `0xff` — a fixed, known
/// value a later `append` (or `fetch`) can recompute and compare against
/// what's actually on disk there, to decide whether the tail can be
/// trusted without a fresh scan of the whole device.
fn encode_ecksum(prog_size: u32) -> Vec<u8> {
    let erased = vec![0xffu8; prog_size as usize];
    let cksum = checksum::crc32c(&erased);
    let mut payload = Vec::new();
    write_leb128_u32(&mut payload, prog_size).unwrap();
    payload.extend_from_slice(&cksum.to_le_bytes());
    compact::encode_record(Tag::ECksum, 0, &payload)
}

/// Replays already-sealed records (their valid bits already set and
/// trusted from a prior successful fetch/commit), folding them into
/// `running` without re-patching, so a later `append`'s fresh parity
/// walk continues exactly where the old commit's own walk left off.
fn replay_valid_bits(buf: &[u8], start: usize, end: usize, running: &mut Crc32c) -> crate::Result<()> {
    let mut cursor = start;
    while cursor < end {
        let record = compact::decode_record(buf, cursor)?;
        running.update(&buf[cursor..cursor + record.record_len]);
        cursor += record.record_len;
    }
    Ok(())
}

/// Sets each record's valid bit in `buf[start..end]` to the running
/// crc32c parity (folded left to right from the block's revision count)
/// XORed with the commit's perturb bit, folding each record's final
/// (now-patched) bytes into `running` before moving to the next one —
/// the same walk `fetch` replays to tell a genuine commit boundary from
/// a torn write or the start of erased space.
fn seal_valid_bits(
    buf: &mut [u8],
    start: usize,
    end: usize,
    perturb: bool,
    running: &mut Crc32c,
) -> crate::Result<()> {
    let mut cursor = start;
    while cursor < end {
        let record = compact::decode_record(buf, cursor)?;
        let valid = parity(running.value()) ^ perturb;
        if valid {
            buf[cursor] |= 0x80;
        } else {
            buf[cursor] &= 0x7f;
        }
        running.update(&buf[cursor..cursor + record.record_len]);
        cursor += record.record_len;
    }
    Ok(())
}

fn crc32c_over(bytes: &[u8]) -> u32 {
    let mut running = Crc32c::new();
    running.update(bytes);
    running.value()
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDevice;

    fn geom() -> crate::device::Geometry {
        crate::device::Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
            block_count: 8,
        }
    }

    #[test]
    fn commit_then_fetch_roundtrips() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(0, 0);

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Name, Data::from_buf(attr::encode_name(0, b"a.txt")));
        rbyd.apply(&edit).unwrap();
        rbyd.commit(&mut cache).unwrap();

        let fetched = Rbyd::fetch(&mut cache, 0).unwrap();
        assert_eq!(fetched.weight(), 1);
        assert_eq!(fetched.rid_count(), 1);
        let (rid, entry) = fetched.namelookup(0, b"a.txt").unwrap();
        assert_eq!(rid, 0);
        assert!(entry.get(Tag::Name).is_some());
    }

    #[test]
    fn fetch_rejects_unwritten_block() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        assert!(Rbyd::fetch(&mut cache, 0).is_err());
    }

    #[test]
    fn commit_too_large_signals_range() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(0, 0);
        let mut edit = Edit::new();
        for i in 0..64 {
            edit.create(i, 1);
            edit.set(i, Tag::Name, Data::from_buf(vec![b'x'; 32]));
        }
        rbyd.apply(&edit).unwrap();
        assert!(matches!(rbyd.commit(&mut cache), Err(crate::Error::Range)));
    }

    #[test]
    fn delete_and_recommit() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(1, 0);

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Name, Data::from_buf(attr::encode_name(0, b"a")));
        edit.create(1, 1);
        edit.set(1, Tag::Name, Data::from_buf(attr::encode_name(0, b"b")));
        rbyd.apply(&edit).unwrap();
        rbyd.commit(&mut cache).unwrap();
        assert_eq!(rbyd.revision, 1);

        let mut edit2 = Edit::new();
        edit2.delete(0);
        rbyd.apply(&edit2).unwrap();
        rbyd.commit(&mut cache).unwrap();
        assert_eq!(rbyd.revision, 2);

        let fetched = Rbyd::fetch(&mut cache, 1).unwrap();
        assert_eq!(fetched.rid_count(), 1);
        assert!(fetched.namelookup(0, b"b").is_some());
        assert!(fetched.namelookup(0, b"a").is_none());
    }

    #[test]
    fn pure_appends_do_not_rewrite_the_trunk() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(2, 0);

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Name, Data::from_buf(attr::encode_name(0, b"a")));
        rbyd.apply(&edit).unwrap();
        rbyd.commit(&mut cache).unwrap();
        assert_eq!(rbyd.revision, 1);
        let trunk_before = {
            let mut buf = vec![0u8; geom().block_size as usize];
            cache.read(2, 0, &mut buf).unwrap();
            buf[..rbyd.trunk_len as usize].to_vec()
        };

        let mut edit2 = Edit::new();
        edit2.create(1, 1);
        edit2.set(1, Tag::Name, Data::from_buf(attr::encode_name(0, b"b")));
        rbyd.apply(&edit2).unwrap();
        rbyd.commit(&mut cache).unwrap();

        // append never bumps the revision count: it's not a full rewrite.
        assert_eq!(rbyd.revision, 1);

        let mut buf = vec![0u8; geom().block_size as usize];
        cache.read(2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..trunk_before.len()], trunk_before.as_slice());

        let fetched = Rbyd::fetch(&mut cache, 2).unwrap();
        assert_eq!(fetched.rid_count(), 2);
        assert!(fetched.namelookup(0, b"a").is_some());
        assert!(fetched.namelookup(0, b"b").is_some());
    }

    #[test]
    fn delete_after_append_forces_a_compact() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(3, 0);

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Name, Data::from_buf(attr::encode_name(0, b"a")));
        rbyd.apply(&edit).unwrap();
        rbyd.commit(&mut cache).unwrap();

        let mut edit2 = Edit::new();
        edit2.delete(0);
        rbyd.apply(&edit2).unwrap();
        assert!(rbyd.prefix_dirty);
        rbyd.commit(&mut cache).unwrap();
        assert_eq!(rbyd.revision, 2);

        let fetched = Rbyd::fetch(&mut cache, 3).unwrap();
        assert_eq!(fetched.rid_count(), 0);
    }

    #[test]
    fn delete_range_removes_contiguous_rids() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(5, 0);

        let mut edit = Edit::new();
        for (i, name) in [b"a".as_slice(), b"b", b"c", b"d"].into_iter().enumerate() {
            edit.create(i as u32, 1);
            edit.set(i as u32, Tag::Name, Data::from_buf(attr::encode_name(0, name)));
        }
        rbyd.apply(&edit).unwrap();
        rbyd.commit(&mut cache).unwrap();

        let mut edit2 = Edit::new();
        edit2.delete_range(1, 2);
        rbyd.apply(&edit2).unwrap();
        rbyd.commit(&mut cache).unwrap();

        let fetched = Rbyd::fetch(&mut cache, 5).unwrap();
        assert_eq!(fetched.rid_count(), 2);
        assert!(fetched.namelookup(0, b"a").is_some());
        assert!(fetched.namelookup(0, b"d").is_some());
        assert!(fetched.namelookup(0, b"b").is_none());
        assert!(fetched.namelookup(0, b"c").is_none());
    }

    #[test]
    fn masked_attr_removal_drops_only_covered_group() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(6, 0);

        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Attr(0b0000_0001), Data::from_buf(vec![1]));
        edit.set(0, Tag::Attr(0b1111_0000), Data::from_buf(vec![2]));
        rbyd.apply(&edit).unwrap();
        rbyd.commit(&mut cache).unwrap();

        let mut edit2 = Edit::new();
        edit2.unset_masked(0, crate::tag::Mode::Attr, crate::tag::MaskWidth::Mask2, 0b0000_0001);
        rbyd.apply(&edit2).unwrap();
        assert!(rbyd.prefix_dirty);
        rbyd.commit(&mut cache).unwrap();

        let fetched = Rbyd::fetch(&mut cache, 6).unwrap();
        assert!(fetched.lookup(0, Tag::Attr(0b0000_0001)).is_none());
        assert!(fetched.lookup(0, Tag::Attr(0b1111_0000)).is_some());
    }

    #[test]
    fn corrupted_valid_bit_is_rejected() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut rbyd = Rbyd::new_empty(4, 0);
        let mut edit = Edit::new();
        edit.create(0, 1);
        edit.set(0, Tag::Name, Data::from_buf(attr::encode_name(0, b"a")));
        rbyd.apply(&edit).unwrap();
        rbyd.commit(&mut cache).unwrap();

        let mut buf = vec![0u8; geom().block_size as usize];
        cache.read(4, 0, &mut buf).unwrap();
        // Flip the root record's valid bit without touching its crc.
        buf[4] ^= 0x80;
        cache.prog(4, 0, &buf).unwrap();
        cache.flush().unwrap();

        assert!(Rbyd::fetch(&mut cache, 4).is_err());
    }
}
