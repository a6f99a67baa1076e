// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! File layer (spec §4.7): open file content, read/write/seek/truncate,
//! and the crystallization policy that turns a dirty tail window into
//! on-disk extents.
//!
//! A file handle keeps only a bounded window of uncommitted bytes in
//! RAM — the tail of the file past whatever has already been
//! crystallized into extents — rather than buffering the whole file.
//! The window is always the tail: every byte before `window_start` is
//! already an on-disk `DATA`/`BLOCK` extent, so a write or seek that
//! lands behind the window pulls the affected extents back into the
//! window first (`pull_back`), undoing exactly as much crystallization
//! as the edit touches. This mirrors real littlefs's resumable-leaf
//! idea (a commit can keep appending into what it just wrote) without
//! this engine's append-then-compact machinery needing to know
//! anything about file content.
//!
//! Crystallization folds new tail bytes into the existing rightmost
//! `DATA` fragment first — up to `crystal_thresh` — before starting a
//! fresh fragment or `BLOCK` extent; this is the left-neighbor
//! coalescing the window design exists for, and it's enough to keep a
//! stream of small writes from leaving a trail of undersized fragments.
//! There is no matching right-neighbor coalescing: the window is
//! always the tail by construction, so there is never a fragment past
//! it to merge with, and the underlying extent index only supports
//! structural edits at its own tail once promoted to a real btree (see
//! `bshrub.rs`'s `apply_via_edit`) — a true two-sided merge would need
//! arbitrary mid-tree splicing this engine doesn't implement. See
//! DESIGN.md.
//!
//! `fruncate` (head truncation) is the one operation that can't stay
//! incremental: dropping a prefix renumbers every byte after it, which
//! this engine can only express as a full rebuild. It pulls the entire
//! remaining extent index into the window and drops the discarded
//! prefix from the front — correct, but O(surviving size) rather than
//! O(truncated amount).

use crate::alloc::Allocator;
use crate::bshrub::ShrubRoot;
use crate::cache::CachedDevice;
use crate::data::Data;
use crate::device::BlockDevice;
use crate::rbyd::{attr, Edit, RidEntry};
use crate::tag::Tag;

/// Thresholds governing inline-vs-fragment-vs-block storage and the
/// bounded tail window; mirrors the corresponding fields on
/// [`crate::config::FormatOptions`] plus two crystallization-only knobs
/// that this engine doesn't persist (see DESIGN.md).
#[derive(Clone, Copy, Debug)]
pub struct FileConfig {
    pub inline_size: u32,
    pub fragment_size: u32,
    /// Upper bound on a coalesced tail fragment's size.
    pub crystal_thresh: u32,
    /// Upper bound on the in-RAM tail window before a write proactively
    /// crystallizes the older half of it.
    pub window_cap: u32,
}

/// A file's on-disk structure, as found on (or about to be written to)
/// its owning rid.
#[derive(Clone)]
pub enum Content {
    /// Small enough to live as one `DATA` tag alongside the REG tag.
    Inline(Vec<u8>),
    /// A sequence of extents (`DATA` fragments and `BLOCK` bptrs),
    /// indexed by a bshrub that promotes to a real btree once it grows
    /// past `inline_size`.
    Chunked(ShrubRoot),
}

impl Content {
    #[must_use]
    pub fn empty() -> Self {
        Self::Inline(Vec::new())
    }

    /// The struct tag (if any — an empty inline file has none) this
    /// content should carry on its owning rid.
    #[must_use]
    pub fn struct_tag(&self) -> Option<(Tag, Data)> {
        match self {
            Self::Inline(buf) if buf.is_empty() => None,
            Self::Inline(buf) => Some((Tag::Data, Data::from_buf(buf.clone()))),
            Self::Chunked(ShrubRoot::Inline(shrub)) => {
                Some((Tag::BShrub, Data::from_buf(attr::encode_shrub(shrub.weight(), 0))))
            }
            Self::Chunked(ShrubRoot::Promoted(btree)) => {
                let rbyd = btree.root.rbyd();
                Some((
                    Tag::BTree,
                    Data::from_buf(attr::encode_branch(rbyd.weight(), rbyd.block, rbyd.trunk_off(), rbyd.cksum)),
                ))
            }
        }
    }
}

/// Open flags relevant to sync behaviour (spec §4.7 "close implicitly
/// syncs unless desync'd or read-only").
#[derive(Clone, Copy, Debug)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
}

impl OpenFlags {
    #[must_use]
    pub fn read_only() -> Self {
        Self { read: true, write: false }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self { read: true, write: true }
    }
}

/// The uncommitted tail of a chunked file: everything from
/// `window_start` to the file's current end lives in `window` rather
/// than as extents in `root`.
struct ChunkedBody {
    root: ShrubRoot,
    window_start: u64,
    window: Vec<u8>,
}

enum Body {
    Inline(Vec<u8>),
    Chunked(ChunkedBody),
}

/// An open file handle.
pub struct File {
    flags: OpenFlags,
    body: Body,
    pos: u64,
    dirty: bool,
    desynced: bool,
}

impl File {
    /// Opens a handle over already-materialized `content`. A chunked
    /// file's size is found by summing its extents' lengths, which for
    /// `BLOCK` extents is a field in the bptr itself — no block content
    /// is read just to open a file.
    pub fn open<D: BlockDevice>(
        cache: &mut CachedDevice<D>,
        content: &Content,
        flags: OpenFlags,
    ) -> crate::Result<Self> {
        let body = match content {
            Content::Inline(buf) => Body::Inline(buf.clone()),
            Content::Chunked(root) => {
                let window_start = content_len(cache, root)?;
                Body::Chunked(ChunkedBody {
                    root: root.clone(),
                    window_start,
                    window: Vec::new(),
                })
            }
        };
        Ok(Self {
            flags,
            body,
            pos: 0,
            dirty: false,
            desynced: false,
        })
    }

    #[must_use]
    pub fn create_empty(flags: OpenFlags) -> Self {
        Self {
            flags,
            body: Body::Inline(Vec::new()),
            pos: 0,
            dirty: false,
            desynced: false,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.body {
            Body::Inline(buf) => buf.len() as u64,
            Body::Chunked(chunked) => chunked.window_start + chunked.window.len() as u64,
        }
    }

    #[must_use]
    pub fn tell(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn seek(&mut self, pos: u64) -> crate::Result<u64> {
        self.pos = pos;
        Ok(self.pos)
    }

    pub fn read<D: BlockDevice>(&mut self, cache: &mut CachedDevice<D>, out: &mut [u8]) -> crate::Result<usize> {
        if !self.flags.read {
            return Err(crate::Error::Inval);
        }
        let size = self.size();
        if self.pos >= size {
            return Ok(0);
        }
        let n = (out.len() as u64).min(size - self.pos) as usize;
        match &self.body {
            Body::Inline(buf) => {
                out[..n].copy_from_slice(&buf[self.pos as usize..self.pos as usize + n]);
            }
            Body::Chunked(chunked) => {
                let want_start = self.pos;
                let want_end = self.pos + n as u64;
                if want_end <= chunked.window_start {
                    read_range(cache, &chunked.root, want_start, &mut out[..n])?;
                } else if want_start >= chunked.window_start {
                    let local = (want_start - chunked.window_start) as usize;
                    out[..n].copy_from_slice(&chunked.window[local..local + n]);
                } else {
                    let pre = (chunked.window_start - want_start) as usize;
                    read_range(cache, &chunked.root, want_start, &mut out[..pre])?;
                    out[pre..n].copy_from_slice(&chunked.window[..n - pre]);
                }
            }
        }
        self.pos += n as u64;
        Ok(n)
    }

    pub fn write<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        cfg: &FileConfig,
        data: &[u8],
        file_limit: u64,
    ) -> crate::Result<usize> {
        if !self.flags.write {
            return Err(crate::Error::Inval);
        }
        let end = self.pos + data.len() as u64;
        if end > file_limit {
            self.desynced = true;
            return Err(crate::Error::FBig);
        }

        if let Body::Inline(buf) = &self.body {
            let projected = (self.pos as usize + data.len()).max(buf.len());
            if projected as u32 > cfg.inline_size {
                let Body::Inline(old) = std::mem::replace(
                    &mut self.body,
                    Body::Chunked(ChunkedBody {
                        root: ShrubRoot::new_empty(),
                        window_start: 0,
                        window: Vec::new(),
                    }),
                ) else {
                    unreachable!()
                };
                let Body::Chunked(chunked) = &mut self.body else { unreachable!() };
                chunked.window = old;
            }
        }

        match &mut self.body {
            Body::Inline(buf) => {
                let start = self.pos as usize;
                if start + data.len() > buf.len() {
                    buf.resize(start + data.len(), 0);
                }
                buf[start..start + data.len()].copy_from_slice(data);
            }
            Body::Chunked(chunked) => {
                pull_back(cache, alloc, cfg, chunked, self.pos)?;
                let local = (self.pos - chunked.window_start) as usize;
                if local + data.len() > chunked.window.len() {
                    chunked.window.resize(local + data.len(), 0);
                }
                chunked.window[local..local + data.len()].copy_from_slice(data);
                enforce_window_cap(cache, alloc, cfg, chunked)?;
            }
        }

        self.pos += data.len() as u64;
        self.dirty = true;
        Ok(data.len())
    }

    pub fn truncate<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        cfg: &FileConfig,
        size: u64,
    ) -> crate::Result<()> {
        match &mut self.body {
            Body::Inline(buf) => {
                buf.resize(size as usize, 0);
            }
            Body::Chunked(chunked) => {
                if size < chunked.window_start {
                    pull_back(cache, alloc, cfg, chunked, size)?;
                }
                let local = (size - chunked.window_start) as usize;
                chunked.window.resize(local, 0);
                enforce_window_cap(cache, alloc, cfg, chunked)?;
            }
        }
        self.pos = self.pos.min(size);
        self.dirty = true;
        Ok(())
    }

    /// Truncates from the *head* instead of the tail (spec's `fruncate`).
    /// Unlike every other edit, this can't stay confined to a bounded
    /// window: dropping a prefix shifts every surviving byte's offset,
    /// so the whole remaining extent index has to come back into RAM
    /// once. See the module doc comment.
    pub fn fruncate<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        cfg: &FileConfig,
        size: u64,
    ) -> crate::Result<()> {
        match &mut self.body {
            Body::Inline(buf) => {
                if (size as usize) < buf.len() {
                    buf.drain(0..buf.len() - size as usize);
                }
            }
            Body::Chunked(chunked) => {
                pull_back(cache, alloc, cfg, chunked, 0)?;
                let total = chunked.window.len() as u64;
                if size < total {
                    let drop = (total - size) as usize;
                    chunked.window.drain(0..drop);
                }
            }
        }
        self.pos = self.pos.min(size);
        self.dirty = true;
        Ok(())
    }

    pub fn desync(&mut self) {
        self.desynced = true;
    }

    pub fn resync(&mut self, content: &Content) {
        self.desynced = false;
        self.dirty = false;
        if let Content::Inline(buf) = content {
            self.body = Body::Inline(buf.clone());
        }
    }

    /// Crystallizes the window into on-disk extents (or an inline
    /// blob), returning the new [`Content`]. A no-op read of
    /// `self.dirty` lets repeated syncs on an unmodified handle skip
    /// rewriting unchanged data.
    pub fn sync<D: BlockDevice>(
        &mut self,
        cache: &mut CachedDevice<D>,
        alloc: &mut Allocator,
        cfg: &FileConfig,
    ) -> crate::Result<Content> {
        if self.desynced {
            return Err(crate::Error::Corrupt);
        }
        self.dirty = false;
        match &mut self.body {
            Body::Inline(buf) => Ok(Content::Inline(buf.clone())),
            Body::Chunked(chunked) => {
                let flush_len = chunked.window.len();
                crystallize(cache, alloc, cfg, chunked, flush_len)?;
                if chunked.window_start <= u64::from(cfg.inline_size) {
                    pull_back(cache, alloc, cfg, chunked, 0)?;
                    let Body::Chunked(materialized) =
                        std::mem::replace(&mut self.body, Body::Inline(Vec::new()))
                    else {
                        unreachable!()
                    };
                    self.body = Body::Inline(materialized.window);
                    let Body::Inline(buf) = &self.body else { unreachable!() };
                    return Ok(Content::Inline(buf.clone()));
                }
                Ok(Content::Chunked(chunked.root.clone()))
            }
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// The total length of an already-synced chunked file, found by summing
/// each extent's own length field rather than reading block contents.
fn content_len<D: BlockDevice>(cache: &mut CachedDevice<D>, root: &ShrubRoot) -> crate::Result<u64> {
    let mut total = 0u64;
    for idx in 0..root.weight() {
        let entry = root.get(cache, idx)?.ok_or(crate::Error::Corrupt)?;
        total += u64::from(extent_len(&entry)?);
    }
    Ok(total)
}

fn extent_len(entry: &RidEntry) -> crate::Result<u32> {
    if let Some(Data::Buf(b)) = entry.get(Tag::Data) {
        Ok(b.len() as u32)
    } else if let Some(Data::Buf(b)) = entry.get(Tag::Block) {
        let (size, ..) = attr::decode_bptr(b.as_slice())?;
        Ok(size)
    } else {
        Err(crate::Error::Corrupt)
    }
}

/// Reads the raw bytes an extent covers, fetching its block's content
/// only if it is a `BLOCK` extent.
fn extent_bytes<D: BlockDevice>(cache: &mut CachedDevice<D>, entry: &RidEntry) -> crate::Result<Vec<u8>> {
    if let Some(Data::Buf(b)) = entry.get(Tag::Data) {
        Ok(b.as_slice().to_vec())
    } else if let Some(Data::Buf(b)) = entry.get(Tag::Block) {
        let (size, block, off, ..) = attr::decode_bptr(b.as_slice())?;
        let mut chunk = vec![0u8; size as usize];
        cache.read(block, off, &mut chunk)?;
        Ok(chunk)
    } else {
        Err(crate::Error::Corrupt)
    }
}

/// Fills `out` with the bytes of an already-crystallized range
/// `[start, start + out.len())`, touching only the extents that
/// actually overlap it rather than materializing the whole file.
fn read_range<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    root: &ShrubRoot,
    start: u64,
    out: &mut [u8],
) -> crate::Result<()> {
    let end = start + out.len() as u64;
    let mut cursor = 0u64;
    for idx in 0..root.weight() {
        if cursor >= end {
            break;
        }
        let entry = root.get(cache, idx)?.ok_or(crate::Error::Corrupt)?;
        let len = u64::from(extent_len(&entry)?);
        let extent_start = cursor;
        let extent_end = cursor + len;
        cursor = extent_end;
        if extent_end <= start || extent_start >= end {
            continue;
        }
        let local_start = start.max(extent_start) - extent_start;
        let local_end = end.min(extent_end) - extent_start;
        let n = (local_end - local_start) as usize;
        let dst = (start.max(extent_start) - start) as usize;
        if let Some(Data::Buf(b)) = entry.get(Tag::Data) {
            out[dst..dst + n].copy_from_slice(&b.as_slice()[local_start as usize..local_end as usize]);
        } else if let Some(Data::Buf(b)) = entry.get(Tag::Block) {
            let (_size, block, off, ..) = attr::decode_bptr(b.as_slice())?;
            cache.read(block, off + local_start as u32, &mut out[dst..dst + n])?;
        } else {
            return Err(crate::Error::Corrupt);
        }
    }
    Ok(())
}

/// Undoes crystallization back to `target`: pops whole extents off the
/// tail of `root` and prepends their bytes to the window until
/// `window_start <= target`. Every pop is a tail delete, which is the
/// one structural edit a promoted chunked file supports (see
/// `bshrub.rs`'s `apply_via_edit`).
fn pull_back<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    cfg: &FileConfig,
    chunked: &mut ChunkedBody,
    target: u64,
) -> crate::Result<()> {
    while chunked.window_start > target {
        let weight = chunked.root.weight();
        if weight == 0 {
            return Err(crate::Error::Corrupt);
        }
        let idx = weight - 1;
        let entry = chunked.root.get(cache, idx)?.ok_or(crate::Error::Corrupt)?;
        let bytes = extent_bytes(cache, &entry)?;

        let mut edit = Edit::new();
        edit.delete(idx);
        chunked.root.apply(cache, alloc, cfg.inline_size, &edit)?;

        chunked.window_start -= bytes.len() as u64;
        let mut merged = bytes;
        merged.extend_from_slice(&chunked.window);
        chunked.window = merged;
    }
    Ok(())
}

/// Flushes `take` bytes off the front of the window into `root`,
/// growing the existing rightmost `DATA` fragment first (up to
/// `crystal_thresh`) before chunking any remainder into fresh
/// fragments/blocks the way a brand new tail would be.
fn crystallize<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    cfg: &FileConfig,
    chunked: &mut ChunkedBody,
    take: usize,
) -> crate::Result<()> {
    let mut remaining = take.min(chunked.window.len());
    if remaining == 0 {
        return Ok(());
    }

    let weight = chunked.root.weight();
    if weight > 0 {
        let entry = chunked.root.get(cache, weight - 1)?.ok_or(crate::Error::Corrupt)?;
        if let Some(Data::Buf(existing)) = entry.get(Tag::Data) {
            let room = (cfg.crystal_thresh as usize).saturating_sub(existing.len());
            let grow = room.min(remaining);
            if grow > 0 {
                let mut merged = existing.as_slice().to_vec();
                merged.extend_from_slice(&chunked.window[..grow]);
                let mut edit = Edit::new();
                edit.set(weight - 1, Tag::Data, Data::from_buf(merged));
                chunked.root.apply(cache, alloc, cfg.inline_size, &edit)?;
                chunked.window.drain(..grow);
                chunked.window_start += grow as u64;
                remaining -= grow;
            }
        }
    }

    let block_size = cache.geometry().block_size;
    let prog_size = cache.geometry().prog_size;
    while remaining > 0 {
        let idx = chunked.root.weight();
        let mut edit = Edit::new();
        edit.create(idx, 1);
        if (remaining as u32) < cfg.fragment_size {
            let chunk = chunked.window[..remaining].to_vec();
            edit.set(idx, Tag::Data, Data::from_buf(chunk));
            chunked.root.apply(cache, alloc, cfg.inline_size, &edit)?;
            chunked.window.drain(..remaining);
            chunked.window_start += remaining as u64;
            remaining = 0;
        } else {
            let take = remaining.min(block_size as usize);
            let chunk = chunked.window[..take].to_vec();
            let block = alloc.alloc()?;
            write_block(cache, block, &chunk)?;
            let cksize = round_up(take as u32, prog_size);
            let cksum = cache.cksum(block, 0, cksize)?;
            edit.set(idx, Tag::Block, Data::from_buf(attr::encode_bptr(take as u32, block, 0, cksize, cksum)));
            chunked.root.apply(cache, alloc, cfg.inline_size, &edit)?;
            chunked.window.drain(..take);
            chunked.window_start += take as u64;
            remaining -= take;
        }
    }
    Ok(())
}

/// Proactively crystallizes the older half of an over-full window, so a
/// long run of sequential writes never holds more than `window_cap`
/// bytes in RAM at once.
fn enforce_window_cap<D: BlockDevice>(
    cache: &mut CachedDevice<D>,
    alloc: &mut Allocator,
    cfg: &FileConfig,
    chunked: &mut ChunkedBody,
) -> crate::Result<()> {
    if chunked.window.len() as u32 > cfg.window_cap {
        let excess = chunked.window.len() - cfg.window_cap as usize;
        crystallize(cache, alloc, cfg, chunked, excess)?;
    }
    Ok(())
}

fn write_block<D: BlockDevice>(cache: &mut CachedDevice<D>, block: u32, chunk: &[u8]) -> crate::Result<()> {
    let prog_size = cache.geometry().prog_size;
    let padded_len = round_up(chunk.len() as u32, prog_size) as usize;
    let mut padded = chunk.to_vec();
    padded.resize(padded_len, 0xff);
    cache.erase(block)?;
    cache.prog(block, 0, &padded)?;
    cache.flush()?;
    Ok(())
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Geometry, RamDevice};

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 64,
            block_count: 64,
        }
    }

    fn cfg() -> FileConfig {
        FileConfig {
            inline_size: 32,
            fragment_size: 8,
            crystal_thresh: 16,
            window_cap: 48,
        }
    }

    #[test]
    fn small_write_stays_inline() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut file = File::create_empty(OpenFlags::read_write());
        file.write(&mut cache, &mut alloc, &cfg(), b"hello", 1 << 20).unwrap();
        let content = file.sync(&mut cache, &mut alloc, &cfg()).unwrap();
        assert!(matches!(content, Content::Inline(ref b) if b == b"hello"));
    }

    #[test]
    fn large_write_chunks_into_blocks_and_reopens() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut file = File::create_empty(OpenFlags::read_write());
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        file.write(&mut cache, &mut alloc, &cfg(), &payload, 1 << 20).unwrap();
        let content = file.sync(&mut cache, &mut alloc, &cfg()).unwrap();
        assert!(matches!(content, Content::Chunked(_)));

        let mut reopened = File::open(&mut cache, &content, OpenFlags::read_only()).unwrap();
        let mut out = vec![0u8; payload.len()];
        let n = reopened.read(&mut cache, &mut out).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn write_past_file_limit_desyncs() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut file = File::create_empty(OpenFlags::read_write());
        assert!(matches!(file.write(&mut cache, &mut alloc, &cfg(), b"abc", 2), Err(crate::Error::FBig)));
        assert!(file.is_desynced());
    }

    #[test]
    fn fruncate_drops_from_the_head() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut file = File::create_empty(OpenFlags::read_write());
        file.write(&mut cache, &mut alloc, &cfg(), b"abcdef", 1 << 20).unwrap();
        file.fruncate(&mut cache, &mut alloc, &cfg(), 3).unwrap();
        file.rewind();
        let mut out = [0u8; 3];
        file.read(&mut cache, &mut out).unwrap();
        assert_eq!(&out, b"def");
    }

    #[test]
    fn sequential_writes_stay_under_the_window_cap_and_roundtrip() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut file = File::create_empty(OpenFlags::read_write());
        let c = cfg();
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        for chunk in payload.chunks(7) {
            file.write(&mut cache, &mut alloc, &c, chunk, 1 << 20).unwrap();
            if let Body::Chunked(chunked) = &file.body {
                assert!(chunked.window.len() as u32 <= c.window_cap);
            }
        }
        let content = file.sync(&mut cache, &mut alloc, &c).unwrap();

        let mut reopened = File::open(&mut cache, &content, OpenFlags::read_only()).unwrap();
        let mut out = vec![0u8; payload.len()];
        reopened.read(&mut cache, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn seeking_back_into_already_crystallized_data_overwrites_it() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        let mut alloc = Allocator::new(64, 32);
        let mut file = File::create_empty(OpenFlags::read_write());
        let c = cfg();
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        file.write(&mut cache, &mut alloc, &c, &payload, 1 << 20).unwrap();
        file.sync(&mut cache, &mut alloc, &c).unwrap();

        file.seek(10).unwrap();
        file.write(&mut cache, &mut alloc, &c, &[0xaa; 5], 1 << 20).unwrap();
        let content = file.sync(&mut cache, &mut alloc, &c).unwrap();

        let mut reopened = File::open(&mut cache, &content, OpenFlags::read_only()).unwrap();
        let mut out = vec![0u8; payload.len()];
        reopened.read(&mut cache, &mut out).unwrap();
        let mut expected = payload;
        expected[10..15].copy_from_slice(&[0xaa; 5]);
        assert_eq!(out, expected);
    }
}
