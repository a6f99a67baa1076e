// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Public filesystem API (spec §6): `Filesystem` wires `mdir`/`mtree`/
//! `commit`/`gstate`/`path`/`file` together into format/mount/mkdir/
//! remove/rename/stat, directory listing, file open/read/write/sync/
//! close, and the fsck-style `usage`/`ckmeta`/`ckdata`/`mkconsistent`/
//! `gc`/`grow` operations.
//!
//! Name resolution here is a linear scan over every live mdir's entries,
//! not a content-keyed lookup into the mtree — this engine's mtree is
//! the same index-addressed [`crate::btree::Btree`] used for file
//! content, keyed by position rather than `(did, name)`, so there is no
//! binary search to perform. mdir growth is manual: every new entry
//! lands in the filesystem's current target mdir (the mroot anchor in
//! 2b-only mode, or the last mtree leaf once grown) until it returns
//! `NoSpc`, at which point a caller must call [`Filesystem::grow`]
//! before creating more entries. See DESIGN.md.
//!
//! A directory's own child scope is a `DID` tag living alongside its
//! `DIR` entry rather than a bookmark entry inside a directory-owned
//! mdir — this engine never gives a directory its own mdir, so there is
//! nothing for a bookmark to anchor. `create`/`mkdir` also skip the
//! stickynote two-phase create spec.md describes: both write their
//! final `REG`/`DIR` tag in one commit, so there is no pending-create
//! state for `grm` to drain on an interrupted create.

use crate::alloc::Allocator;
use crate::bshrub::ShrubRoot;
use crate::btree::{Btree, Node};
use crate::cache::CachedDevice;
use crate::commit;
use crate::config::{CheckFlags, FormatOptions, MountOptions};
use crate::data::Data;
use crate::device::BlockDevice;
use crate::file::{Content, File, FileConfig, OpenFlags};
use crate::gstate::GlobalState;
use crate::mdir::Mdir;
use crate::mtree::{MrootChain, Mtree};
use crate::path::{self, DidAllocator, ROOT_DID};
use crate::rbyd::{attr, Edit, Rbyd, RidEntry};
use crate::tag::Tag;
use crate::traversal;

/// What an entry's struct-mode tag says it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Reg,
    Dir,
}

/// One directory listing entry.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub kind: EntryKind,
}

/// Result of [`Filesystem::stat`].
#[derive(Clone, Debug)]
pub struct Stat {
    pub kind: EntryKind,
    pub size: u64,
}

/// Filesystem-wide usage, as reported by `fs_usage`.
#[derive(Clone, Copy, Debug)]
pub struct Usage {
    pub block_size: u32,
    pub block_count: u32,
    pub blocks_in_use: u32,
}

/// An open file, bound to the rid it was found (or just created) at.
pub struct FileHandle {
    mbid: u32,
    rid: u32,
    did: u32,
    name: Vec<u8>,
    file: File,
}

impl FileHandle {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    #[must_use]
    pub fn tell(&self) -> u64 {
        self.file.tell()
    }

    pub fn rewind(&mut self) {
        self.file.rewind();
    }

    pub fn seek(&mut self, pos: u64) -> crate::Result<u64> {
        self.file.seek(pos)
    }

    pub fn desync(&mut self) {
        self.file.desync();
    }

    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.file.is_desynced()
    }
}

/// A mounted, power-loss-resilient filesystem over one [`BlockDevice`].
pub struct Filesystem<D: BlockDevice> {
    cache: CachedDevice<D>,
    alloc: Allocator,
    mroot: MrootChain,
    mtree: Mtree,
    gstate: GlobalState,
    did_alloc: DidAllocator,
    name_limit: u32,
    file_limit: u32,
    file_cfg: FileConfig,
    mount: MountOptions,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Formats a brand new, empty filesystem: just the mroot anchor and
    /// its config tags.
    pub fn format(device: D, opts: &FormatOptions) -> crate::Result<Self> {
        log::info!(
            "formatting {} blocks of {} bytes",
            opts.block_count,
            opts.block_size
        );
        let mut cache = CachedDevice::new(device, opts.block_size);
        let mroot = MrootChain::format(
            &mut cache,
            opts.block_size,
            opts.block_count,
            opts.name_limit,
            opts.file_limit,
        )?;
        let mtree = Mtree::new_empty(crate::mtree::mbits_for(opts.block_size));
        let gstate = GlobalState::from_mdir_cksums(mdir_cksums(&mut cache, &mroot, &mtree)?);
        let alloc = Allocator::new(opts.block_count, opts.block_count.min(256));

        Ok(Self {
            cache,
            alloc,
            mroot,
            mtree,
            gstate,
            did_alloc: DidAllocator::new(),
            name_limit: opts.name_limit,
            file_limit: opts.file_limit,
            file_cfg: FileConfig {
                inline_size: opts.inline_size,
                fragment_size: opts.fragment_size,
                crystal_thresh: opts.fragment_size * 2,
                window_cap: opts.block_size,
            },
            mount: MountOptions::new(),
        })
    }

    /// Mounts an already-formatted device: walks the mroot chain,
    /// reconstructs the mtree and `gstate` from what's found, and arms
    /// the allocator against every block already reachable.
    pub fn mount(device: D, opts: &MountOptions) -> crate::Result<Self> {
        log::info!("mounting");
        let block_size = device.geometry().block_size;
        let mut cache = CachedDevice::new(device, block_size);
        cache.ckprogs = opts.ckprogs;

        let mroot = MrootChain::open(&mut cache)?;
        let mtree = rebuild_mtree(&mut cache, &mroot)?;

        let name_limit = decode_leb128_tag(mroot.active(), Tag::NameLimit)?.unwrap_or(255);
        let file_limit = decode_leb128_tag(mroot.active(), Tag::FileLimit)?.unwrap_or(0x7fff_ffff);
        let gstate = GlobalState::from_mdir_cksums(mdir_cksums(&mut cache, &mroot, &mtree)?);

        let geometry = cache.geometry();
        let mut alloc = Allocator::new(geometry.block_count, geometry.block_count.min(256));
        let report = traversal::traverse(&mut cache, &mroot, CheckFlags::meta())?;
        for block in &report.blocks {
            alloc.mark_used(*block);
        }

        let mut fs = Self {
            cache,
            alloc,
            mroot,
            mtree,
            gstate,
            did_alloc: DidAllocator::new(),
            name_limit,
            file_limit,
            // None of these thresholds are persisted by this engine's
            // config tags (only name/file limit are), so a mounted
            // filesystem always crystallizes under the crate defaults
            // regardless of what the formatting caller originally asked
            // for. See DESIGN.md.
            file_cfg: FileConfig {
                inline_size: 64,
                fragment_size: 1024,
                crystal_thresh: 2048,
                window_cap: block_size,
            },
            mount: opts.clone(),
        };
        fs.recompute_did_high_watermark()?;
        if opts.mkconsistent_on_mount {
            fs.mkconsistent()?;
        }
        log::debug!("mounted, name_limit={name_limit} file_limit={file_limit}");
        Ok(fs)
    }

    /// Flushes and hands back the underlying device.
    pub fn unmount(mut self) -> crate::Result<D> {
        log::info!("unmounting");
        self.cache.sync()?;
        Ok(self.cache.into_device())
    }

    fn resolve_path<'a>(&mut self, path: &'a str) -> crate::Result<(u32, Option<&'a [u8]>)> {
        let components = path::split(path);
        let cache = &mut self.cache;
        let mroot = &self.mroot;
        let mtree = &self.mtree;
        path::resolve(ROOT_DID, &components, |did, name| {
            match find_entry(cache, mroot, mtree, did, name)? {
                Some(found) if found.kind == EntryKind::Dir => Ok(found.child_did),
                Some(_) => Err(crate::Error::NotDir),
                None => Err(crate::Error::NoEnt),
            }
        })
    }

    fn lookup(&mut self, path: &str) -> crate::Result<Option<FoundEntry>> {
        let (did, leaf) = self.resolve_path(path)?;
        match leaf {
            None => Ok(None),
            Some(name) => find_entry(&mut self.cache, &self.mroot, &self.mtree, did, name),
        }
    }

    /// Resolves `path` to the did whose namespace it names: the did
    /// itself for the root or a path ending in `.`/`..`, a looked-up
    /// directory's child did otherwise.
    fn dir_did_for_path(&mut self, path: &str) -> crate::Result<u32> {
        let (did, leaf) = self.resolve_path(path)?;
        match leaf {
            None => Ok(did),
            Some(name) => {
                let found = find_entry(&mut self.cache, &self.mroot, &self.mtree, did, name)?
                    .ok_or(crate::Error::NoEnt)?;
                if found.kind != EntryKind::Dir {
                    return Err(crate::Error::NotDir);
                }
                Ok(found.child_did)
            }
        }
    }

    pub fn mkdir(&mut self, path: &str) -> crate::Result<()> {
        let (did, leaf) = self.resolve_path(path)?;
        let name = leaf.ok_or(crate::Error::Inval)?;
        if name.len() as u32 > self.name_limit {
            return Err(crate::Error::NameTooLong);
        }
        if find_entry(&mut self.cache, &self.mroot, &self.mtree, did, name)?.is_some() {
            return Err(crate::Error::Exist);
        }

        let new_did = self.did_alloc.alloc();
        let mbid = self.target_mbid();
        let rid = self.mdir_weight(mbid)?;

        let mut edit = Edit::new();
        edit.create(rid, 1);
        let (tag, data) = path::dir_tag(did, name);
        edit.set(rid, tag, data);
        edit.set(rid, Tag::Did, Data::from_buf(encode_leb128(new_did)));
        self.commit_at(mbid, &edit)
    }

    pub fn read_dir(&mut self, path: &str) -> crate::Result<Vec<DirEntry>> {
        let did = self.dir_did_for_path(path)?;
        let mut out = Vec::new();
        for_each_mdir(&mut self.cache, &self.mroot, &self.mtree, |entry| {
            let (kind, data) = if let Some(data) = entry.get(Tag::Dir) {
                (EntryKind::Dir, data)
            } else if let Some(data) = entry.get(Tag::Reg) {
                (EntryKind::Reg, data)
            } else {
                return Ok(());
            };
            let (entry_did, name) = path::decode_name_tag(data)?;
            if entry_did == did {
                out.push(DirEntry { name, kind });
            }
            Ok(())
        })?;
        Ok(out)
    }

    pub fn stat(&mut self, path: &str) -> crate::Result<Stat> {
        let (did, leaf) = self.resolve_path(path)?;
        let Some(name) = leaf else {
            return Ok(Stat { kind: EntryKind::Dir, size: 0 });
        };
        let found = find_entry(&mut self.cache, &self.mroot, &self.mtree, did, name)?
            .ok_or(crate::Error::NoEnt)?;
        match found.kind {
            EntryKind::Dir => Ok(Stat { kind: EntryKind::Dir, size: 0 }),
            EntryKind::Reg => {
                let content = decode_content(&mut self.cache, &found.mdir, found.rid)?;
                let file = File::open(&mut self.cache, &content, OpenFlags::read_only())?;
                Ok(Stat { kind: EntryKind::Reg, size: file.size() })
            }
        }
    }

    pub fn remove(&mut self, path: &str) -> crate::Result<()> {
        let (did, leaf) = self.resolve_path(path)?;
        let name = leaf.ok_or(crate::Error::Inval)?;
        let found = find_entry(&mut self.cache, &self.mroot, &self.mtree, did, name)?
            .ok_or(crate::Error::NoEnt)?;

        if found.kind == EntryKind::Dir {
            let child_did = found.child_did;
            let mut has_children = false;
            for_each_mdir(&mut self.cache, &self.mroot, &self.mtree, |entry| {
                let tagged_did = entry
                    .get(Tag::Dir)
                    .or_else(|| entry.get(Tag::Reg))
                    .map(path::decode_name_tag)
                    .transpose()?
                    .map(|(d, _)| d);
                if tagged_did == Some(child_did) {
                    has_children = true;
                }
                Ok(())
            })?;
            if has_children {
                return Err(crate::Error::NotEmpty);
            }
        }

        let mut edit = Edit::new();
        edit.delete(found.rid);
        self.commit_at(found.mbid, &edit)
    }

    /// Renames `from` to `to`: a create at the new name, then a delete of
    /// the old one, as two separate commits rather than one atomic move.
    /// A crash between the two leaves the entry reachable under both
    /// names rather than neither. See DESIGN.md.
    pub fn rename(&mut self, from: &str, to: &str) -> crate::Result<()> {
        let (from_did, from_leaf) = self.resolve_path(from)?;
        let from_name = from_leaf.ok_or(crate::Error::Inval)?;
        let found = find_entry(&mut self.cache, &self.mroot, &self.mtree, from_did, from_name)?
            .ok_or(crate::Error::NoEnt)?;

        let (to_did, to_leaf) = self.resolve_path(to)?;
        let to_name = to_leaf.ok_or(crate::Error::Inval)?;
        if to_name.len() as u32 > self.name_limit {
            return Err(crate::Error::NameTooLong);
        }
        if find_entry(&mut self.cache, &self.mroot, &self.mtree, to_did, to_name)?.is_some() {
            return Err(crate::Error::Exist);
        }

        let new_mbid = self.target_mbid();
        let new_rid = self.mdir_weight(new_mbid)?;
        let mut create_edit = Edit::new();
        create_edit.create(new_rid, 1);
        match found.kind {
            EntryKind::Dir => {
                let (tag, data) = path::dir_tag(to_did, to_name);
                create_edit.set(new_rid, tag, data);
                create_edit.set(new_rid, Tag::Did, Data::from_buf(encode_leb128(found.child_did)));
            }
            EntryKind::Reg => {
                create_edit.set(new_rid, Tag::Reg, Data::from_buf(attr::encode_name(to_did, to_name)));
                for tag in [Tag::Data, Tag::BShrub, Tag::BTree, Tag::ShrubCommit] {
                    if let Some(data) = found.entry.get(tag) {
                        create_edit.set(new_rid, tag, data.clone());
                    }
                }
            }
        }
        self.commit_at(new_mbid, &create_edit)?;

        let mut delete_edit = Edit::new();
        delete_edit.delete(found.rid);
        self.commit_at(found.mbid, &delete_edit)
    }

    pub fn create(&mut self, path: &str) -> crate::Result<FileHandle> {
        let (did, leaf) = self.resolve_path(path)?;
        let name = leaf.ok_or(crate::Error::Inval)?;
        if name.len() as u32 > self.name_limit {
            return Err(crate::Error::NameTooLong);
        }
        if find_entry(&mut self.cache, &self.mroot, &self.mtree, did, name)?.is_some() {
            return Err(crate::Error::Exist);
        }

        let mbid = self.target_mbid();
        let rid = self.mdir_weight(mbid)?;
        let mut edit = Edit::new();
        edit.create(rid, 1);
        edit.set(rid, Tag::Reg, Data::from_buf(attr::encode_name(did, name)));
        self.commit_at(mbid, &edit)?;

        Ok(FileHandle {
            mbid,
            rid,
            did,
            name: name.to_vec(),
            file: File::create_empty(OpenFlags::read_write()),
        })
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> crate::Result<FileHandle> {
        let (did, leaf) = self.resolve_path(path)?;
        let name = leaf.ok_or(crate::Error::IsDir)?;
        let found = find_entry(&mut self.cache, &self.mroot, &self.mtree, did, name)?
            .ok_or(crate::Error::NoEnt)?;
        if found.kind != EntryKind::Reg {
            return Err(crate::Error::IsDir);
        }
        let content = decode_content(&mut self.cache, &found.mdir, found.rid)?;
        let file = File::open(&mut self.cache, &content, flags)?;
        Ok(FileHandle { mbid: found.mbid, rid: found.rid, did, name: name.to_vec(), file })
    }

    pub fn read(&mut self, handle: &mut FileHandle, out: &mut [u8]) -> crate::Result<usize> {
        handle.file.read(&mut self.cache, out)
    }

    pub fn write(&mut self, handle: &mut FileHandle, data: &[u8]) -> crate::Result<usize> {
        handle
            .file
            .write(&mut self.cache, &mut self.alloc, &self.file_cfg, data, u64::from(self.file_limit))
    }

    pub fn truncate(&mut self, handle: &mut FileHandle, size: u64) -> crate::Result<()> {
        handle.file.truncate(&mut self.cache, &mut self.alloc, &self.file_cfg, size)
    }

    pub fn fruncate(&mut self, handle: &mut FileHandle, size: u64) -> crate::Result<()> {
        handle.file.fruncate(&mut self.cache, &mut self.alloc, &self.file_cfg, size)
    }

    /// Crystallizes `handle`'s buffer and commits the resulting struct
    /// tag back onto its rid.
    pub fn sync(&mut self, handle: &mut FileHandle) -> crate::Result<()> {
        if handle.file.is_desynced() {
            return Err(crate::Error::Corrupt);
        }
        if !handle.file.is_dirty() {
            return Ok(());
        }
        let content = handle.file.sync(&mut self.cache, &mut self.alloc, &self.file_cfg)?;

        let mut edit = Edit::new();
        edit.set(handle.rid, Tag::Reg, Data::from_buf(attr::encode_name(handle.did, &handle.name)));
        match content.struct_tag() {
            Some((tag, data)) => {
                edit.set(handle.rid, tag, data);
            }
            None => {
                edit.unset(handle.rid, Tag::Data);
            }
        }
        if let Content::Chunked(ShrubRoot::Inline(shrub)) = &content {
            let (tag, data) = Mdir::shrub_attr(shrub);
            edit.set(handle.rid, tag, data);
        } else {
            edit.unset(handle.rid, Tag::ShrubCommit);
        }
        if !matches!(content, Content::Chunked(ShrubRoot::Promoted(_))) {
            edit.unset(handle.rid, Tag::BTree);
        }
        if !matches!(content, Content::Chunked(ShrubRoot::Inline(_))) {
            edit.unset(handle.rid, Tag::BShrub);
        }

        self.commit_at(handle.mbid, &edit)
    }

    pub fn close(&mut self, mut handle: FileHandle) -> crate::Result<()> {
        if handle.file.is_dirty() && !handle.file.is_desynced() {
            self.sync(&mut handle)?;
        }
        Ok(())
    }

    pub fn usage(&mut self) -> crate::Result<Usage> {
        let geometry = self.cache.geometry();
        let report = traversal::traverse(&mut self.cache, &self.mroot, CheckFlags::default())?;
        Ok(Usage {
            block_size: geometry.block_size,
            block_count: geometry.block_count,
            blocks_in_use: report.blocks.len() as u32,
        })
    }

    #[must_use]
    pub fn cksum(&self) -> u32 {
        self.gstate.gcksum
    }

    /// Re-runs the meta traversal and errors if anything failed to parse
    /// or checksum. This engine has no orphan/stickynote state to drain
    /// (every create/mkdir is a single atomic commit), so this is purely
    /// a consistency check rather than a fixup pass — see DESIGN.md.
    pub fn mkconsistent(&mut self) -> crate::Result<()> {
        let report = traversal::traverse(&mut self.cache, &self.mroot, CheckFlags::meta())?;
        if report.is_clean() {
            Ok(())
        } else {
            log::error!("mkconsistent found {} unreadable meta blocks", report.meta_errors.len());
            Err(crate::Error::Corrupt)
        }
    }

    pub fn ckmeta(&mut self) -> crate::Result<()> {
        let report = traversal::traverse(&mut self.cache, &self.mroot, CheckFlags::meta())?;
        if report.meta_errors.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::Corrupt)
        }
    }

    pub fn ckdata(&mut self) -> crate::Result<()> {
        let report = traversal::traverse(&mut self.cache, &self.mroot, CheckFlags::data())?;
        if report.data_errors.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::Corrupt)
        }
    }

    /// Grows the mtree by one mdir, promoting out of 2b-only mode on the
    /// first call, so future creates have a fresh target to land in.
    pub fn grow(&mut self) -> crate::Result<()> {
        log::debug!("growing mtree, was_2b_only={}", self.mtree.is_2b_only());
        let old_cksum = self.mroot.active().cksum();
        commit::grow_mtree(&mut self.cache, &mut self.alloc, &mut self.mtree)?;
        let Some((tag, data)) = self.mtree.struct_tag() else {
            return Ok(());
        };
        let mut edit = Edit::new();
        edit.set(0, tag, data);
        self.mroot.active_mut().commit(&mut self.cache, &edit)?;
        self.gstate.note_cksum_change(old_cksum, self.mroot.active().cksum());
        self.gstate.checkpoint();
        Ok(())
    }

    /// Advances the allocator's reuse boundary to just past every block a
    /// fresh traversal still finds reachable.
    pub fn gc(&mut self) -> crate::Result<()> {
        let report = traversal::traverse(&mut self.cache, &self.mroot, CheckFlags::meta())?;
        let boundary = report.blocks.iter().copied().max().map_or(2, |m| m + 1);
        log::debug!("gc advancing reuse boundary to {boundary}");
        self.alloc.ckpoint(boundary);
        Ok(())
    }

    /// No-op: this engine tracks no bad-block list at the allocator
    /// level for `unck` to clear.
    pub fn unck(&mut self) -> crate::Result<()> {
        Ok(())
    }

    pub fn attr_get(&mut self, path: &str, id: u8) -> crate::Result<Vec<u8>> {
        let found = self.lookup(path)?.ok_or(crate::Error::NoAttr)?;
        match found.entry.get(Tag::Attr(id)) {
            Some(Data::Buf(b)) => Ok(b.as_slice().to_vec()),
            Some(_) => Err(crate::Error::Corrupt),
            None => Err(crate::Error::NoAttr),
        }
    }

    pub fn attr_set(&mut self, path: &str, id: u8, value: &[u8]) -> crate::Result<()> {
        let found = self.lookup(path)?.ok_or(crate::Error::NoEnt)?;
        let mut edit = Edit::new();
        edit.set(found.rid, Tag::Attr(id), Data::from_buf(value.to_vec()));
        self.commit_at(found.mbid, &edit)
    }

    pub fn attr_remove(&mut self, path: &str, id: u8) -> crate::Result<()> {
        let found = self.lookup(path)?.ok_or(crate::Error::NoEnt)?;
        let mut edit = Edit::new();
        edit.unset(found.rid, Tag::Attr(id));
        self.commit_at(found.mbid, &edit)
    }

    fn target_mbid(&self) -> u32 {
        if self.mtree.is_2b_only() {
            0
        } else {
            (self.mtree.leaf_count() - 1) << self.mtree.mbits
        }
    }

    fn mdir_weight(&mut self, mbid: u32) -> crate::Result<u32> {
        Ok(fetch_mdir(&mut self.cache, &self.mroot, &self.mtree, mbid)?.rid_count())
    }

    fn commit_at(&mut self, mbid: u32, edit: &Edit) -> crate::Result<()> {
        commit::commit(
            &mut self.cache,
            &mut self.alloc,
            &mut self.mroot,
            &mut self.mtree,
            &mut self.gstate,
            mbid,
            edit,
        )
    }

    fn recompute_did_high_watermark(&mut self) -> crate::Result<()> {
        let mut highest = 0u32;
        for_each_mdir(&mut self.cache, &self.mroot, &self.mtree, |entry| {
            if let Some(Data::Buf(b)) = entry.get(Tag::Did) {
                highest = highest.max(crate::coding::read_leb128_u32(&mut b.as_slice())?);
            }
            Ok(())
        })?;
        self.did_alloc = DidAllocator::from_high_watermark(highest);
        Ok(())
    }
}

#[derive(Clone)]
struct FoundEntry {
    mbid: u32,
    rid: u32,
    #[allow(dead_code)]
    did: u32,
    #[allow(dead_code)]
    name: Vec<u8>,
    kind: EntryKind,
    child_did: u32,
    entry: RidEntry,
    mdir: Mdir,
}

fn encode_leb128(value: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    crate::coding::write_leb128_u32(&mut buf, value).expect("vec write cannot fail");
    buf
}

fn decode_leb128_tag(mdir: &Mdir, tag: Tag) -> crate::Result<Option<u32>> {
    match mdir.lookup(0, tag) {
        Some(Data::Buf(b)) => Ok(Some(crate::coding::read_leb128_u32(&mut b.as_slice())?)),
        Some(_) => Err(crate::Error::Corrupt),
        None => Ok(None),
    }
}

/// Fetches the root node of a persisted btree (an mtree, or a file's
/// promoted content tree) given its struct tag's `block`, inspecting the
/// fetched rbyd's own entries to tell a leaf from a branch — this engine
/// stores no separate "is branch" flag (see `btree/mod.rs`).
fn fetch_root_node<Dev: BlockDevice>(cache: &mut CachedDevice<Dev>, block: u32) -> crate::Result<Node> {
    Ok(crate::btree::node::classify(Rbyd::fetch(cache, block)?))
}

/// Reconstructs a file's [`Content`] from its owning mdir and rid — needs
/// the mdir itself (not just a detached [`RidEntry`]) so a `BSHRUB` tag
/// can be resolved via [`Mdir::read_shrub`], which looks the shrub's tree
/// up by rid against the mdir's own rbyd.
fn decode_content<Dev: BlockDevice>(
    cache: &mut CachedDevice<Dev>,
    mdir: &Mdir,
    rid: u32,
) -> crate::Result<Content> {
    let entry = mdir.entry(rid).ok_or(crate::Error::Corrupt)?;
    if let Some(Data::Buf(b)) = entry.get(Tag::Data) {
        return Ok(Content::Inline(b.as_slice().to_vec()));
    }
    if entry.get(Tag::BShrub).is_some() {
        let shrub = mdir.read_shrub(rid)?.ok_or(crate::Error::Corrupt)?;
        return Ok(Content::Chunked(ShrubRoot::Inline(shrub)));
    }
    if let Some(Data::Buf(b)) = entry.get(Tag::BTree) {
        let (_weight, block, _trunk, _cksum) = attr::decode_branch(b.as_slice())?;
        let node = fetch_root_node(cache, block)?;
        return Ok(Content::Chunked(ShrubRoot::Promoted(Btree::from_root(node))));
    }
    Ok(Content::empty())
}

/// Scans every live mdir's entries for the one whose `DIR`/`REG` name tag
/// decodes to `(did, name)`, reusing [`Mdir::namelookup`]'s own
/// did-scoped search within each mdir in turn.
fn find_entry<Dev: BlockDevice>(
    cache: &mut CachedDevice<Dev>,
    mroot: &MrootChain,
    mtree: &Mtree,
    did: u32,
    name: &[u8],
) -> crate::Result<Option<FoundEntry>> {
    for mbid in target_mbids(mtree) {
        let mdir = fetch_mdir(cache, mroot, mtree, mbid)?;
        let Some((rid, entry)) = mdir.namelookup(did, name) else { continue };
        let kind = if entry.get(Tag::Dir).is_some() {
            EntryKind::Dir
        } else if entry.get(Tag::Reg).is_some() {
            EntryKind::Reg
        } else {
            continue;
        };
        let child_did = if kind == EntryKind::Dir {
            match entry.get(Tag::Did) {
                Some(Data::Buf(b)) => crate::coding::read_leb128_u32(&mut b.as_slice())?,
                _ => return Err(crate::Error::Corrupt),
            }
        } else {
            0
        };
        let entry = entry.clone();
        return Ok(Some(FoundEntry {
            mbid,
            rid,
            did,
            name: name.to_vec(),
            kind,
            child_did,
            entry,
            mdir,
        }));
    }
    Ok(None)
}

fn for_each_mdir<Dev: BlockDevice>(
    cache: &mut CachedDevice<Dev>,
    mroot: &MrootChain,
    mtree: &Mtree,
    mut f: impl FnMut(&RidEntry) -> crate::Result<()>,
) -> crate::Result<()> {
    for mbid in target_mbids(mtree) {
        let mdir = fetch_mdir(cache, mroot, mtree, mbid)?;
        for entry in mdir.entries() {
            f(entry)?;
        }
    }
    Ok(())
}

fn target_mbids(mtree: &Mtree) -> Vec<u32> {
    if mtree.is_2b_only() {
        vec![0]
    } else {
        (0..mtree.leaf_count()).map(|i| i << mtree.mbits).collect()
    }
}

fn fetch_mdir<Dev: BlockDevice>(
    cache: &mut CachedDevice<Dev>,
    mroot: &MrootChain,
    mtree: &Mtree,
    mbid: u32,
) -> crate::Result<Mdir> {
    if mtree.is_2b_only() {
        Ok(mroot.active().clone())
    } else {
        let blocks = mtree.lookup_blocks(cache, mbid)?;
        Mdir::fetch(cache, blocks)
    }
}

/// Reconstructs the mtree from the anchor's `MTREE` struct tag, if any.
fn rebuild_mtree<Dev: BlockDevice>(
    cache: &mut CachedDevice<Dev>,
    mroot: &MrootChain,
) -> crate::Result<Mtree> {
    let mbits = crate::mtree::mbits_for(cache.geometry().block_size);
    match mroot.active().lookup(0, Tag::MTree) {
        None => Ok(Mtree::new_empty(mbits)),
        Some(Data::Buf(b)) => {
            let (_weight, block, _trunk, _cksum) = attr::decode_branch(b.as_slice())?;
            let node = fetch_root_node(cache, block)?;
            Ok(Mtree::from_btree(mbits, Btree::from_root(node)))
        }
        Some(_) => Err(crate::Error::Corrupt),
    }
}

fn mdir_cksums<Dev: BlockDevice>(
    cache: &mut CachedDevice<Dev>,
    mroot: &MrootChain,
    mtree: &Mtree,
) -> crate::Result<Vec<u32>> {
    let mut cksums: Vec<u32> = mroot.mdirs().iter().map(Mdir::cksum).collect();
    if !mtree.is_2b_only() {
        for i in 0..mtree.leaf_count() {
            let blocks = mtree.lookup_blocks(cache, i << mtree.mbits)?;
            cksums.push(Mdir::fetch(cache, blocks)?.cksum());
        }
    }
    Ok(cksums)
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
            block_count: 64,
        }
    }

    fn format_opts() -> FormatOptions {
        FormatOptions::new(256, 64).inline_size(16).fragment_size(8)
    }

    #[test]
    fn format_then_mount_sees_only_the_root() {
        let fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
        let device = fs.unmount().unwrap();

        let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();
        assert!(fs.read_dir("/").unwrap().is_empty());
        assert_eq!(fs.usage().unwrap().blocks_in_use, 2);
    }

    #[test]
    fn mkdir_stat_and_list_round_trip() {
        let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
        fs.mkdir("/sub").unwrap();

        let stat = fs.stat("/sub").unwrap();
        assert_eq!(stat.kind, EntryKind::Dir);

        let entries = fs.read_dir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"sub");
        assert_eq!(entries[0].kind, EntryKind::Dir);

        assert!(fs.read_dir("/sub").unwrap().is_empty());
    }

    #[test]
    fn create_write_sync_close_reopen_read_round_trips() {
        let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
        let mut handle = fs.create("/hello.txt").unwrap();
        fs.write(&mut handle, b"hello world").unwrap();
        fs.sync(&mut handle).unwrap();
        fs.close(handle).unwrap();

        let mut handle = fs.open("/hello.txt", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 11];
        let n = fs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
        fs.close(handle).unwrap();
    }

    #[test]
    fn remove_nonempty_dir_fails() {
        let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
        fs.mkdir("/sub").unwrap();
        let mut handle = fs.create("/sub/file").unwrap();
        fs.write(&mut handle, b"x").unwrap();
        fs.close(handle).unwrap();

        assert!(matches!(fs.remove("/sub"), Err(crate::Error::NotEmpty)));
        fs.remove("/sub/file").unwrap();
        fs.remove("/sub").unwrap();
    }

    #[test]
    fn rename_moves_a_file_to_a_new_name() {
        let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
        let mut handle = fs.create("/a.txt").unwrap();
        fs.write(&mut handle, b"data").unwrap();
        fs.close(handle).unwrap();

        fs.rename("/a.txt", "/b.txt").unwrap();
        assert!(matches!(fs.stat("/a.txt"), Err(crate::Error::NoEnt)));
        assert_eq!(fs.stat("/b.txt").unwrap().size, 4);
    }

    #[test]
    fn custom_attribute_round_trips() {
        let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
        let handle = fs.create("/a.txt").unwrap();
        fs.close(handle).unwrap();

        fs.attr_set("/a.txt", 5, b"meta").unwrap();
        assert_eq!(fs.attr_get("/a.txt", 5).unwrap(), b"meta");
        fs.attr_remove("/a.txt", 5).unwrap();
        assert!(matches!(fs.attr_get("/a.txt", 5), Err(crate::Error::NoAttr)));
    }

    #[test]
    fn ckmeta_and_ckdata_pass_on_a_fresh_filesystem() {
        let mut fs = Filesystem::format(RamDevice::new(geom()), &format_opts()).unwrap();
        let mut handle = fs.create("/big.bin").unwrap();
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        fs.write(&mut handle, &payload).unwrap();
        fs.close(handle).unwrap();

        fs.ckmeta().unwrap();
        fs.ckdata().unwrap();
        fs.mkconsistent().unwrap();
    }
}
