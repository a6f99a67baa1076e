// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A power-loss-resilient, log-structured, copy-on-write filesystem
//! engine for small flash block devices.
//!
//! The on-disk layout is a chain of append-only tagged trees (`rbyd`,
//! [`rbyd`]), paired into two-block atomic units (`mdir`, [`mdir`]),
//! indexed by a copy-on-write btree ([`btree`]) that either lives inline
//! in its parent mdir ([`bshrub`]) or owns blocks of its own. The global
//! metadata tree ([`mtree`]) and the mroot chain it hangs off of anchor
//! the whole filesystem at the fixed block pair `{0,1}`. [`commit`] wires
//! these together into one atomic multi-level write per filesystem
//! operation, reconciling the cross-mdir [`gstate`] as it goes.
//! [`file`] crystallizes buffered writes into on-disk extents, [`path`]
//! resolves names to directory ids, and [`traversal`] walks every
//! reachable block for `usage`/`ckmeta`/`ckdata`/gc. [`fs`] is the public
//! API surface tying all of it to a [`device::BlockDevice`].
//!
//! See `DESIGN.md` in the repository root for the grounding behind each
//! module's design and the open questions it settles.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

mod alloc;
mod bshrub;
mod btree;
mod cache;
mod checksum;
mod coding;
mod commit;
mod config;
mod data;
mod device;
mod error;
mod file;
mod fs;
mod gstate;
mod mdir;
mod mtree;
mod path;
mod rbyd;
mod tag;
mod traversal;

pub use config::{CheckFlags, FormatOptions, MountOptions};
pub use device::{BlockDevice, FaultInjectingDevice, FileDevice, Geometry, RamDevice};
pub use error::{Error, Result};
pub use file::OpenFlags;
pub use fs::{DirEntry, EntryKind, FileHandle, Filesystem, Stat, Usage};

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 256,
            block_count: 64,
        }
    }

    #[test]
    fn public_surface_formats_mounts_and_writes_a_file() {
        let device = RamDevice::new(geom());
        let fs = Filesystem::format(device, &FormatOptions::new(256, 64)).unwrap();
        let device = fs.unmount().unwrap();

        let mut fs = Filesystem::mount(device, &MountOptions::new()).unwrap();
        fs.mkdir("/docs").unwrap();
        let mut handle = fs.create("/docs/readme.txt").unwrap();
        fs.write(&mut handle, b"hello").unwrap();
        fs.close(handle).unwrap();

        let mut handle = fs.open("/docs/readme.txt", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 5];
        fs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        fs.close(handle).unwrap();
    }
}
