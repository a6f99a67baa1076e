// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! File-backed `BlockDevice`, grounded on `lfs3_filebd`: the same flat
//! addressing as [`super::RamDevice`] but persisted to a regular file so a
//! mounted filesystem image survives process restarts. Used by the
//! power-loss test suite to re-mount after simulating a crash mid-write.

use super::{BlockDevice, Geometry};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A block device backed by a single regular file, pre-sized to
/// `block_size * block_count` bytes.
pub struct FileDevice {
    geometry: Geometry,
    file: File,
}

impl FileDevice {
    /// Opens (creating if necessary) `path` as a block device of the given
    /// geometry, erasing every block on first creation.
    pub fn open(path: &Path, geometry: Geometry) -> crate::Result<Self> {
        let is_new = !path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut dev = Self { geometry, file };

        if is_new {
            let size = u64::from(geometry.block_size) * u64::from(geometry.block_count);
            dev.file.set_len(size)?;
            for block in 0..geometry.block_count {
                dev.erase(block)?;
            }
        }

        Ok(dev)
    }

    fn seek_to(&mut self, block: u32, off: u32) -> crate::Result<()> {
        if block >= self.geometry.block_count || off > self.geometry.block_size {
            return Err(crate::Error::Inval);
        }
        let pos = u64::from(block) * u64::from(self.geometry.block_size) + u64::from(off);
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> crate::Result<()> {
        if off + buf.len() as u32 > self.geometry.block_size {
            return Err(crate::Error::Inval);
        }
        self.seek_to(block, off)?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> crate::Result<()> {
        if off + data.len() as u32 > self.geometry.block_size {
            return Err(crate::Error::Inval);
        }
        self.seek_to(block, off)?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn erase(&mut self, block: u32) -> crate::Result<()> {
        self.seek_to(block, 0)?;
        let filler = vec![0xffu8; self.geometry.block_size as usize];
        self.file.write_all(&filler)?;
        Ok(())
    }

    fn sync(&mut self) -> crate::Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
            block_count: 8,
        }
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        {
            let mut dev = FileDevice::open(&path, geom()).unwrap();
            dev.prog(3, 0, &[7; 16]).unwrap();
            dev.sync().unwrap();
        }

        let mut dev = FileDevice::open(&path, geom()).unwrap();
        let mut buf = [0u8; 16];
        dev.read(3, 0, &mut buf).unwrap();
        assert_eq!(buf, [7; 16]);
    }
}
