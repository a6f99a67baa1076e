// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-memory `BlockDevice`, grounded on `lfs3_rambd`: a flat buffer of
//! `block_size * block_count` bytes with erase left as a reset to a fixed
//! "erased" byte value rather than a true hardware erase.

use super::{BlockDevice, Geometry};

/// A block device backed entirely by RAM. Erase resets a block to
/// `erase_value` (typically `0xff`, matching how NOR/NAND flash reads
/// after erase) rather than zeroing it, so fetch's erased-tail detection
/// behaves the same as it would against real flash.
pub struct RamDevice {
    geometry: Geometry,
    erase_value: u8,
    buffer: Vec<u8>,
}

impl RamDevice {
    /// Creates a zero-length device of the given geometry, with every
    /// block already in the erased state.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self::with_erase_value(geometry, 0xff)
    }

    /// Like [`Self::new`], but with a caller-chosen erase byte value.
    #[must_use]
    pub fn with_erase_value(geometry: Geometry, erase_value: u8) -> Self {
        let size = geometry.block_size as usize * geometry.block_count as usize;
        Self {
            geometry,
            erase_value,
            buffer: vec![erase_value; size],
        }
    }

    fn offset(&self, block: u32, off: u32) -> usize {
        block as usize * self.geometry.block_size as usize + off as usize
    }
}

impl BlockDevice for RamDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> crate::Result<()> {
        if block >= self.geometry.block_count || off + buf.len() as u32 > self.geometry.block_size {
            return Err(crate::Error::Inval);
        }
        let start = self.offset(block, off);
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        Ok(())
    }

    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> crate::Result<()> {
        if block >= self.geometry.block_count || off + data.len() as u32 > self.geometry.block_size {
            return Err(crate::Error::Inval);
        }
        let start = self.offset(block, off);
        self.buffer[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, block: u32) -> crate::Result<()> {
        if block >= self.geometry.block_count {
            return Err(crate::Error::Inval);
        }
        let start = self.offset(block, 0);
        let end = start + self.geometry.block_size as usize;
        self.buffer[start..end].fill(self.erase_value);
        Ok(())
    }

    fn sync(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
            block_count: 8,
        }
    }

    #[test]
    fn starts_erased() {
        let mut dev = RamDevice::new(geom());
        let mut buf = [0u8; 16];
        dev.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 16]);
    }

    #[test]
    fn prog_then_read() {
        let mut dev = RamDevice::new(geom());
        dev.prog(2, 16, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        dev.read(2, 16, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn erase_resets_block() {
        let mut dev = RamDevice::new(geom());
        dev.prog(0, 0, &[9; 16]).unwrap();
        dev.erase(0).unwrap();
        let mut buf = [0u8; 16];
        dev.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 16]);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut dev = RamDevice::new(geom());
        assert!(dev.read(100, 0, &mut [0u8; 16]).is_err());
    }
}
