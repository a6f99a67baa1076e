// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cached block I/O (spec §4.1).
//!
//! Wraps a [`BlockDevice`] with two single-window caches: `rcache` (the
//! most recently read aligned window) and `pcache` (a pending, not yet
//! flushed, prog buffer). Every rbyd/mdir/file read and write in the
//! engine goes through a [`CachedDevice`] rather than talking to the raw
//! device directly.

use crate::checksum::crc32c;
use crate::device::{BlockDevice, Geometry};

/// A `(block, off, size, buffer)` window, shared shape for both caches.
#[derive(Clone)]
struct Window {
    block: u32,
    off: u32,
    buf: Vec<u8>,
}

impl Window {
    fn end(&self) -> u32 {
        self.off + self.buf.len() as u32
    }

    fn contains(&self, block: u32, off: u32, size: u32) -> bool {
        self.block == block && off >= self.off && off + size <= self.end()
    }

    fn overlaps(&self, block: u32, off: u32, size: u32) -> bool {
        self.block == block && off < self.end() && off + size > self.off
    }
}

/// Cached block I/O layer: coalesces writes into `pcache` and serves reads
/// from `pcache`, then `rcache`, then the device, in that order.
pub struct CachedDevice<D: BlockDevice> {
    device: D,
    geometry: Geometry,
    rcache: Option<Window>,
    pcache: Option<Window>,
    /// Re-reads every just-progged range and compares it, catching progs
    /// that silently failed to stick (spec §4.1 `ckprogs`).
    pub ckprogs: bool,
    rcache_size: u32,
}

impl<D: BlockDevice> CachedDevice<D> {
    /// Wraps `device`, sizing the read-ahead window to `rcache_size` bytes
    /// (rounded up to a multiple of `read_size`).
    pub fn new(device: D, rcache_size: u32) -> Self {
        let geometry = device.geometry();
        let rcache_size = round_up(rcache_size.max(geometry.read_size), geometry.read_size);
        Self {
            device,
            geometry,
            rcache: None,
            pcache: None,
            ckprogs: false,
            rcache_size,
        }
    }

    /// The geometry of the wrapped device.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Direct access to the wrapped device, bypassing both caches —
    /// for tests that need to arm a [`crate::device::FaultInjectingDevice`]
    /// mid-run.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Unwraps the cache, discarding any unflushed pcache contents.
    /// Callers that care about durability must `sync` first.
    pub fn into_device(self) -> D {
        self.device
    }

    /// Reads `buf.len()` bytes from `block` at `off`, consulting pcache
    /// then rcache before falling back to the device.
    pub fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> crate::Result<()> {
        let size = buf.len() as u32;
        if off % self.geometry.read_size != 0 {
            // Unaligned reads are allowed logically (rbyd records aren't
            // read_size-aligned) but must still stay within one block.
        }
        if off + size > self.geometry.block_size {
            return Err(crate::Error::Inval);
        }

        if let Some(pcache) = &self.pcache {
            if pcache.contains(block, off, size) {
                let start = (off - pcache.off) as usize;
                buf.copy_from_slice(&pcache.buf[start..start + buf.len()]);
                return Ok(());
            }
        }

        if let Some(rcache) = &self.rcache {
            if rcache.contains(block, off, size) {
                let start = (off - rcache.off) as usize;
                buf.copy_from_slice(&rcache.buf[start..start + buf.len()]);
                return Ok(());
            }
        }

        // Miss: fetch an aligned rcache-sized window containing the read,
        // so nearby subsequent reads hit cache.
        let window_off = (off / self.rcache_size) * self.rcache_size;
        let window_size = self
            .rcache_size
            .min(self.geometry.block_size - window_off);
        let mut window_buf = vec![0u8; window_size as usize];
        self.device.read(block, window_off, &mut window_buf)?;

        let start = (off - window_off) as usize;
        buf.copy_from_slice(&window_buf[start..start + buf.len()]);

        self.rcache = Some(Window {
            block,
            off: window_off,
            buf: window_buf,
        });
        Ok(())
    }

    /// Programs `data` at `(block, off)`. Forward-contiguous progs into an
    /// already-addressed pcache window are coalesced in RAM; anything else
    /// flushes the current pcache first.
    pub fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> crate::Result<()> {
        if off % self.geometry.prog_size != 0 || data.len() as u32 % self.geometry.prog_size != 0 {
            return Err(crate::Error::Inval);
        }
        if off + data.len() as u32 > self.geometry.block_size {
            return Err(crate::Error::Inval);
        }

        // Bypass the pcache entirely when the prog is already aligned and
        // at least pcache-sized: there is nothing to coalesce.
        if data.len() as u32 >= self.geometry.prog_size && self.pcache.is_none() {
            self.raw_prog(block, off, data)?;
            return Ok(());
        }

        let can_coalesce = self
            .pcache
            .as_ref()
            .is_some_and(|pcache| pcache.block == block && pcache.end() == off);

        if can_coalesce {
            if let Some(pcache) = &mut self.pcache {
                pcache.buf.extend_from_slice(data);
            }
        } else {
            self.flush()?;
            self.pcache = Some(Window {
                block,
                off,
                buf: data.to_vec(),
            });
        }

        Ok(())
    }

    fn raw_prog(&mut self, block: u32, off: u32, data: &[u8]) -> crate::Result<()> {
        self.device.prog(block, off, data)?;

        if self.ckprogs {
            let mut check = vec![0u8; data.len()];
            self.device.read(block, off, &mut check)?;
            if check != data {
                return Err(crate::Error::Corrupt);
            }
        }

        self.patch_rcache(block, off, data);
        Ok(())
    }

    fn patch_rcache(&mut self, block: u32, off: u32, data: &[u8]) {
        if let Some(rcache) = &mut self.rcache {
            if rcache.overlaps(block, off, data.len() as u32) {
                let lo = off.max(rcache.off);
                let hi = (off + data.len() as u32).min(rcache.end());
                if lo < hi {
                    let dst_start = (lo - rcache.off) as usize;
                    let src_start = (lo - off) as usize;
                    let len = (hi - lo) as usize;
                    rcache.buf[dst_start..dst_start + len]
                        .copy_from_slice(&data[src_start..src_start + len]);
                }
            }
        }
    }

    /// Flushes any pending pcache contents to the device.
    pub fn flush(&mut self) -> crate::Result<()> {
        if let Some(pcache) = self.pcache.take() {
            self.raw_prog(pcache.block, pcache.off, &pcache.buf)?;
        }
        Ok(())
    }

    /// Erases `block`, invalidating any cached windows that reference it.
    pub fn erase(&mut self, block: u32) -> crate::Result<()> {
        self.device.erase(block)?;
        if self.rcache.as_ref().is_some_and(|w| w.block == block) {
            self.rcache = None;
        }
        if self.pcache.as_ref().is_some_and(|w| w.block == block) {
            self.pcache = None;
        }
        Ok(())
    }

    /// Flushes pcache and syncs the underlying device.
    pub fn sync(&mut self) -> crate::Result<()> {
        self.flush()?;
        self.device.sync()
    }

    /// Compares `size` bytes at `(block, off)` against `expected`.
    pub fn cmp(&mut self, block: u32, off: u32, expected: &[u8]) -> crate::Result<bool> {
        let mut actual = vec![0u8; expected.len()];
        self.read(block, off, &mut actual)?;
        Ok(actual == expected)
    }

    /// Copies `size` bytes from `(src_block, src_off)` to `(dst_block,
    /// dst_off)` through pcache.
    pub fn cpy(
        &mut self,
        src_block: u32,
        src_off: u32,
        dst_block: u32,
        dst_off: u32,
        size: u32,
    ) -> crate::Result<()> {
        let mut buf = vec![0u8; size as usize];
        self.read(src_block, src_off, &mut buf)?;
        self.prog(dst_block, dst_off, &buf)
    }

    /// Fills `size` bytes at `(block, off)` with `value` through pcache.
    pub fn set(&mut self, block: u32, off: u32, size: u32, value: u8) -> crate::Result<()> {
        let buf = vec![value; size as usize];
        self.prog(block, off, &buf)
    }

    /// Computes the crc32c of `size` bytes at `(block, off)`.
    pub fn cksum(&mut self, block: u32, off: u32, size: u32) -> crate::Result<u32> {
        let mut buf = vec![0u8; size as usize];
        self.read(block, off, &mut buf)?;
        Ok(crc32c(&buf))
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDevice;

    fn geom() -> Geometry {
        Geometry {
            read_size: 16,
            prog_size: 16,
            block_size: 512,
            block_count: 8,
        }
    }

    #[test]
    fn prog_coalesces_forward_writes() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        cache.prog(0, 0, &[1; 16]).unwrap();
        cache.prog(0, 16, &[2; 16]).unwrap();
        cache.flush().unwrap();

        let mut buf = [0u8; 32];
        cache.read(0, 0, &mut buf).unwrap();
        assert_eq!(&buf[..16], &[1; 16]);
        assert_eq!(&buf[16..], &[2; 16]);
    }

    #[test]
    fn read_sees_pending_pcache() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        cache.prog(1, 0, &[9; 16]).unwrap();

        let mut buf = [0u8; 16];
        cache.read(1, 0, &mut buf).unwrap();
        assert_eq!(buf, [9; 16]);
    }

    #[test]
    fn erase_invalidates_caches() {
        let mut cache = CachedDevice::new(RamDevice::new(geom()), 64);
        cache.prog(2, 0, &[1; 16]).unwrap();
        cache.flush().unwrap();
        let mut buf = [0u8; 16];
        cache.read(2, 0, &mut buf).unwrap();

        cache.erase(2).unwrap();
        cache.read(2, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 16]);
    }

    #[test]
    fn ckprogs_catches_silent_failure() {
        struct Flaky(RamDevice);
        impl BlockDevice for Flaky {
            fn geometry(&self) -> Geometry {
                self.0.geometry()
            }
            fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> crate::Result<()> {
                self.0.read(block, off, buf)
            }
            fn prog(&mut self, _block: u32, _off: u32, _data: &[u8]) -> crate::Result<()> {
                Ok(()) // pretend to write, but don't
            }
            fn erase(&mut self, block: u32) -> crate::Result<()> {
                self.0.erase(block)
            }
            fn sync(&mut self) -> crate::Result<()> {
                self.0.sync()
            }
        }

        let mut cache = CachedDevice::new(Flaky(RamDevice::new(geom())), 64);
        cache.ckprogs = true;
        cache.prog(0, 0, &[1; 16]).unwrap();
        assert!(cache.flush().is_err());
    }
}
