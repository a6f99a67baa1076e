// Copyright (c) 2026-present, flashfs contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block allocator (spec §4.8): a lookahead bitmap over a sliding window
//! of the device's block space, plus a graft side-table of blocks
//! allocated earlier in the same in-flight commit but not yet visible to
//! a fresh mtree/mdir scan.

use rustc_hash::FxHashSet;

/// Tracks free/used blocks over a sliding window, and blocks "grafted"
/// (provisionally claimed) mid-commit.
pub struct Allocator {
    block_count: u32,
    window_size: u32,
    window_off: u32,
    /// `true` = used, indexed relative to `window_off`.
    bitmap: Vec<bool>,
    /// Blocks allocated earlier in the current commit that a traversal
    /// scan (which only sees committed state) wouldn't yet know are used.
    grafts: FxHashSet<u32>,
    /// The lowest block index known to be fully reusable after the last
    /// full mtree scan (spec's "ckpoint" boundary).
    ckpoint: u32,
    next: u32,
}

impl Allocator {
    #[must_use]
    pub fn new(block_count: u32, window_size: u32) -> Self {
        let window_size = window_size.min(block_count).max(1);
        Self {
            block_count,
            window_size,
            window_off: 0,
            bitmap: vec![false; window_size as usize],
            grafts: FxHashSet::default(),
            ckpoint: 0,
            next: 2, // blocks 0 and 1 are permanently reserved for the mroot anchor
        }
    }

    /// Marks `block` used if it falls within the current lookahead window.
    pub fn mark_used(&mut self, block: u32) {
        if block >= self.window_off && block < self.window_off + self.window_size {
            self.bitmap[(block - self.window_off) as usize] = true;
        }
    }

    /// Provisionally reserves `block` for the in-flight commit.
    pub fn graft(&mut self, block: u32) {
        self.grafts.insert(block);
        self.mark_used(block);
    }

    /// Releases a graft once the commit that claimed it has either landed
    /// (the block is now reachable and will show up in future scans) or
    /// been abandoned.
    pub fn ungraft(&mut self, block: u32) {
        self.grafts.remove(&block);
    }

    /// Slides the lookahead window to start at `off`, clearing the bitmap
    /// and re-applying any still-active grafts that fall inside it.
    pub fn reset_window(&mut self, off: u32) {
        self.window_off = off % self.block_count.max(1);
        self.bitmap = vec![false; self.window_size as usize];
        let grafts: Vec<u32> = self.grafts.iter().copied().collect();
        for block in grafts {
            self.mark_used(block);
        }
    }

    /// Records the boundary up to which the last full scan is known
    /// accurate; blocks below it may be assumed free unless grafted.
    pub fn ckpoint(&mut self, boundary: u32) {
        self.ckpoint = boundary;
    }

    #[must_use]
    pub fn ckpoint_boundary(&self) -> u32 {
        self.ckpoint
    }

    /// Finds and reserves the next free block, reserved blocks 0/1
    /// excluded, advancing and re-filling the lookahead window as needed.
    /// Returns `Error::NoSpc` once a full lap of the device finds nothing.
    pub fn alloc(&mut self) -> crate::Result<u32> {
        let start = self.next;
        let mut scanned = 0u32;
        loop {
            if scanned >= self.block_count {
                return Err(crate::Error::NoSpc);
            }
            let block = (start + scanned) % self.block_count;
            scanned += 1;
            if block < 2 {
                continue;
            }
            if block >= self.window_off && block < self.window_off + self.window_size {
                let idx = (block - self.window_off) as usize;
                if !self.bitmap[idx] {
                    self.bitmap[idx] = true;
                    self.grafts.insert(block);
                    self.next = block + 1;
                    return Ok(block);
                }
            } else {
                // Outside the window: treat as free only if below the
                // known-accurate ckpoint boundary and ungrafted, otherwise
                // slide the window there to get an authoritative answer.
                if block < self.ckpoint && !self.grafts.contains(&block) {
                    self.grafts.insert(block);
                    self.next = block + 1;
                    return Ok(block);
                }
                self.reset_window(block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_reserved_and_used_blocks() {
        let mut alloc = Allocator::new(16, 8);
        alloc.mark_used(2);
        alloc.mark_used(3);
        let a = alloc.alloc().unwrap();
        assert_eq!(a, 4);
    }

    #[test]
    fn grafts_are_not_reused() {
        let mut alloc = Allocator::new(16, 8);
        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn exhausted_device_errors() {
        let mut alloc = Allocator::new(4, 4);
        // only blocks 2,3 are allocatable
        assert!(alloc.alloc().is_ok());
        assert!(alloc.alloc().is_ok());
        assert!(matches!(alloc.alloc(), Err(crate::Error::NoSpc)));
    }
}
