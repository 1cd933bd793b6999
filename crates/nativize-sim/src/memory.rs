//! Simulated native memory.
//!
//! Every block lives at its own address range; addresses are never reused,
//! so a stale pointer is always detected instead of aliasing a newer block.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, SimError};

const HEAP_BASE: u64 = 0x0010_0000;
/// Unmapped gap between consecutive blocks.
const GUARD: u64 = 0x40;

/// Who owns a native block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `Marshal.AllocHGlobal` and the string conversions built on it.
    HGlobal,
    /// Copy of a pinned managed object, alive for one top-level call.
    Pinned,
    /// Allocated by native code and never freed (library-owned data).
    Static,
    /// Argument copies made by declarative imports, freed after the call.
    Temp,
}

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    kind: BlockKind,
}

#[derive(Debug, Default)]
struct HeapState {
    blocks: BTreeMap<u64, Block>,
    freed: HashSet<u64>,
    next: u64,
    hglobal_allocs: usize,
    hglobal_frees: usize,
}

/// Allocation counters, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub live_hglobal: usize,
    pub hglobal_allocs: usize,
    pub hglobal_frees: usize,
    pub live_blocks: usize,
}

/// Process-wide native heap, shared by every session.
#[derive(Debug)]
pub struct NativeHeap {
    state: Mutex<HeapState>,
}

impl Default for NativeHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeHeap {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next: HEAP_BASE,
                ..HeapState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        // Poisoned only by a panicking test callback; no update spans one.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate `size` zeroed bytes.
    pub fn alloc(&self, size: usize, kind: BlockKind) -> u64 {
        let mut state = self.lock();
        let addr = state.next;
        let span = (size.max(1) as u64).div_ceil(16) * 16;
        state.next = addr + span + GUARD;
        state.blocks.insert(
            addr,
            Block {
                data: vec![0; size],
                kind,
            },
        );
        if kind == BlockKind::HGlobal {
            state.hglobal_allocs += 1;
        }
        addr
    }

    /// Allocate a block holding `bytes`.
    pub fn alloc_bytes(&self, bytes: &[u8], kind: BlockKind) -> u64 {
        let addr = self.alloc(bytes.len(), kind);
        let mut state = self.lock();
        if let Some(block) = state.blocks.get_mut(&addr) {
            block.data.copy_from_slice(bytes);
        }
        addr
    }

    /// Free the block starting at `addr`.
    pub fn free(&self, addr: u64) -> Result<()> {
        let mut state = self.lock();
        match state.blocks.remove(&addr) {
            Some(block) => {
                state.freed.insert(addr);
                if block.kind == BlockKind::HGlobal {
                    state.hglobal_frees += 1;
                }
                Ok(())
            }
            None if state.freed.contains(&addr) => Err(SimError::DoubleFree(addr)),
            None => Err(SimError::InvalidFree(addr)),
        }
    }

    pub fn kind_of(&self, addr: u64) -> Option<BlockKind> {
        self.lock().blocks.get(&addr).map(|b| b.kind)
    }

    /// Run `f` on the block containing `addr`, with the offset of `addr`
    /// inside it.
    fn with_block<T>(
        &self,
        addr: u64,
        f: impl FnOnce(&mut Vec<u8>, usize) -> Option<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let (&start, block) = state
            .blocks
            .range_mut(..=addr)
            .next_back()
            .ok_or(SimError::InvalidAddress(addr))?;
        let offset = (addr - start) as usize;
        if offset > block.data.len() {
            return Err(SimError::InvalidAddress(addr));
        }
        f(&mut block.data, offset).ok_or(SimError::InvalidAddress(addr))
    }

    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.with_block(addr, |data, offset| {
            data.get(offset..offset.checked_add(len)?).map(<[u8]>::to_vec)
        })
    }

    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.with_block(addr, |data, offset| {
            let end = offset.checked_add(bytes.len())?;
            data.get_mut(offset..end)?.copy_from_slice(bytes);
            Some(())
        })
    }

    /// Bytes from `addr` up to the end of its block.
    pub fn read_to_end(&self, addr: u64) -> Result<Vec<u8>> {
        self.with_block(addr, |data, offset| data.get(offset..).map(<[u8]>::to_vec))
    }

    pub fn read_i32(&self, addr: u64) -> Result<i32> {
        let bytes = self.read(addr, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_i32(&self, addr: u64, value: i32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_ptr(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_ptr(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// NUL-terminated byte string at `addr`.
    pub fn read_cstr(&self, addr: u64) -> Result<Vec<u8>> {
        let tail = self.read_to_end(addr)?;
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(SimError::InvalidAddress(addr))?;
        Ok(tail[..end].to_vec())
    }

    /// NUL-terminated UTF-16 string at `addr`.
    pub fn read_wstr(&self, addr: u64) -> Result<Vec<u16>> {
        let tail = self.read_to_end(addr)?;
        let units: Vec<u16> = tail
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let end = units
            .iter()
            .position(|u| *u == 0)
            .ok_or(SimError::InvalidAddress(addr))?;
        Ok(units[..end].to_vec())
    }

    pub fn stats(&self) -> HeapStats {
        let state = self.lock();
        HeapStats {
            live_hglobal: state
                .blocks
                .values()
                .filter(|b| b.kind == BlockKind::HGlobal)
                .count(),
            hglobal_allocs: state.hglobal_allocs,
            hglobal_frees: state.hglobal_frees,
            live_blocks: state.blocks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_read_write() {
        let heap = NativeHeap::new();
        let a = heap.alloc(8, BlockKind::HGlobal);
        heap.write_i32(a + 4, -7).unwrap();
        assert_eq!(heap.read_i32(a + 4).unwrap(), -7);
        assert_eq!(heap.read(a, 4).unwrap(), vec![0; 4]);
        assert!(matches!(heap.read(a + 6, 4), Err(SimError::InvalidAddress(_))));
        assert!(matches!(heap.read(0, 1), Err(SimError::InvalidAddress(0))));
    }

    #[test]
    fn blocks_do_not_overlap() {
        let heap = NativeHeap::new();
        let a = heap.alloc(1, BlockKind::Temp);
        let b = heap.alloc(1, BlockKind::Temp);
        assert!(b > a + 1);
        assert!(heap.write(a + 1, &[1]).is_err());
    }

    #[test]
    fn double_and_invalid_free() {
        let heap = NativeHeap::new();
        let a = heap.alloc(4, BlockKind::HGlobal);
        heap.free(a).unwrap();
        assert_eq!(heap.free(a), Err(SimError::DoubleFree(a)));
        assert_eq!(heap.free(a + 1), Err(SimError::InvalidFree(a + 1)));
    }

    #[test]
    fn strings() {
        let heap = NativeHeap::new();
        let a = heap.alloc_bytes(b"abc\0zz", BlockKind::Static);
        assert_eq!(heap.read_cstr(a).unwrap(), b"abc");
        assert_eq!(heap.read_cstr(a + 1).unwrap(), b"bc");
        let w = heap.alloc_bytes(&[0x68, 0, 0x69, 0, 0, 0], BlockKind::Static);
        assert_eq!(heap.read_wstr(w).unwrap(), vec![0x68, 0x69]);
        let unterminated = heap.alloc_bytes(b"xy", BlockKind::Static);
        assert!(heap.read_cstr(unterminated).is_err());
    }

    #[test]
    fn stats_track_hglobal_only() {
        let heap = NativeHeap::new();
        let a = heap.alloc(4, BlockKind::HGlobal);
        heap.alloc(4, BlockKind::Pinned);
        let stats = heap.stats();
        assert_eq!(stats.live_hglobal, 1);
        assert_eq!(stats.live_blocks, 2);
        heap.free(a).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.live_hglobal, 0);
        assert_eq!((stats.hglobal_allocs, stats.hglobal_frees), (1, 1));
    }
}
