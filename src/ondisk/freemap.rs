//! On-disk freemap blocks.
//!
//! A freemap leaf is 32768 bytes holding 128 `BmapData` entries. Each entry
//! covers 2 MiB through 8 x 32-bit words of 2-bit allocation states, one
//! state per 16 KiB block, plus a byte-granular linear sub-allocator for
//! packing requests smaller than 16 KiB.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::param::{FREEMAP_BLOCK_SIZE, FREEMAP_COUNT, FREEMAP_LEAF_BYTES, SEGSIZE};

/// 2-bit state: free.
pub const BMAP_FREE: u8 = 0;
/// 2-bit state: reserved / armored, never handed out.
pub const BMAP_ARMORED: u8 = 1;
/// 2-bit state: possibly free, pending a bulkfree reachability pass.
pub const BMAP_POSSIBLE: u8 = 2;
/// 2-bit state: allocated.
pub const BMAP_ALLOCATED: u8 = 3;

/// One 2 MiB bmap entry.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct BmapData {
    /// Byte offset of the linear sub-allocator within this 2 MiB segment.
    /// Only meaningful while not on a 16 KiB boundary.
    pub linear: u32,
    /// Allocation class owning this segment, 0 while unclaimed.
    pub class: u16,
    pub reserved06: u16,
    /// Bytes still allocatable in this segment.
    pub avail: u32,
    pub reserved0c: [u8; 212],
    /// 2-bit allocation states, 16 per word.
    pub bitmapq: [u32; 8],
}

const_assert_eq!(core::mem::size_of::<BmapData>(), 256);

impl BmapData {
    /// Number of 16 KiB blocks per entry.
    pub const BLOCKS: usize = (SEGSIZE as usize) / FREEMAP_BLOCK_SIZE;

    /// Fresh entry with every block free.
    pub fn new_free() -> BmapData {
        let mut bmap = BmapData::new_zeroed();
        bmap.avail = SEGSIZE as u32;
        bmap
    }

    /// 2-bit state of block `n` (0..128).
    pub fn state(&self, n: usize) -> u8 {
        debug_assert!(n < Self::BLOCKS);
        ((self.bitmapq[n / 16] >> ((n % 16) * 2)) & 3) as u8
    }

    /// Sets the 2-bit state of block `n`.
    pub fn set_state(&mut self, n: usize, state: u8) {
        debug_assert!(n < Self::BLOCKS);
        debug_assert!(state <= 3);
        let shift = (n % 16) * 2;
        let word = &mut self.bitmapq[n / 16];
        *word = (*word & !(3u32 << shift)) | ((state as u32) << shift);
    }

    /// True when every state word is zero (fully free).
    pub fn is_all_free(&self) -> bool {
        self.bitmapq.iter().all(|w| *w == 0)
    }
}

/// Full freemap leaf payload.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct FreemapLeafData {
    pub bmap: [BmapData; FREEMAP_COUNT],
}

const_assert_eq!(core::mem::size_of::<FreemapLeafData>(), FREEMAP_LEAF_BYTES);
