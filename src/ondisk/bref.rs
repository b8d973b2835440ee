//! The 128-byte self-describing block pointer.

use core::convert::TryInto;
use core::fmt;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::{off_split, BREF_EMBED_BYTES, CHECK_BYTES};
use crate::param::ZONE_SEG;

pub const BREF_TYPE_EMPTY: u8 = 0;
pub const BREF_TYPE_INODE: u8 = 1;
pub const BREF_TYPE_INDIRECT: u8 = 2;
pub const BREF_TYPE_DATA: u8 = 3;
pub const BREF_TYPE_DIRENT: u8 = 4;
pub const BREF_TYPE_FREEMAP_NODE: u8 = 5;
pub const BREF_TYPE_FREEMAP_LEAF: u8 = 6;
pub const BREF_TYPE_FREEMAP: u8 = 254;
pub const BREF_TYPE_VOLUME: u8 = 255;

/// Blockref. The key range covered is `[key, key | ((1 << keybits) - 1)]`,
/// `data_off` carries the media byte offset in its high bits and the
/// power-of-two size radix in its low 6 bits, and `embed` is reused per
/// type (directory-entry header, recursive statistics, or freemap
/// bookkeeping). For DIRENT blocks with names of 64 bytes or less the
/// check area holds the filename itself.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, AsBytes, FromBytes)]
pub struct Blockref {
    pub typ: u8,
    /// Packed compression id (low nibble) and check-code id (high nibble).
    pub methods: u8,
    pub copyid: u8,
    pub keybits: u8,
    pub vradix: u8,
    pub flags: u8,
    pub leaf_count: u16,
    pub key: u64,
    pub mirror_tid: u64,
    pub modify_tid: u64,
    pub data_off: u64,
    pub update_tid: u64,
    pub embed: [u8; BREF_EMBED_BYTES],
    pub check: [u8; CHECK_BYTES],
}

const_assert_eq!(core::mem::size_of::<Blockref>(), 128);

impl Blockref {
    pub fn new(typ: u8, key: u64, keybits: u8) -> Blockref {
        let mut bref = Blockref::new_zeroed();
        bref.typ = typ;
        bref.key = key;
        bref.keybits = keybits;
        bref
    }

    /// First key covered.
    pub fn key_beg(&self) -> u64 {
        self.key
    }

    /// Last key covered (inclusive).
    pub fn key_end(&self) -> u64 {
        if self.keybits >= 64 {
            u64::MAX
        } else {
            self.key | ((1u64 << self.keybits) - 1)
        }
    }

    /// Whether `key` falls inside this bref's range.
    pub fn covers(&self, key: u64) -> bool {
        self.key_beg() <= key && key <= self.key_end()
    }

    /// Media byte offset, radix stripped.
    pub fn media_off(&self) -> u64 {
        off_split(self.data_off).0
    }

    /// Physical block size in bytes, 0 when unallocated.
    pub fn media_bytes(&self) -> usize {
        let (_, radix) = off_split(self.data_off);
        if radix == 0 {
            0
        } else {
            1usize << radix
        }
    }

    pub fn is_freemap_type(&self) -> bool {
        matches!(
            self.typ,
            BREF_TYPE_FREEMAP | BREF_TYPE_FREEMAP_NODE | BREF_TYPE_FREEMAP_LEAF
        )
    }

    /// Decode-time invariants. `key` must be aligned to its range, and a
    /// non-volume block with storage must point past the first reserved
    /// segment and carry a sane radix.
    pub fn validate(&self) -> bool {
        if self.keybits < 64 && self.key & ((1u64 << self.keybits) - 1) != 0 {
            return false;
        }
        let (off, radix) = off_split(self.data_off);
        if self.data_off != 0 {
            if radix < 10 || radix > 16 {
                return false;
            }
            if off == 0 {
                return false;
            }
            if !self.is_freemap_type()
                && self.typ != BREF_TYPE_VOLUME
                && off < ZONE_SEG
            {
                return false;
            }
        }
        true
    }

    pub fn embed_dirent(&self) -> DirentHead {
        DirentHead::read(&self.embed)
    }

    pub fn set_embed_dirent(&mut self, head: DirentHead) {
        head.write(&mut self.embed);
    }

    pub fn embed_stats(&self) -> StatsHead {
        StatsHead::read(&self.embed)
    }

    pub fn set_embed_stats(&mut self, head: StatsHead) {
        head.write(&mut self.embed);
    }

    pub fn embed_freemap(&self) -> FreemapHead {
        FreemapHead::read(&self.embed)
    }

    pub fn set_embed_freemap(&mut self, head: FreemapHead) {
        head.write(&mut self.embed);
    }
}

impl fmt::Debug for Blockref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blockref")
            .field("typ", &self.typ)
            .field("key", &format_args!("{:#x}", self.key))
            .field("keybits", &self.keybits)
            .field("data_off", &format_args!("{:#x}", self.data_off))
            .field("modify_tid", &self.modify_tid)
            .finish()
    }
}

/// Embedded directory-entry header: the entry itself is pure pointer, the
/// name lives in the check area or in a minimal data block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirentHead {
    pub inum: u64,
    pub namlen: u16,
    pub dtype: u8,
}

impl DirentHead {
    fn read(embed: &[u8; BREF_EMBED_BYTES]) -> DirentHead {
        DirentHead {
            inum: u64::from_le_bytes(embed[0..8].try_into().unwrap()),
            namlen: u16::from_le_bytes(embed[8..10].try_into().unwrap()),
            dtype: embed[10],
        }
    }

    fn write(self, embed: &mut [u8; BREF_EMBED_BYTES]) {
        embed[0..8].copy_from_slice(&self.inum.to_le_bytes());
        embed[8..10].copy_from_slice(&self.namlen.to_le_bytes());
        embed[10] = self.dtype;
    }
}

/// Embedded recursive statistics, propagated up at flush time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsHead {
    pub data_count: u64,
    pub inode_count: u64,
}

impl StatsHead {
    fn read(embed: &[u8; BREF_EMBED_BYTES]) -> StatsHead {
        StatsHead {
            data_count: u64::from_le_bytes(embed[0..8].try_into().unwrap()),
            inode_count: u64::from_le_bytes(embed[8..16].try_into().unwrap()),
        }
    }

    fn write(self, embed: &mut [u8; BREF_EMBED_BYTES]) {
        embed[0..8].copy_from_slice(&self.data_count.to_le_bytes());
        embed[8..16].copy_from_slice(&self.inode_count.to_le_bytes());
    }
}

/// Embedded freemap bookkeeping: bytes still available under this block
/// and the per-radix search pruning mask.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FreemapHead {
    pub avail: u64,
    pub bigmask: u32,
}

impl FreemapHead {
    fn read(embed: &[u8; BREF_EMBED_BYTES]) -> FreemapHead {
        FreemapHead {
            avail: u64::from_le_bytes(embed[0..8].try_into().unwrap()),
            bigmask: u32::from_le_bytes(embed[8..12].try_into().unwrap()),
        }
    }

    fn write(self, embed: &mut [u8; BREF_EMBED_BYTES]) {
        embed[0..8].copy_from_slice(&self.avail.to_le_bytes());
        embed[8..12].copy_from_slice(&self.bigmask.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::off_join;

    #[test]
    fn key_range() {
        let bref = Blockref::new(BREF_TYPE_DATA, 0x4000, 14);
        assert_eq!(bref.key_beg(), 0x4000);
        assert_eq!(bref.key_end(), 0x7fff);
        assert!(bref.covers(0x4000));
        assert!(bref.covers(0x7fff));
        assert!(!bref.covers(0x8000));
    }

    #[test]
    fn full_width_range() {
        let bref = Blockref::new(BREF_TYPE_INDIRECT, 0, 64);
        assert_eq!(bref.key_end(), u64::MAX);
    }

    #[test]
    fn misaligned_key_rejected() {
        let bref = Blockref::new(BREF_TYPE_DATA, 0x4001, 14);
        assert!(!bref.validate());
    }

    #[test]
    fn reserved_area_offset_rejected() {
        let mut bref = Blockref::new(BREF_TYPE_DATA, 0, 14);
        bref.data_off = off_join(0x10000, 14);
        assert!(!bref.validate());
        bref.data_off = off_join(ZONE_SEG, 14);
        assert!(bref.validate());
    }

    #[test]
    fn embed_dirent_roundtrip() {
        let mut bref = Blockref::new(BREF_TYPE_DIRENT, 0xabcd, 0);
        let head = DirentHead {
            inum: 42,
            namlen: 9,
            dtype: 1,
        };
        bref.set_embed_dirent(head);
        assert_eq!(bref.embed_dirent(), head);
    }

    #[test]
    fn embed_stats_roundtrip() {
        let mut bref = Blockref::new(BREF_TYPE_INODE, 0, 0);
        let stats = StatsHead {
            data_count: 1 << 40,
            inode_count: 77,
        };
        bref.set_embed_stats(stats);
        assert_eq!(bref.embed_stats(), stats);
    }
}
