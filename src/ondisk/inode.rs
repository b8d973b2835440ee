//! On-disk inode.
//!
//! 1024 bytes: a 512-byte metadata header followed by a 512-byte area that
//! holds either up to 512 bytes of inline file data (DIRECTDATA) or the
//! embedded blockset fanning out to data and indirect blocks.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::bref::Blockref;
use crate::param::{EMBED_BYTES, SET_COUNT};

pub const OBJTYPE_UNKNOWN: u8 = 0;
pub const OBJTYPE_DIRECTORY: u8 = 1;
pub const OBJTYPE_REGFILE: u8 = 2;
pub const OBJTYPE_SOFTLINK: u8 = 3;

/// File content lives inline in the blockset area.
pub const INODE_FLAG_DIRECTDATA: u16 = 0x0001;
/// This inode roots a PFS directly under the super-root.
pub const INODE_FLAG_PFSROOT: u16 = 0x0002;

/// Inode metadata header.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct InodeMeta {
    pub version: u16,
    pub flags: u16,
    pub typ: u8,
    pub target_type: u8,
    pub comp_algo: u8,
    pub check_algo: u8,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub reserved14: u32,
    pub inum: u64,
    pub size: u64,
    pub nlinks: u64,
    pub iparent: u64,
    pub name_key: u64,
    pub name_len: u16,
    pub ncopies: u8,
    pub pfs_type: u8,
    pub pfs_nmasters: u8,
    pub reserved45: [u8; 3],
    pub ctime: u64,
    pub mtime: u64,
    pub atime: u64,
    pub btime: u64,
    pub attr_tid: u64,
    pub dirent_tid: u64,
    pub data_quota: u64,
    pub inode_quota: u64,
    pub data_count: u64,
    pub inode_count: u64,
    pub pfs_clid: [u8; 16],
    pub pfs_fsid: [u8; 16],
    pub reserved_b8: [u8; 328],
}

const_assert_eq!(core::mem::size_of::<InodeMeta>(), 512);

/// Full on-disk inode payload.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct InodeData {
    pub meta: InodeMeta,
    /// Inline data when DIRECTDATA is set, otherwise `SET_COUNT` brefs.
    pub u: [u8; EMBED_BYTES],
}

const_assert_eq!(core::mem::size_of::<InodeData>(), 1024);
const_assert_eq!(SET_COUNT * core::mem::size_of::<Blockref>(), EMBED_BYTES);

impl InodeData {
    pub fn is_direct_data(&self) -> bool {
        self.meta.flags & INODE_FLAG_DIRECTDATA != 0
    }

    pub fn is_pfs_root(&self) -> bool {
        self.meta.flags & INODE_FLAG_PFSROOT != 0
    }

    /// The embedded blockset. Must not be read while DIRECTDATA is set;
    /// the area holds file bytes then, not brefs.
    pub fn blockset(&self) -> [Blockref; SET_COUNT] {
        debug_assert!(!self.is_direct_data());
        let mut set = [Blockref::new_zeroed(); SET_COUNT];
        for (i, slot) in set.iter_mut().enumerate() {
            let base = i * core::mem::size_of::<Blockref>();
            slot.as_bytes_mut()
                .copy_from_slice(&self.u[base..base + core::mem::size_of::<Blockref>()]);
        }
        set
    }

    pub fn set_blockset_entry(&mut self, index: usize, bref: &Blockref) {
        debug_assert!(!self.is_direct_data());
        let base = index * core::mem::size_of::<Blockref>();
        self.u[base..base + core::mem::size_of::<Blockref>()].copy_from_slice(bref.as_bytes());
    }

    /// Inline file bytes, valid while DIRECTDATA is set.
    pub fn direct_data(&self) -> &[u8] {
        debug_assert!(self.is_direct_data());
        let len = (self.meta.size as usize).min(EMBED_BYTES);
        &self.u[..len]
    }

    /// Switches the inode from inline data to an empty blockset.
    pub fn clear_direct_data(&mut self) {
        self.meta.flags &= !INODE_FLAG_DIRECTDATA;
        self.u = [0; EMBED_BYTES];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::bref::BREF_TYPE_DATA;

    #[test]
    fn direct_data_window() {
        let mut ip = InodeData::new_zeroed();
        ip.meta.flags = INODE_FLAG_DIRECTDATA;
        ip.meta.size = 5;
        ip.u[..5].copy_from_slice(b"hello");
        assert_eq!(ip.direct_data(), b"hello");
        ip.meta.size = 4096;
        assert_eq!(ip.direct_data().len(), EMBED_BYTES);
    }

    #[test]
    fn blockset_roundtrip() {
        let mut ip = InodeData::new_zeroed();
        let mut bref = Blockref::new(BREF_TYPE_DATA, 0x10000, 14);
        bref.modify_tid = 9;
        ip.set_blockset_entry(2, &bref);
        let set = ip.blockset();
        assert_eq!(set[2].key, 0x10000);
        assert_eq!(set[2].modify_tid, 9);
        assert_eq!(set[0].typ, 0);
    }

    #[test]
    fn clear_direct_data_zeroes_set_area() {
        let mut ip = InodeData::new_zeroed();
        ip.meta.flags = INODE_FLAG_DIRECTDATA;
        ip.u[0] = 0xff;
        ip.clear_direct_data();
        assert!(!ip.is_direct_data());
        assert!(ip.blockset().iter().all(|b| b.typ == 0));
    }
}
