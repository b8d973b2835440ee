//! Block-table maintenance.
//!
//! A parent's block table lives in one of three places: the volume
//! header's root blocksets (volume/freemap roots), the embedded blockset
//! area of an inode, or the body of an indirect/freemap-node block. These
//! helpers give flush and the chain operations one uniform view.
//!
//! Callers must hold the parent exclusively and have COW'd it (`modify`)
//! before any mutation; the helpers only move bytes.

use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use super::{Chain, ChainData, ChainFlags};
use crate::error::{ErrorSet, Result};
use crate::lock::RwSleepWriteGuard;
use crate::ondisk::{
    off_split, Blockref, InodeData, BREF_TYPE_EMPTY, BREF_TYPE_FREEMAP, BREF_TYPE_FREEMAP_NODE,
    BREF_TYPE_INDIRECT, BREF_TYPE_INODE, BREF_TYPE_VOLUME,
};

const BREF_BYTES: usize = core::mem::size_of::<Blockref>();

/// Number of blockref slots `parent` can hold. Zero for leaf types and
/// for inodes carrying inline data.
pub fn table_capacity(parent: &Chain, data: &ChainData) -> usize {
    match parent.typ {
        BREF_TYPE_VOLUME | BREF_TYPE_FREEMAP => 4,
        BREF_TYPE_INODE => {
            let inode = read_inode(parent, data);
            match inode {
                Ok(ip) if ip.is_direct_data() => 0,
                _ => crate::param::SET_COUNT,
            }
        }
        BREF_TYPE_INDIRECT | BREF_TYPE_FREEMAP_NODE => data.bref.media_bytes() / BREF_BYTES,
        _ => 0,
    }
}

/// Decodes the parent's inode payload.
pub fn read_inode(parent: &Chain, data: &ChainData) -> Result<InodeData> {
    debug_assert_eq!(parent.typ, BREF_TYPE_INODE);
    let mut ip = InodeData::new_zeroed();
    if let Some(dio) = &data.dio {
        let (off, _) = off_split(data.bref.data_off);
        dio.with_data(off, core::mem::size_of::<InodeData>(), |bytes| {
            ip.as_bytes_mut().copy_from_slice(bytes)
        });
    }
    Ok(ip)
}

/// Writes the parent's inode payload back.
pub fn write_inode(
    parent: &Arc<Chain>,
    data: &mut RwSleepWriteGuard<'_, ChainData>,
    ip: &InodeData,
) -> Result<()> {
    debug_assert_eq!(parent.typ, BREF_TYPE_INODE);
    parent.resolve_data_locked(data)?;
    let (off, _) = off_split(data.bref.data_off);
    match &data.dio {
        Some(dio) => {
            dio.write_at(off, ip.as_bytes());
            parent.clear_flags(ChainFlags::INITIAL);
            Ok(())
        }
        None => Err(ErrorSet::EINVAL),
    }
}

/// Reads the full block table of `parent` into memory.
pub fn read_table(parent: &Arc<Chain>, data: &mut RwSleepWriteGuard<'_, ChainData>) -> Result<Vec<Blockref>> {
    match parent.typ {
        BREF_TYPE_VOLUME | BREF_TYPE_FREEMAP => match &data.embedded_set {
            Some(set) => Ok(set.to_vec()),
            None => Ok(vec![Blockref::new_zeroed(); 4]),
        },
        BREF_TYPE_INODE => {
            parent.resolve_data_locked(data)?;
            let ip = read_inode(parent, data)?;
            if ip.is_direct_data() {
                Ok(Vec::new())
            } else {
                Ok(ip.blockset().to_vec())
            }
        }
        BREF_TYPE_INDIRECT | BREF_TYPE_FREEMAP_NODE => {
            parent.resolve_data_locked(data)?;
            let bytes = data.bref.media_bytes();
            let count = bytes / BREF_BYTES;
            let mut table = vec![Blockref::new_zeroed(); count];
            if let Some(dio) = &data.dio {
                let (off, _) = off_split(data.bref.data_off);
                dio.with_data(off, bytes, |raw| {
                    for (i, slot) in table.iter_mut().enumerate() {
                        slot.as_bytes_mut()
                            .copy_from_slice(&raw[i * BREF_BYTES..(i + 1) * BREF_BYTES]);
                    }
                });
            }
            Ok(table)
        }
        _ => Err(ErrorSet::ENOTDIR),
    }
}

/// Writes one table slot back to the parent's storage.
pub fn write_table_entry(
    parent: &Arc<Chain>,
    data: &mut RwSleepWriteGuard<'_, ChainData>,
    index: usize,
    bref: &Blockref,
) -> Result<()> {
    match parent.typ {
        BREF_TYPE_VOLUME | BREF_TYPE_FREEMAP => {
            let set = data
                .embedded_set
                .get_or_insert_with(|| Box::new([Blockref::new_zeroed(); 4]));
            set[index] = *bref;
            Ok(())
        }
        BREF_TYPE_INODE => {
            parent.resolve_data_locked(data)?;
            let mut ip = read_inode(parent, data)?;
            if ip.is_direct_data() {
                return Err(ErrorSet::EINVAL);
            }
            ip.set_blockset_entry(index, bref);
            write_inode(parent, data, &ip)
        }
        BREF_TYPE_INDIRECT | BREF_TYPE_FREEMAP_NODE => {
            parent.resolve_data_locked(data)?;
            let (off, _) = off_split(data.bref.data_off);
            match &data.dio {
                Some(dio) => {
                    dio.write_at(off + (index * BREF_BYTES) as u64, bref.as_bytes());
                    parent.clear_flags(ChainFlags::INITIAL);
                    Ok(())
                }
                None => Err(ErrorSet::EINVAL),
            }
        }
        _ => Err(ErrorSet::ENOTDIR),
    }
}

/// Replaces the entire table.
pub fn write_table(
    parent: &Arc<Chain>,
    data: &mut RwSleepWriteGuard<'_, ChainData>,
    table: &[Blockref],
) -> Result<()> {
    for (i, bref) in table.iter().enumerate() {
        write_table_entry(parent, data, i, bref)?;
    }
    Ok(())
}

/// Inserts `bref` into the first empty slot. `ENOSPC` means the caller
/// must split the parent with an indirect block first; `EEXIST` reports a
/// live entry whose range overlaps the newcomer.
pub fn base_insert(
    parent: &Arc<Chain>,
    data: &mut RwSleepWriteGuard<'_, ChainData>,
    bref: &Blockref,
) -> Result<usize> {
    let table = read_table(parent, data)?;
    let mut slot = None;
    for (i, entry) in table.iter().enumerate() {
        if entry.typ == BREF_TYPE_EMPTY {
            if slot.is_none() {
                slot = Some(i);
            }
            continue;
        }
        if entry.key_beg() <= bref.key_end() && entry.key_end() >= bref.key_beg() {
            return Err(ErrorSet::EEXIST);
        }
    }
    match slot {
        Some(i) => {
            write_table_entry(parent, data, i, bref)?;
            Ok(i)
        }
        None => Err(ErrorSet::ENOSPC),
    }
}

/// Removes the entry matching `key`/`typ`, returning it.
pub fn base_delete(
    parent: &Arc<Chain>,
    data: &mut RwSleepWriteGuard<'_, ChainData>,
    key: u64,
    typ: u8,
) -> Result<Blockref> {
    let table = read_table(parent, data)?;
    for (i, entry) in table.iter().enumerate() {
        if entry.typ == typ && entry.key == key {
            let removed = *entry;
            write_table_entry(parent, data, i, &Blockref::new_zeroed())?;
            return Ok(removed);
        }
    }
    Err(ErrorSet::ENOENT)
}

/// Live entries of the table, key order.
pub fn live_entries(table: &[Blockref]) -> Vec<Blockref> {
    let mut live: Vec<Blockref> = table
        .iter()
        .filter(|b| b.typ != BREF_TYPE_EMPTY)
        .copied()
        .collect();
    live.sort_by_key(|b| b.key);
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dio::DioCache;
    use crate::ondisk::BREF_TYPE_DATA;

    fn volume_root() -> Arc<Chain> {
        let cache = DioCache::new(std::sync::Arc::new(crate::device::MemDevice::new(1 << 30))
            as Arc<dyn crate::device::Device>);
        Chain::new_root(cache, BREF_TYPE_VOLUME, [Blockref::new_zeroed(); 4])
    }

    #[test]
    fn insert_fills_slots_then_enospc() {
        let root = volume_root();
        let mut guard = root.lock.write();
        for i in 0..4u64 {
            let bref = Blockref::new(BREF_TYPE_DATA, i << 16, 16);
            base_insert(&root, &mut guard, &bref).unwrap();
        }
        let overflow = Blockref::new(BREF_TYPE_DATA, 5 << 16, 16);
        assert_eq!(base_insert(&root, &mut guard, &overflow), Err(ErrorSet::ENOSPC));
    }

    #[test]
    fn insert_rejects_overlap() {
        let root = volume_root();
        let mut guard = root.lock.write();
        let bref = Blockref::new(BREF_TYPE_DATA, 0, 16);
        base_insert(&root, &mut guard, &bref).unwrap();
        let overlapping = Blockref::new(BREF_TYPE_DATA, 0x8000, 15);
        assert_eq!(
            base_insert(&root, &mut guard, &overlapping),
            Err(ErrorSet::EEXIST)
        );
    }

    #[test]
    fn delete_frees_the_slot() {
        let root = volume_root();
        let mut guard = root.lock.write();
        let bref = Blockref::new(BREF_TYPE_DATA, 0x10000, 16);
        base_insert(&root, &mut guard, &bref).unwrap();
        let removed = base_delete(&root, &mut guard, 0x10000, BREF_TYPE_DATA).unwrap();
        assert_eq!(removed.key, 0x10000);
        assert_eq!(
            base_delete(&root, &mut guard, 0x10000, BREF_TYPE_DATA),
            Err(ErrorSet::ENOENT)
        );
        // The slot is reusable.
        base_insert(&root, &mut guard, &bref).unwrap();
    }

    #[test]
    fn live_entries_sorts_by_key() {
        let mut table = vec![Blockref::new_zeroed(); 4];
        table[0] = Blockref::new(BREF_TYPE_DATA, 0x30000, 16);
        table[2] = Blockref::new(BREF_TYPE_DATA, 0x10000, 16);
        let live = live_entries(&table);
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].key, 0x10000);
        assert_eq!(live[1].key, 0x30000);
    }
}
