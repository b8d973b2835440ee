//! Bulk free and mount-time fixup.
//!
//! Deleting a chain only drops its extent to possibly-free. This pass
//! walks the live topology to build a reachability bitmap, then returns
//! possibly-free extents nothing references to free. Snapshot roots keep
//! their whole subtree reachable, so snapshotted extents survive until
//! the snapshot itself is destroyed.

use std::collections::HashSet;
use std::sync::Arc;

use log::info;

use super::{get_leaf, set_extent_state};
use crate::chain::{self, Chain};
use crate::error::Result;
use crate::mount::Dev;
use crate::ondisk::{
    off_split, BmapData, BMAP_ALLOCATED, BMAP_FREE, BMAP_POSSIBLE,
};
use crate::param::{FREEMAP_BLOCK_SIZE, LEAF_BYTES, SEGSIZE};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BulkfreeStats {
    /// 16 KiB blocks examined in the possibly-free state.
    pub scanned: u64,
    /// Bytes returned to the free state.
    pub freed: u64,
    /// Bytes the fixup pass forced back to allocated.
    pub fixed: u64,
}

/// Collects the 16 KiB block indices referenced by every live bref under
/// `root`, this chain's own extent included.
fn collect_reachable(root: &Arc<Chain>, reachable: &mut HashSet<u64>) -> Result<()> {
    {
        let guard = root.lock.read();
        note_extent(&guard.bref, reachable);
    }
    if !root.has_block_table() {
        return Ok(());
    }
    for child in chain::scan_children(root)? {
        collect_reachable(&child, reachable)?;
    }
    Ok(())
}

fn note_extent(bref: &crate::ondisk::Blockref, reachable: &mut HashSet<u64>) {
    let (off, radix) = off_split(bref.data_off);
    if off == 0 || radix == 0 {
        return;
    }
    let bytes = 1u64 << radix;
    let first = off / FREEMAP_BLOCK_SIZE as u64;
    let last = (off + bytes - 1) / FREEMAP_BLOCK_SIZE as u64;
    for blk in first..=last {
        reachable.insert(blk);
    }
}

/// Reachability pass: transitions possibly-free extents no live bref
/// references back to free, crediting `allocator_free`.
pub fn bulkfree(dev: &Dev, mtid: u64) -> Result<BulkfreeStats> {
    let mut reachable = HashSet::new();
    collect_reachable(&dev.vchain, &mut reachable)?;

    let mut stats = BulkfreeStats::default();
    let volu_size = dev.voldata.lock().volu_size;

    let _serial = dev.alloc_lock.lock().unwrap_or_else(|e| e.into_inner());
    let mut leaf_key = 0u64;
    while leaf_key < volu_size {
        let leaf = get_leaf(dev, leaf_key, mtid, false)?;
        if let Some(mut leaf) = leaf {
            let mut changed = false;
            for (n, bmap) in leaf.data.bmap.iter_mut().enumerate() {
                for blk in 0..BmapData::BLOCKS {
                    let state = bmap.state(blk);
                    if state != BMAP_POSSIBLE && state != BMAP_ALLOCATED {
                        continue;
                    }
                    let media = leaf_key
                        + n as u64 * SEGSIZE
                        + (blk * FREEMAP_BLOCK_SIZE) as u64;
                    if reachable.contains(&(media / FREEMAP_BLOCK_SIZE as u64)) {
                        continue;
                    }
                    if state == BMAP_ALLOCATED {
                        // Unreachable but never staged: demote one phase.
                        // The next pass frees it if it stays unreachable.
                        bmap.set_state(blk, BMAP_POSSIBLE);
                        changed = true;
                        continue;
                    }
                    stats.scanned += 1;
                    bmap.set_state(blk, BMAP_FREE);
                    bmap.avail = (bmap.avail as u64 + FREEMAP_BLOCK_SIZE as u64)
                        .min(SEGSIZE) as u32;
                    bmap.linear = 0;
                    stats.freed += FREEMAP_BLOCK_SIZE as u64;
                    changed = true;
                }
            }
            if changed {
                {
                    let mut guard = leaf.chain.lock.write();
                    let mut head = guard.bref.embed_freemap();
                    head.bigmask = u32::MAX;
                    guard.bref.set_embed_freemap(head);
                }
                super::write_leaf(dev, &leaf.chain, mtid, &leaf.data)?;
            }
        }
        leaf_key += LEAF_BYTES;
    }

    if stats.freed > 0 {
        let mut vol = dev.voldata.lock();
        vol.allocator_free = (vol.allocator_free + stats.freed).min(vol.allocator_size);
        vol.bulkfree_tid = mtid;
    }
    info!(
        "bulkfree: scanned {} possibly-free blocks, freed {} bytes",
        stats.scanned, stats.freed
    );
    Ok(stats)
}

/// Mount-time recovery. The last flush may have committed topology whose
/// freemap writes never reached the media; any extent the topology still
/// references is forced back to allocated so no live bref loses its
/// target.
pub fn fixup(dev: &Dev, mtid: u64) -> Result<BulkfreeStats> {
    let mut reachable = HashSet::new();
    collect_reachable(&dev.vchain, &mut reachable)?;

    let mut stats = BulkfreeStats::default();
    for blk in reachable.iter() {
        let media = blk * FREEMAP_BLOCK_SIZE as u64;
        let state = super::extent_state(dev, media)?;
        match state {
            Some(BMAP_ALLOCATED) | None => {}
            Some(_) => {
                let _serial = dev.alloc_lock.lock().unwrap_or_else(|e| e.into_inner());
                let off = crate::ondisk::off_join(media, crate::param::FREEMAP_BLOCK_RADIX);
                set_extent_state(dev, off, mtid, BMAP_FREE, BMAP_ALLOCATED, true)?;
                set_extent_state(dev, off, mtid, BMAP_POSSIBLE, BMAP_ALLOCATED, true)?;
                stats.fixed += FREEMAP_BLOCK_SIZE as u64;
            }
        }
    }
    if stats.fixed > 0 {
        let mut vol = dev.voldata.lock();
        vol.allocator_free = vol.allocator_free.saturating_sub(stats.fixed);
        info!("freemap fixup: re-armed {} bytes", stats.fixed);
    }
    Ok(stats)
}
