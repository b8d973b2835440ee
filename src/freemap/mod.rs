//! Hierarchical 2-bit freemap allocator.
//!
//! Physical storage is tracked in 2-bit states per 16 KiB block, 128
//! blocks per 2 MiB bmap entry, 128 entries per 32 KiB leaf. Freemap
//! blocks themselves are never allocated through the freemap: they rotate
//! through four fixed sub-slots in the reserved segment at the base of
//! every zone, so three prior generations survive any crash.
//!
//! Allocation state machine per 16 KiB block:
//! `00` free -> `11` allocated -> `10` possibly-free -> `00` after a
//! bulkfree reachability pass proves nothing references the extent.
//! `01` armors reserved areas and static pre-allocations.

pub mod bulkfree;

use std::sync::Arc;

use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::chain::{self, Chain, ChainFlags, CreateArgs, LookupFlags, ModifyFlags};
use crate::check;
use crate::error::{ErrorSet, Result};
use crate::mount::Dev;
use crate::ondisk::{
    off_split, Blockref, BmapData, FreemapHead, FreemapLeafData, BMAP_ALLOCATED, BMAP_ARMORED,
    BMAP_FREE, BMAP_POSSIBLE, BREF_TYPE_FREEMAP_LEAF,
};
use crate::param::{
    ALLOC_MIN, FREEMAP_BASE, FREEMAP_BLOCK_RADIX, FREEMAP_BLOCK_SIZE, FREEMAP_COUNT,
    FREEMAP_LEAF_BYTES, FREEMAP_ROTATIONS, FREEMAP_SLOT_BYTES, HEUR_NRADIX, HEUR_TYPES,
    LEAF_BYTES, LEAF_RADIX, MAX_RADIX, MIN_RADIX, SEGSIZE, ZONE_BYTES, ZONE_SEG,
};

fn fmbase(off: u64, span: u64) -> u64 {
    off & !(span - 1)
}

fn leaf_key_for(off: u64) -> u64 {
    fmbase(off, LEAF_BYTES)
}

fn leaf_key_end(key: u64) -> u64 {
    key | (LEAF_BYTES - 1)
}

/// Heuristic slot for an allocation: same-class requests cluster so
/// inodes stay near inodes and data near data.
fn heur_slot(typ: u8, radix: u8) -> usize {
    let t = typ as usize % HEUR_TYPES;
    let r = ((radix.max(MIN_RADIX) - MIN_RADIX) as usize / 2).min(HEUR_NRADIX - 1);
    t * HEUR_NRADIX + r
}

fn alloc_class(typ: u8, radix: u8) -> u16 {
    ((typ as u16) << 8) | radix as u16
}

/// Media offset of the rotation sub-slot a freemap block moves to next.
/// The index is derived from the current `data_off`, so each update lands
/// in the next of the four generations.
pub fn reserve(bref: &Blockref, radix: u8) -> Result<u64> {
    let zone = fmbase(bref.key, ZONE_BYTES);
    let bytes = 1u64 << radix;
    debug_assert!(bytes <= FREEMAP_LEAF_BYTES as u64);

    let position = if bref.typ == BREF_TYPE_FREEMAP_LEAF {
        // Eight leaves per zone, by coverage index.
        ((bref.key - zone) / LEAF_BYTES) as u64
    } else if bref.keybits < 31 {
        // Sub-zone node: slot by first covered leaf. Disjointness makes
        // (zone, first-leaf) unique among live sub-zone nodes.
        24 + (bref.key - zone) / LEAF_BYTES
    } else {
        // Zone-sized or larger node: one per keybits per zone.
        let level = (bref.keybits - 31) as u64;
        assert!(level < 16, "freemap node level out of reserve range");
        8 + level
    };

    let rotation = if bref.data_off == 0 {
        0
    } else {
        let (off, _) = off_split(bref.data_off);
        let cur = (off - fmbase(off, ZONE_BYTES) - FREEMAP_BASE) / FREEMAP_SLOT_BYTES;
        (cur + 1) % FREEMAP_ROTATIONS
    };

    let off = zone + FREEMAP_BASE + rotation * FREEMAP_SLOT_BYTES + position * 32768;
    debug_assert!(off + bytes <= zone + ZONE_SEG);
    Ok(off)
}

struct LeafRef {
    chain: Arc<Chain>,
    data: FreemapLeafData,
}

fn read_leaf(chain: &Arc<Chain>) -> Result<FreemapLeafData> {
    let raw = chain.read_data()?;
    if raw.len() != FREEMAP_LEAF_BYTES {
        return Err(ErrorSet::BADBREF);
    }
    let mut data = FreemapLeafData::new_zeroed();
    data.as_bytes_mut().copy_from_slice(&raw);
    Ok(data)
}

fn write_leaf(dev: &Dev, leaf: &Arc<Chain>, mtid: u64, data: &FreemapLeafData) -> Result<()> {
    chain::modify(dev, leaf, mtid, ModifyFlags::OPTDATA)?;
    let mut guard = leaf.lock.write();
    leaf.resolve_data_locked(&mut guard)?;
    let (media, _) = off_split(guard.bref.data_off);
    match &guard.dio {
        Some(dio) => {
            dio.write_at(media, data.as_bytes());
            leaf.clear_flags(ChainFlags::INITIAL);
        }
        None => return Err(ErrorSet::EINVAL),
    }
    let avail: u64 = data.bmap.iter().map(|b| b.avail as u64).sum();
    let mut head = guard.bref.embed_freemap();
    head.avail = avail;
    guard.bref.set_embed_freemap(head);
    Ok(())
}

/// Finds the leaf covering `media_off`, creating and initializing it when
/// `create` is set. A fresh leaf armors the reserved segment of every
/// zone it covers, anything below `allocator_beg`, and anything past the
/// end of the volume.
fn get_leaf(dev: &Dev, media_off: u64, mtid: u64, create: bool) -> Result<Option<LeafRef>> {
    let key = leaf_key_for(media_off);
    let found = chain::lookup(
        &dev.fchain,
        key,
        leaf_key_end(key),
        LookupFlags::ALWAYS | LookupFlags::MATCHIND,
    )?;
    if let Some((chain, _)) = found {
        if chain.typ == BREF_TYPE_FREEMAP_LEAF {
            let data = read_leaf(&chain)?;
            return Ok(Some(LeafRef { chain, data }));
        }
    }
    if !create {
        return Ok(None);
    }

    let leaf = chain::create(
        dev,
        &dev.fchain,
        CreateArgs {
            key,
            keybits: LEAF_RADIX,
            typ: BREF_TYPE_FREEMAP_LEAF,
            bytes: FREEMAP_LEAF_BYTES,
            mtid,
            methods: Some(check::methods(check::COMP_NONE, check::CHECK_FREEMAP)),
            dedup_off: None,
        },
    )?;

    let (volu_size, allocator_beg) = {
        let vol = dev.voldata.lock();
        (vol.volu_size, vol.allocator_beg)
    };
    let mut data = FreemapLeafData::new_zeroed();
    for (n, bmap) in data.bmap.iter_mut().enumerate() {
        *bmap = BmapData::new_free();
        let seg_base = key + n as u64 * SEGSIZE;
        for blk in 0..BmapData::BLOCKS {
            let blk_base = seg_base + (blk * FREEMAP_BLOCK_SIZE) as u64;
            let zone_off = blk_base & (ZONE_BYTES - 1);
            let armored =
                zone_off < ZONE_SEG || blk_base < allocator_beg || blk_base >= volu_size;
            if armored {
                bmap.set_state(blk, BMAP_ARMORED);
                bmap.avail -= FREEMAP_BLOCK_SIZE as u32;
            }
        }
    }
    {
        let mut guard = leaf.lock.write();
        let mut head = FreemapHead::default();
        head.bigmask = u32::MAX;
        head.avail = data.bmap.iter().map(|b| b.avail as u64).sum();
        guard.bref.set_embed_freemap(head);
    }
    write_leaf(dev, &leaf, mtid, &data)?;
    debug!("freemap: created leaf {:#x}", key);
    Ok(Some(LeafRef { chain: leaf, data }))
}

/// Allocates `(1 << radix)` bytes out of one bmap entry. The linear
/// iterator packs sub-16 KiB requests until the current block fills;
/// otherwise the bitmap is scanned for an aligned run of zero bits.
fn bmap_alloc(bmap: &mut BmapData, class: u16, radix: u8) -> Option<u64> {
    let size = 1u64 << radix;
    if bmap.class != 0 && bmap.class != class {
        return None;
    }

    let (bmradix, bsize) = if radix <= FREEMAP_BLOCK_RADIX {
        (2usize, FREEMAP_BLOCK_SIZE as u64)
    } else {
        (2usize << (radix - FREEMAP_BLOCK_RADIX), size)
    };

    let block_mask = FREEMAP_BLOCK_SIZE as u64 - 1;
    let offset;
    if (bmap.linear as u64 & block_mask) != 0
        && (bmap.linear as u64 & block_mask) + size <= FREEMAP_BLOCK_SIZE as u64
        && (bmap.linear as u64) < SEGSIZE
    {
        // Mid-block: the covering 16 KiB is already marked allocated.
        offset = bmap.linear as u64;
        bmap.linear = (offset + size) as u32;
    } else {
        let mut found = None;
        'scan: for i in 0..8usize {
            let mut mask = if bmradix == 32 {
                u32::MAX
            } else {
                (1u32 << bmradix) - 1
            };
            let mut j = 0usize;
            while j < 32 {
                if bmap.bitmapq[i] & mask == 0 {
                    found = Some((i, j));
                    break 'scan;
                }
                mask = mask.wrapping_shl(bmradix as u32);
                j += bmradix;
            }
        }
        let (i, j) = found?;
        offset = (i as u64 * (SEGSIZE / 8)) + (j as u64 * (FREEMAP_BLOCK_SIZE as u64 / 2));
        let first_blk = (offset / FREEMAP_BLOCK_SIZE as u64) as usize;
        let nblks = (bsize as usize + FREEMAP_BLOCK_SIZE - 1) / FREEMAP_BLOCK_SIZE;
        for blk in first_blk..first_blk + nblks {
            bmap.set_state(blk, BMAP_ALLOCATED);
        }
        bmap.avail = bmap.avail.saturating_sub(bsize as u32);
        if size & block_mask != 0 {
            bmap.linear = (offset + size) as u32;
        }
        if bmap.class == 0 {
            bmap.class = class;
        }
    }
    Some(offset)
}

/// Allocates `bytes` of physical storage, classified by the requesting
/// bref's type so same-class allocations cluster. Returns the media byte
/// offset; the caller packs the radix into `data_off`.
pub fn alloc(dev: &Dev, bref: &Blockref, bytes: usize) -> Result<u64> {
    let bytes = bytes.max(ALLOC_MIN);
    let radix = crate::ondisk::bytes_to_radix(bytes);
    if radix > MAX_RADIX {
        return Err(ErrorSet::EINVAL);
    }
    let mtid = bref.modify_tid;
    let class = alloc_class(bref.typ, radix);
    let slot = heur_slot(bref.typ, radix);

    let _serial = dev.alloc_lock.lock().unwrap_or_else(|e| e.into_inner());

    // Reservation floor.
    {
        let vol = dev.voldata.lock();
        if vol.allocator_free < (1u64 << radix)
            || (vol.allocator_free - (1u64 << radix) < vol.free_reserved
                && !dev.is_emergency())
        {
            return Err(ErrorSet::ENOSPC);
        }
    }

    let volu_size = dev.voldata.lock().volu_size;
    let hint = dev.freemap_heur[slot].load(std::sync::atomic::Ordering::Relaxed);
    let mut leaf_key = leaf_key_for(hint.min(volu_size.saturating_sub(1)));
    let mut wraps = 0;

    while wraps < 2 {
        let leaf = get_leaf(dev, leaf_key, mtid, true)?;
        let mut leaf = match leaf {
            Some(leaf) => leaf,
            None => return Err(ErrorSet::ENOSPC),
        };

        let head = {
            let guard = leaf.chain.lock.read();
            guard.bref.embed_freemap()
        };
        if head.bigmask & (1u32 << radix) != 0 {
            let start = (((hint.max(leaf_key) - leaf_key) / SEGSIZE) as usize)
                .min(FREEMAP_COUNT - 1);
            // Scan outward from the hint segment, forward then backward.
            for step in 0..FREEMAP_COUNT {
                let mut candidates = [usize::MAX; 2];
                if start + step < FREEMAP_COUNT {
                    candidates[0] = start + step;
                }
                if step != 0 && start >= step {
                    candidates[1] = start - step;
                }
                for &n in candidates.iter().filter(|n| **n != usize::MAX) {
                    let bmap = &mut leaf.data.bmap[n];
                    if bmap.avail == 0 {
                        continue;
                    }
                    if let Some(seg_off) = bmap_alloc(bmap, class, radix) {
                        let off = leaf_key + n as u64 * SEGSIZE + seg_off;
                        write_leaf(dev, &leaf.chain, mtid, &leaf.data)?;
                        {
                            let mut vol = dev.voldata.lock();
                            vol.allocator_free =
                                vol.allocator_free.saturating_sub(1 << radix);
                        }
                        dev.freemap_heur[slot]
                            .store(off, std::sync::atomic::Ordering::Relaxed);
                        return Ok(off);
                    }
                }
            }
            // Nothing fits this radix here; prune future scans.
            let mut guard = leaf.chain.lock.write();
            let mut head = guard.bref.embed_freemap();
            head.bigmask &= !(1u32 << radix);
            guard.bref.set_embed_freemap(head);
        }

        leaf_key += LEAF_BYTES;
        if leaf_key >= volu_size {
            leaf_key = 0;
            wraps += 1;
        }
    }
    warn!("freemap: allocation map exhausted for radix {}", radix);
    Err(ErrorSet::ENOSPC)
}

pub(crate) fn set_extent_state(
    dev: &Dev,
    data_off: u64,
    mtid: u64,
    from: u8,
    to: u8,
    create_leaf: bool,
) -> Result<u64> {
    let (off, radix) = off_split(data_off);
    if off == 0 || radix == 0 {
        return Ok(0);
    }
    let bytes = 1u64 << radix;
    let leaf = get_leaf(dev, off, mtid, create_leaf)?;
    let mut leaf = match leaf {
        Some(leaf) => leaf,
        None => return Ok(0),
    };
    let leaf_key = leaf.chain.key;
    let first_blk = ((off - leaf_key) / FREEMAP_BLOCK_SIZE as u64) as usize;
    let nblks = ((bytes as usize + FREEMAP_BLOCK_SIZE - 1) / FREEMAP_BLOCK_SIZE).max(1);
    let mut changed = 0u64;
    for blk in first_blk..first_blk + nblks {
        let n = blk / BmapData::BLOCKS;
        let b = blk % BmapData::BLOCKS;
        let bmap = &mut leaf.data.bmap[n];
        if bmap.state(b) == from {
            bmap.set_state(b, to);
            changed += FREEMAP_BLOCK_SIZE as u64;
            if to == BMAP_FREE {
                bmap.avail = (bmap.avail as u64 + FREEMAP_BLOCK_SIZE as u64)
                    .min(SEGSIZE) as u32;
                bmap.linear = 0;
            }
            if from == BMAP_FREE && to == BMAP_ALLOCATED {
                bmap.avail = bmap.avail.saturating_sub(FREEMAP_BLOCK_SIZE as u32);
            }
        }
    }
    if changed > 0 {
        if to == BMAP_FREE {
            // Free space reappeared; let every radix retry this leaf.
            let mut guard = leaf.chain.lock.write();
            let mut head = guard.bref.embed_freemap();
            head.bigmask = u32::MAX;
            guard.bref.set_embed_freemap(head);
        }
        write_leaf(dev, &leaf.chain, mtid, &leaf.data)?;
    }
    Ok(changed)
}

/// Two-phase free, phase one: the extent transitions allocated ->
/// possibly-free. A later bulkfree pass walks the live topology and only
/// then returns unreferenced extents to free.
pub fn deferred_free(dev: &Dev, data_off: u64, mtid: u64) -> Result<()> {
    let _serial = dev.alloc_lock.lock().unwrap_or_else(|e| e.into_inner());
    set_extent_state(dev, data_off, mtid, BMAP_ALLOCATED, BMAP_POSSIBLE, true)?;
    Ok(())
}

/// Marks a chain's extent possibly-free (delete with PERMANENT, indirect
/// collapse).
pub fn chain_unallocate(dev: &Dev, chain: &Arc<Chain>, mtid: u64) -> Result<()> {
    let data_off = chain.lock.read().bref.data_off;
    if data_off != 0 {
        deferred_free(dev, data_off, mtid)?;
    }
    Ok(())
}

/// Mount-time recovery: force the extent back to allocated regardless of
/// its current state. Used by the fixup pass when the topology still
/// references storage the freemap lost track of.
pub fn force_allocated(dev: &Dev, data_off: u64, mtid: u64) -> Result<()> {
    let _serial = dev.alloc_lock.lock().unwrap_or_else(|e| e.into_inner());
    set_extent_state(dev, data_off, mtid, BMAP_FREE, BMAP_ALLOCATED, true)?;
    set_extent_state(dev, data_off, mtid, BMAP_POSSIBLE, BMAP_ALLOCATED, true)?;
    Ok(())
}

/// State of the first 16 KiB block of an extent, for tests and scrub.
pub fn extent_state(dev: &Dev, data_off: u64) -> Result<Option<u8>> {
    let (off, _) = off_split(data_off);
    let leaf = get_leaf(dev, off, 0, false)?;
    Ok(leaf.map(|leaf| {
        let blk = ((off - leaf.chain.key) / FREEMAP_BLOCK_SIZE as u64) as usize;
        leaf.data.bmap[blk / BmapData::BLOCKS].state(blk % BmapData::BLOCKS)
    }))
}

pub use bulkfree::{bulkfree, fixup, BulkfreeStats};
