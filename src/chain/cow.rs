//! Copy-on-write mutation: modify, resize, delete.
//!
//! `modify` is the heart of COW: live data is never overwritten. A
//! mutator gets fresh storage from the freemap, the old extent drops to
//! possibly-free, and the parent is told to re-emit the blockref at the
//! next flush.

use std::sync::Arc;

use bitflags::bitflags;
use log::trace;

use super::base;
use super::{Chain, ChainFlags};
use crate::dio::DioOp;
use crate::error::{ErrorSet, Result};
use crate::freemap;
use crate::mount::Dev;
use crate::ondisk::{
    off_join, off_split, BREF_TYPE_FREEMAP, BREF_TYPE_VOLUME,
};

bitflags! {
    pub struct ModifyFlags: u32 {
        /// The caller will regenerate the data; the new block may be left
        /// uninitialized (INITIAL stays set).
        const OPTDATA = 0x0002;
        /// Keep the existing physical extent even though COW would
        /// normally reallocate. Reserved for emergency mode.
        const INPLACE = 0x0004;
    }
}

bitflags! {
    pub struct DeleteFlags: u32 {
        /// Free the physical extent once the flush commits instead of
        /// retaining it as a snapshotted extent.
        const PERMANENT = 0x0001;
    }
}

fn is_root_type(typ: u8) -> bool {
    typ == BREF_TYPE_VOLUME || typ == BREF_TYPE_FREEMAP
}

/// COWs `chain`'s storage under transaction id `mtid`.
///
/// A chain already MODIFIED whose block was allocated by this same
/// transaction reuses it; otherwise a fresh extent is allocated, the old
/// contents staged across (unless OPTDATA), and the stale extent marked
/// possibly-free for the next bulkfree pass.
pub fn modify(dev: &Dev, chain: &Arc<Chain>, mtid: u64, flags: ModifyFlags) -> Result<()> {
    if dev.is_read_only() {
        return Err(ErrorSet::EROFS);
    }

    // Roots have no media storage of their own; their "block" is the
    // volume header.
    if is_root_type(chain.typ) {
        let mut guard = chain.lock.write();
        guard.bref.modify_tid = mtid;
        chain.set_flags(ChainFlags::MODIFIED);
        drop(guard);
        chain.setflush();
        return Ok(());
    }

    let mut guard = chain.lock.write();
    let old_off = guard.bref.data_off;
    let bytes = guard.bref.media_bytes();

    if old_off == 0 && guard.bref.vradix == 0 {
        // Storage-less chain (short-name dirent); content lives in the
        // bref itself.
        guard.bref.modify_tid = mtid;
        chain.set_flags(ChainFlags::MODIFIED | ChainFlags::UPDATE);
        drop(guard);
        chain.setflush();
        return Ok(());
    }

    if chain.flags().contains(ChainFlags::MODIFIED)
        && guard.alloc_mtid == mtid
        && old_off != 0
    {
        // Same transaction already gave this chain fresh storage.
        guard.bref.modify_tid = mtid;
        drop(guard);
        chain.setflush();
        return Ok(());
    }

    let radix = if bytes != 0 {
        off_split(old_off).1
    } else {
        guard.bref.vradix
    };
    let alloc_bytes = 1usize << radix;
    // Stamp before allocating so freemap leaf mutations ride this
    // transaction id.
    guard.bref.modify_tid = mtid;

    let new_off = if flags.contains(ModifyFlags::INPLACE) && old_off != 0 {
        old_off
    } else {
        let allocated = if guard.bref.is_freemap_type() {
            freemap::reserve(&guard.bref, radix)
        } else {
            freemap::alloc(dev, &guard.bref, alloc_bytes)
        };
        match allocated {
            Ok(off) => off_join(off, radix),
            Err(e) if e == ErrorSet::ENOSPC && dev.is_emergency() && old_off != 0 => {
                // Emergency mode: modify in place to make forward
                // progress when COW itself cannot allocate.
                old_off
            }
            Err(e) => return Err(e),
        }
    };

    if new_off != old_off {
        let (new_media, _) = off_split(new_off);
        let new_dio = dev.dio.get(new_media, DioOp::WriteNew).map_err(|e| {
            chain.record_error(e);
            e
        })?;

        if !flags.contains(ModifyFlags::OPTDATA)
            && !chain.flags().contains(ChainFlags::INITIAL)
        {
            // Stage the old contents into the new block.
            let (old_media, _) = off_split(old_off);
            let mut staged = vec![0u8; alloc_bytes];
            if let Some(old_dio) = &guard.dio {
                old_dio.read_at(old_media, &mut staged);
            } else if old_off != 0 {
                let old_dio = dev.dio.get(old_media, DioOp::Read)?;
                old_dio.read_at(old_media, &mut staged);
            }
            new_dio.write_at(new_media, &staged);
        } else {
            new_dio.invalidate(new_media, alloc_bytes);
        }

        if old_off != 0 && !guard.bref.is_freemap_type() {
            // Freemap blocks rotate through reserved sub-slots; their old
            // generations are reclaimed by the rotation itself.
            let (old_media, _) = off_split(old_off);
            dev.dio.dedup_delete(old_media);
            freemap::deferred_free(dev, old_off, mtid)?;
        }

        guard.bref.data_off = new_off;
        guard.dio = Some(new_dio);
        guard.alloc_mtid = mtid;
        chain.clear_flags(ChainFlags::TESTEDGOOD);
        if !flags.contains(ModifyFlags::OPTDATA) {
            chain.clear_flags(ChainFlags::INITIAL);
        }
        trace!(
            "cow chain key={:#x} typ={} {:#x} -> {:#x}",
            chain.key,
            chain.typ,
            old_off,
            new_off
        );
    }

    guard.bref.modify_tid = mtid;
    chain.set_flags(ChainFlags::MODIFIED | ChainFlags::UPDATE);
    if chain.flags().contains(ChainFlags::BMAPPED) {
        chain.set_flags(ChainFlags::BMAPUPD);
    }
    drop(guard);
    chain.setflush();
    Ok(())
}

/// Modify that also grows or shrinks the allocation to `new_radix`.
/// Shrinking invalidates the tail bytes beyond the new size.
pub fn resize(dev: &Dev, chain: &Arc<Chain>, mtid: u64, new_radix: u8) -> Result<()> {
    if dev.is_read_only() {
        return Err(ErrorSet::EROFS);
    }
    if new_radix < crate::param::MIN_RADIX || new_radix > crate::param::MAX_RADIX {
        return Err(ErrorSet::EINVAL);
    }

    let (old_off, old_radix, mut bref_snapshot) = {
        let guard = chain.lock.read();
        (guard.bref.data_off, off_split(guard.bref.data_off).1, guard.bref)
    };
    bref_snapshot.modify_tid = mtid;
    if old_off != 0 && old_radix == new_radix {
        return modify(dev, chain, mtid, ModifyFlags::empty());
    }

    let old_bytes = if old_off == 0 { 0 } else { 1usize << old_radix };
    let new_bytes = 1usize << new_radix;

    let new_media = if bref_snapshot.is_freemap_type() {
        freemap::reserve(&bref_snapshot, new_radix)?
    } else {
        freemap::alloc(dev, &bref_snapshot, new_bytes)?
    };
    let new_off = off_join(new_media, new_radix);

    let new_dio = dev.dio.get(new_media, DioOp::WriteNew)?;
    let copy = old_bytes.min(new_bytes);
    let mut staged = vec![0u8; new_bytes];
    if copy > 0 && !chain.flags().contains(ChainFlags::INITIAL) {
        let (old_media, _) = off_split(old_off);
        let old_dio = dev.dio.get(old_media, DioOp::Read)?;
        let mut old_content = vec![0u8; old_bytes];
        old_dio.read_at(old_media, &mut old_content);
        staged[..copy].copy_from_slice(&old_content[..copy]);
    }
    new_dio.write_at(new_media, &staged);

    if old_off != 0 && !bref_snapshot.is_freemap_type() {
        let (old_media, _) = off_split(old_off);
        dev.dio.dedup_delete(old_media);
        freemap::deferred_free(dev, old_off, mtid)?;
    }

    let mut guard = chain.lock.write();
    guard.bref.data_off = new_off;
    guard.bref.vradix = new_radix;
    guard.bref.modify_tid = mtid;
    guard.dio = Some(new_dio);
    guard.alloc_mtid = mtid;
    chain.clear_flags(ChainFlags::TESTEDGOOD | ChainFlags::INITIAL);
    chain.set_flags(ChainFlags::MODIFIED | ChainFlags::UPDATE);
    if chain.flags().contains(ChainFlags::BMAPPED) {
        chain.set_flags(ChainFlags::BMAPUPD);
    }
    drop(guard);
    chain.setflush();
    Ok(())
}

/// Unhooks `chain` from `parent`'s block table and marks it DELETED. The
/// chain persists in memory until its lock and any in-flight flush are
/// done; DESTROY lets the flush skip its I/O. Deleting an indirect node
/// carries DESTROY to its children.
pub fn delete(
    dev: &Dev,
    parent: &Arc<Chain>,
    chain: &Arc<Chain>,
    mtid: u64,
    flags: DeleteFlags,
) -> Result<()> {
    if dev.is_read_only() {
        return Err(ErrorSet::EROFS);
    }

    {
        let actual = chain.parent();
        match actual {
            Some(p) if Arc::ptr_eq(&p, parent) => {}
            // Parent moved underneath us; the caller re-locks and
            // re-checks its invariants.
            _ => return Err(ErrorSet::EAGAIN),
        }
    }

    if chain.flags().contains(ChainFlags::BMAPPED) {
        modify(dev, parent, mtid, ModifyFlags::empty())?;
        let mut pguard = parent.lock.write();
        base::base_delete(parent, &mut pguard, chain.key, chain.typ)?;
        chain.clear_flags(ChainFlags::BMAPPED | ChainFlags::BMAPUPD);
    }

    chain.set_flags(ChainFlags::DELETED | ChainFlags::DESTROY);
    chain.clear_flags(ChainFlags::UPDATE);
    let permanent = flags.contains(DeleteFlags::PERMANENT);
    mark_destroy_recursive(dev, chain, mtid, permanent)?;
    parent.detach_child(chain);
    parent.setflush();

    {
        let guard = chain.lock.read();
        if guard.bref.data_off != 0 {
            let (media, _) = off_split(guard.bref.data_off);
            dev.dio.dedup_delete(media);
        }
    }

    if permanent {
        freemap::chain_unallocate(dev, chain, mtid)?;
    }

    // Deferred destruction: the next flush drains this queue before
    // descending so pending deletions cannot violate topology invariants.
    dev.flushq.lock().push(Arc::clone(chain));
    Ok(())
}

/// Carries DESTROY down the in-memory subtree so its I/O can be skipped.
/// A permanent delete also drops every descendant's extent to
/// possibly-free; media-only descendants are caught by the next bulkfree
/// reachability pass.
fn mark_destroy_recursive(
    dev: &Dev,
    chain: &Arc<Chain>,
    mtid: u64,
    permanent: bool,
) -> Result<()> {
    let children: Vec<Arc<Chain>> = {
        let core = chain.core.lock();
        core.children.values().cloned().collect()
    };
    for child in children {
        child.set_flags(ChainFlags::DESTROY);
        if permanent && !child.lock.read().bref.is_freemap_type() {
            freemap::chain_unallocate(dev, &child, mtid)?;
        }
        mark_destroy_recursive(dev, &child, mtid, permanent)?;
    }
    Ok(())
}
