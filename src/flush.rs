//! The flush engine.
//!
//! Flush walks the dirty subtree top-down (deferring past the recursion
//! cap), then settles bottom-up: stamp transaction ids, compute check
//! codes, emit blocks through the DIO layer, refresh parent block tables,
//! and roll statistics upward. Once the topology and freemap roots are
//! settled their blocksets go into the volume header, which rotates into
//! the next slot behind a device barrier.
//!
//! Flushers are isolated from mutators by transaction admission: at most
//! one flush runs, and aged flushes hold off new normal transactions.

use std::sync::Arc;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use log::{debug, info, trace};

use crate::chain::{self, Chain, ChainFlags};
use crate::check;
use crate::error::{ErrorSet, Result};
use crate::mount::Dev;
use crate::ondisk::{
    off_split, StatsHead, BREF_TYPE_DATA, BREF_TYPE_DIRENT, BREF_TYPE_EMPTY,
    BREF_TYPE_FREEMAP_NODE, BREF_TYPE_INDIRECT, BREF_TYPE_INODE,
};
use crate::param::FLUSH_DEPTH_LIMIT;
use crate::trans::TransKind;

bitflags! {
    pub struct FlushFlags: u32 {
        /// Top-level invocation.
        const TOP        = 0x0001;
        /// Cross PFS boundaries.
        const ALL        = 0x0002;
        /// Stop at sub-inodes.
        const INODE_STOP = 0x0004;
        /// Part of a full filesystem sync.
        const FSSYNC     = 0x0008;
    }
}

/// Collapse an indirect node once its population falls to this.
const COLLAPSE_THRESHOLD: usize = 4;

fn is_dirty(chain: &Chain) -> bool {
    chain.flags().intersects(
        ChainFlags::MODIFIED | ChainFlags::UPDATE | ChainFlags::ONFLUSH | ChainFlags::DESTROY,
    )
}

/// Full device flush: both roots, then the volume header. A flush with
/// nothing dirty does no I/O at all.
pub fn flush_device(dev: &Arc<Dev>) -> Result<()> {
    let trans = dev.trans.begin(TransKind::Flush);
    let mtid = trans.mtid();

    // Deferred destruction queue: finalize before descending so pending
    // deletions cannot violate topology invariants mid-walk.
    let destroyq: Vec<Arc<Chain>> = dev.flushq.lock().drain(..).collect();
    for chain in destroyq {
        debug_assert!(chain.flags().contains(ChainFlags::DESTROY));
        chain.clear_flags(ChainFlags::MODIFIED | ChainFlags::UPDATE | ChainFlags::ONFLUSH);
        let mut guard = chain.lock.write();
        guard.dio = None;
    }

    if !is_dirty(&dev.vchain) && !is_dirty(&dev.fchain) {
        trace!("flush: nothing dirty, no i/o");
        return Ok(());
    }

    let mut error = ErrorSet::empty();
    if let Err(e) = flush_tree(dev, &dev.vchain, mtid, FlushFlags::TOP | FlushFlags::ALL | FlushFlags::FSSYNC) {
        error |= e;
    }
    // Topology settling dirties the freemap (parent COWs, deferred
    // frees); the freemap root flushes second and converges quickly.
    let mut passes = 0;
    while is_dirty(&dev.fchain) && passes < 4 {
        if let Err(e) = flush_tree(dev, &dev.fchain, mtid, FlushFlags::TOP | FlushFlags::ALL) {
            error |= e;
            break;
        }
        passes += 1;
    }

    // An errored flush still attempted to write modified sub-chains, but
    // the header must not rotate over a damaged root.
    if !error.is_empty() && !error.is_transient() {
        return Err(error);
    }

    if let Err(e) = dev.dio.flush_dirty() {
        return Err(error | e);
    }

    // Root-level commit: copy final root blocksets, stamp the epoch,
    // barrier, then rotate the header into the next slot.
    {
        let mut vol = dev.voldata.lock();
        {
            let vguard = dev.vchain.lock.read();
            if let Some(set) = &vguard.embedded_set {
                vol.sroot_blockset = **set;
            }
            let fguard = dev.fchain.lock.read();
            if let Some(set) = &fguard.embedded_set {
                vol.freemap_blockset = **set;
            }
        }
        vol.mirror_tid = mtid;
        vol.freemap_tid = mtid;
    }
    let slot = dev.volhdr_slot.load(std::sync::atomic::Ordering::Acquire);
    let next = {
        let mut vol = dev.voldata.lock();
        crate::volume::rotate_write(&dev.device, &mut vol, slot)?
    };
    dev.volhdr_slot
        .store(next, std::sync::atomic::Ordering::Release);
    info!("flush committed mirror_tid={} header slot {}", mtid, next);
    Ok(())
}

/// Drives `flush_recurse` until the deferral list drains. Each deferred
/// chain restarts at depth zero, bounding stack growth to the cap.
fn flush_tree(dev: &Arc<Dev>, root: &Arc<Chain>, mtid: u64, flags: FlushFlags) -> Result<()> {
    let mut error = ErrorSet::empty();
    loop {
        let mut deferrals: ArrayVec<Arc<Chain>, 64> = ArrayVec::new();
        if let Err(e) = flush_recurse(dev, root, mtid, flags, 0, &mut deferrals) {
            error |= e;
        }
        if deferrals.is_empty() {
            break;
        }
        debug!("flush: {} deferred subtrees, re-driving", deferrals.len());
        for chain in deferrals.iter() {
            let mut sub: ArrayVec<Arc<Chain>, 64> = ArrayVec::new();
            if let Err(e) = flush_recurse(dev, chain, mtid, flags, 0, &mut sub) {
                error |= e;
            }
            // Sub-deferrals re-enter through the outer loop because the
            // root still carries ONFLUSH.
        }
    }
    // DEPTH is internal flow control; it resolves through the deferral
    // loop and must not surface.
    error -= ErrorSet::DEPTH;
    if error.is_empty() || error.is_transient() {
        Ok(())
    } else {
        Err(error)
    }
}

fn flush_recurse(
    dev: &Arc<Dev>,
    chain: &Arc<Chain>,
    mtid: u64,
    flags: FlushFlags,
    depth: usize,
    deferrals: &mut ArrayVec<Arc<Chain>, 64>,
) -> Result<()> {
    if !is_dirty(chain) {
        return Ok(());
    }
    if depth >= FLUSH_DEPTH_LIMIT {
        // Unwind; the driver loop re-invokes from this chain at depth 0.
        if !deferrals.is_full() {
            deferrals.push(Arc::clone(chain));
        }
        return Err(ErrorSet::DEPTH);
    }

    let descend = if depth == 0 {
        true
    } else if chain.flags().contains(ChainFlags::PFSBOUNDARY) && !flags.contains(FlushFlags::ALL)
    {
        false
    } else if flags.contains(FlushFlags::INODE_STOP) && chain.typ == BREF_TYPE_INODE {
        false
    } else {
        true
    };

    let mut error = ErrorSet::empty();
    let mut deferred_below = false;
    if descend {
        let children: Vec<Arc<Chain>> = {
            let core = chain.core.lock();
            core.children.values().filter(|c| is_dirty(c)).cloned().collect()
        };
        for child in children {
            match flush_recurse(dev, &child, mtid, flags, depth + 1, deferrals) {
                Ok(()) => {}
                Err(e) if e == ErrorSet::DEPTH => deferred_below = true,
                Err(e) => error |= e,
            }
            if child.flags().contains(ChainFlags::DELETED) {
                continue;
            }
            maybe_collapse(dev, chain, &child, mtid);
        }
    }

    if !deferred_below {
        chain.clear_flags(ChainFlags::ONFLUSH);
    }
    if let Err(e) = settle(dev, chain, mtid) {
        error |= e;
    }
    if error.is_empty() {
        Ok(())
    } else {
        Err(error)
    }
}

/// Flush-time indirect maintenance: absorb an underpopulated node into
/// its parent. Gated by the mount option; the flush transaction excludes
/// concurrent mutators, so iteration cannot race the splice.
fn maybe_collapse(dev: &Arc<Dev>, parent: &Arc<Chain>, child: &Arc<Chain>, mtid: u64) {
    if !dev.opts.dynamic_indirect_collapse {
        return;
    }
    if child.typ != BREF_TYPE_INDIRECT && child.typ != BREF_TYPE_FREEMAP_NODE {
        return;
    }
    let population = child.live_child_count();
    if population > COLLAPSE_THRESHOLD {
        return;
    }
    if let Err(e) = chain::collapse_indirect(dev, parent, child, mtid) {
        debug!("indirect collapse skipped: {:?}", e);
    }
}

/// Bottom-up settle of one chain: checksum and emit MODIFIED data,
/// refresh the parent's blockref for UPDATE, roll statistics upward.
fn settle(dev: &Arc<Dev>, chain: &Arc<Chain>, mtid: u64) -> Result<()> {
    if chain
        .flags()
        .contains(ChainFlags::DESTROY | ChainFlags::DELETED)
    {
        // I/O for destroyed blocks is skipped entirely.
        chain.clear_flags(ChainFlags::MODIFIED | ChainFlags::UPDATE);
        return Ok(());
    }

    if chain.flags().contains(ChainFlags::MODIFIED) {
        rollup_stats(chain)?;
        let mut guard = chain.lock.write();
        guard.bref.mirror_tid = mtid;
        if let Some(dio) = guard.dio.clone() {
            let (media, _) = off_split(guard.bref.data_off);
            let bytes = guard.bref.media_bytes();
            if bytes > 0 {
                let methods = guard.bref.methods;
                let computed = dio.with_data(media, bytes, |d| check::generate(methods, d))?;
                guard.bref.check = computed;
                dio.bdwrite();
            }
        }
        // Short-name dirents keep the filename in the check area; there
        // is no data block to checksum.
        chain.set_flags(ChainFlags::TESTEDGOOD);
        chain.clear_flags(ChainFlags::MODIFIED);
    }

    if chain.flags().contains(ChainFlags::UPDATE) {
        update_parent(dev, chain, mtid)?;
    }
    Ok(())
}

/// Recomputes the aggregate `data_count`/`inode_count` statistics stored
/// in the chain's bref embed area from its block table.
fn rollup_stats(chain: &Arc<Chain>) -> Result<()> {
    if chain.typ != BREF_TYPE_INODE && chain.typ != BREF_TYPE_INDIRECT {
        return Ok(());
    }
    let mut guard = chain.lock.write();
    let table = match crate::chain::read_table(chain, &mut guard) {
        Ok(table) => table,
        Err(_) => return Ok(()), // DIRECTDATA inode: no table to roll up
    };
    let mut stats = StatsHead::default();
    for bref in table.iter().filter(|b| b.typ != BREF_TYPE_EMPTY) {
        match bref.typ {
            // Dirents embed their entry head, not statistics; only a
            // long-name data block contributes bytes.
            BREF_TYPE_DATA | BREF_TYPE_DIRENT => {
                stats.data_count += bref.media_bytes() as u64
            }
            BREF_TYPE_INODE => {
                let sub = bref.embed_stats();
                stats.data_count += sub.data_count;
                stats.inode_count += sub.inode_count + 1;
            }
            BREF_TYPE_INDIRECT => {
                let sub = bref.embed_stats();
                stats.data_count += sub.data_count;
                stats.inode_count += sub.inode_count;
            }
            _ => {}
        }
    }
    if chain.typ == BREF_TYPE_INODE || chain.typ == BREF_TYPE_INDIRECT {
        guard.bref.set_embed_stats(stats);
    }
    Ok(())
}

/// Writes the chain's settled bref into its parent's block table,
/// creating the slot (or splitting the parent) as needed.
fn update_parent(dev: &Arc<Dev>, chain: &Arc<Chain>, mtid: u64) -> Result<()> {
    loop {
        let parent = match chain.parent() {
            Some(parent) => parent,
            None => {
                // Roots land in the volume header at commit.
                chain.clear_flags(ChainFlags::UPDATE | ChainFlags::BMAPUPD);
                return Ok(());
            }
        };

        // COW the parent block inside the flush transaction before its
        // table is touched. Roots keep their set in memory.
        if parent.typ != crate::ondisk::BREF_TYPE_VOLUME
            && parent.typ != crate::ondisk::BREF_TYPE_FREEMAP
        {
            chain::modify(dev, &parent, mtid, chain::ModifyFlags::empty())?;
        }

        let bref = chain.lock.read().bref;
        let inserted = {
            let mut pguard = parent.lock.write();
            if chain.flags().contains(ChainFlags::BMAPPED) {
                // Blockref rewrite: drop the stale entry first.
                let _ = chain::base_delete(&parent, &mut pguard, chain.key, chain.typ);
            }
            chain::base_insert(&parent, &mut pguard, &bref)
        };
        match inserted {
            Ok(_) => {
                chain.set_flags(ChainFlags::BMAPPED);
                chain.clear_flags(ChainFlags::UPDATE | ChainFlags::BMAPUPD);
                return Ok(());
            }
            Err(e) if e == ErrorSet::ENOSPC => {
                // Parent table full: split and retry. The chain may have
                // been re-hooked under the new node.
                chain::create_indirect(dev, &parent, mtid)?;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
