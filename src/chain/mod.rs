//! The in-memory topology node.
//!
//! A chain wraps one blockref plus its lock, reference count, parent link,
//! children tree, and dirty flags. Parents own their children by reference;
//! a child reaches its parent through a weak back-pointer plus a wire count
//! on the parent's DIO frame, which breaks the cycle without external
//! collection.
//!
//! Interface:
//! * `lookup`/`next` descend and iterate (ops module).
//! * `create`/`modify`/`resize`/`delete` mutate under copy-on-write (cow
//!   module).
//! * Flags drive the flush engine; errors accumulate sticky per chain.

mod base;
mod cow;
mod ops;

pub use base::{base_delete, base_insert, read_table, table_capacity, write_table};
pub use cow::{delete, modify, resize, DeleteFlags, ModifyFlags};
pub use ops::{
    collapse_indirect, create, create_indirect, lookup, next, scan_children, CreateArgs,
    LookupFlags,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::check;
use crate::dio::{DioCache, DioOp, DioRef};
use crate::error::{ErrorSet, Result};
use crate::lock::{RwSleep, RwSleepReadGuard, RwSleepWriteGuard, Spinlock};
use crate::ondisk::{
    Blockref, BREF_TYPE_DIRENT, BREF_TYPE_FREEMAP, BREF_TYPE_INODE, BREF_TYPE_VOLUME,
};

bitflags! {
    /// Chain state bits. Flag values follow the media format's on-flush
    /// conventions so dumps read the same across tools.
    pub struct ChainFlags: u32 {
        /// Dirty chain data; cleared when a flush writes the block.
        const MODIFIED    = 0x0000_0001;
        /// I/O for this block can be skipped; it is going away.
        const DESTROY     = 0x0000_0004;
        /// Removed from its parent's block table.
        const DELETED     = 0x0000_0010;
        /// Backing storage allocated, contents implicitly zero.
        const INITIAL     = 0x0000_0020;
        /// Parent blockref needs refresh at flush.
        const UPDATE      = 0x0000_0040;
        /// Check code verified against the loaded data.
        const TESTEDGOOD  = 0x0000_0100;
        /// Somewhere below this chain there is flush work.
        const ONFLUSH     = 0x0000_0200;
        /// On the recycle LRU.
        const ONLRU       = 0x0000_8000;
        /// Present in the parent's block table.
        const BMAPPED     = 0x0004_0000;
        /// Present but the stored blockref is stale.
        const BMAPUPD     = 0x0008_0000;
        /// Super-root to PFS-root transition; flushes stop here unless
        /// driven with ALL.
        const PFSBOUNDARY = 0x0040_0000;
    }
}

bitflags! {
    /// Data-resolution request when locking a chain.
    pub struct Resolve: u32 {
        /// Reserve only, leave data unresolved.
        const NEVER  = 0x01;
        /// Resolve only when the frame is already cached.
        const MAYBE  = 0x02;
        /// Read the backing frame if needed.
        const ALWAYS = 0x04;
        /// Shared lock instead of exclusive.
        const SHARED = 0x10;
        /// Explicit same-thread shared re-acquisition.
        const LOCKAGAIN = 0x20;
        /// Fail with EAGAIN instead of blocking.
        const NONBLOCK = 0x80;
    }
}

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable per-chain state guarded by the chain lock.
pub struct ChainData {
    pub bref: Blockref,
    /// Backing frame while resolved-with-data.
    pub dio: Option<DioRef>,
    /// In-memory block table for chains with no media backing (the
    /// volume and freemap roots keep their blocksets in the volume
    /// header, not in a data block).
    pub embedded_set: Option<Box<[Blockref; 4]>>,
    /// Transaction id that allocated the current `data_off`; lets a
    /// second modify in the same transaction reuse the block.
    pub alloc_mtid: u64,
}

pub struct ChainCore {
    pub parent: Weak<Chain>,
    /// Live children keyed by `(key, chain id)`; the id disambiguates
    /// while a key is reused across delete/create in one transaction.
    pub children: BTreeMap<(u64, u64), Arc<Chain>>,
}

/// See module docs.
pub struct Chain {
    pub id: u64,
    /// Snapshot of `bref.key`/`keybits`/`typ` for tree bookkeeping; the
    /// authoritative copy lives under the lock.
    pub key: u64,
    pub keybits: u8,
    pub typ: u8,
    pub lock: RwSleep<ChainData>,
    pub core: Spinlock<ChainCore>,
    flags: AtomicU32,
    refs: AtomicU32,
    error: AtomicU32,
    pub(crate) dio_cache: DioCache,
}

impl Chain {
    /// Builds a chain from a decoded blockref. The bref is validated
    /// here; a violation records `BADBREF` and the sticky error surfaces
    /// on every lock.
    pub fn from_bref(dio_cache: DioCache, bref: Blockref) -> Arc<Chain> {
        let chain = Arc::new(Chain {
            id: NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed),
            key: bref.key,
            keybits: bref.keybits,
            typ: bref.typ,
            lock: RwSleep::new(ChainData {
                bref,
                dio: None,
                embedded_set: None,
                alloc_mtid: 0,
            }),
            core: Spinlock::new(ChainCore {
                parent: Weak::new(),
                children: BTreeMap::new(),
            }),
            flags: AtomicU32::new(0),
            refs: AtomicU32::new(1),
            error: AtomicU32::new(0),
            dio_cache,
        });
        if !bref.validate() {
            chain.record_error(ErrorSet::BADBREF);
        }
        chain
    }

    /// Builds an in-memory root chain (volume or freemap) whose block
    /// table lives in the volume header.
    pub fn new_root(dio_cache: DioCache, typ: u8, blockset: [Blockref; 4]) -> Arc<Chain> {
        debug_assert!(typ == BREF_TYPE_VOLUME || typ == BREF_TYPE_FREEMAP);
        let mut bref = Blockref::new(typ, 0, 64);
        bref.mirror_tid = blockset.iter().map(|b| b.mirror_tid).max().unwrap_or(0);
        let chain = Chain::from_bref(dio_cache, bref);
        chain.lock.write().embedded_set = Some(Box::new(blockset));
        chain
    }

    pub fn flags(&self) -> ChainFlags {
        ChainFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: ChainFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: ChainFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Accumulated sticky error, applied on lock.
    pub fn error(&self) -> ErrorSet {
        ErrorSet::from_bits_truncate(self.error.load(Ordering::Acquire))
    }

    pub fn record_error(&self, error: ErrorSet) {
        self.error.fetch_or(error.bits(), Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one structural reference. The memory itself is governed by
    /// `Arc`; this count gates LRU recycling only.
    pub fn ref_dec(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn parent(&self) -> Option<Arc<Chain>> {
        self.core.lock().parent.upgrade()
    }

    /// Whether this chain may have children in the topology.
    pub fn has_block_table(&self) -> bool {
        !matches!(
            self.typ,
            crate::ondisk::BREF_TYPE_DATA
                | BREF_TYPE_DIRENT
                | crate::ondisk::BREF_TYPE_FREEMAP_LEAF
        )
    }

    /// Logical data size in bytes.
    pub fn bytes(&self) -> usize {
        self.lock.read().bref.media_bytes()
    }

    /// Locks shared and resolves per `how`, returning the guard. The
    /// sticky error, if any, is returned alongside so bulk scans can skip
    /// while mutators abort.
    pub fn lock_shared(
        self: &Arc<Chain>,
        how: Resolve,
    ) -> Result<RwSleepReadGuard<'_, ChainData>> {
        if how.contains(Resolve::ALWAYS) {
            // Resolution may need the write side to install the DIO.
            self.resolve_data()?;
        }
        let guard = if how.contains(Resolve::NONBLOCK) {
            self.lock.try_read().ok_or(ErrorSet::EAGAIN)?
        } else {
            self.lock.read()
        };
        let error = self.error();
        if error.is_empty() || error.is_transient() {
            Ok(guard)
        } else {
            // Caller still gets the error; the chain stays usable for
            // scans that choose to skip it.
            Err(error)
        }
    }

    /// Locks exclusive and resolves per `how`.
    pub fn lock_excl(
        self: &Arc<Chain>,
        how: Resolve,
    ) -> Result<RwSleepWriteGuard<'_, ChainData>> {
        if how.contains(Resolve::ALWAYS) {
            self.resolve_data()?;
        }
        let guard = if how.contains(Resolve::NONBLOCK) {
            self.lock.try_write().ok_or(ErrorSet::EAGAIN)?
        } else {
            self.lock.write()
        };
        let error = self.error();
        if error.is_empty() || error.is_transient() {
            Ok(guard)
        } else {
            Err(error)
        }
    }

    /// Ensures the backing frame is loaded and verified. INITIAL chains
    /// materialize a zero frame without touching the device; short-name
    /// DIRENT chains have no data block at all.
    pub fn resolve_data(self: &Arc<Chain>) -> Result<()> {
        let mut data = self.lock.write();
        self.resolve_data_locked(&mut data)
    }

    pub(crate) fn resolve_data_locked(
        self: &Arc<Chain>,
        data: &mut RwSleepWriteGuard<'_, ChainData>,
    ) -> Result<()> {
        if data.dio.is_some() || data.embedded_set.is_some() {
            return Ok(());
        }
        let bref = data.bref;
        if bref.data_off == 0 {
            if bref.typ == BREF_TYPE_DIRENT && bref.embed_dirent().namlen as usize <= 64 {
                // Short name lives in the check area.
                return Ok(());
            }
            if self.flags().contains(ChainFlags::INITIAL) {
                return Ok(());
            }
            return Ok(());
        }
        let (off, _) = crate::ondisk::off_split(bref.data_off);
        let op = if self.flags().contains(ChainFlags::INITIAL) {
            DioOp::WriteNew
        } else {
            DioOp::Read
        };
        let dio = match self.dio_cache.get(off, op) {
            Ok(dio) => dio,
            Err(error) => {
                self.record_error(error);
                return Err(self.error());
            }
        };
        if op == DioOp::Read && !self.flags().contains(ChainFlags::TESTEDGOOD) {
            let verified = dio.with_data(off, bref.media_bytes(), |bytes| {
                check::verify(bref.methods, &bref.check, bytes)
            });
            match verified {
                Ok(()) => self.set_flags(ChainFlags::TESTEDGOOD),
                Err(error) => {
                    self.record_error(error);
                    data.dio = Some(dio);
                    return Err(self.error());
                }
            }
        }
        data.dio = Some(dio);
        Ok(())
    }

    /// Copies the chain's current data bytes out. INITIAL chains read as
    /// zeros.
    pub fn read_data(self: &Arc<Chain>) -> Result<Vec<u8>> {
        self.resolve_data()?;
        let data = self.lock.read();
        let bytes = data.bref.media_bytes();
        match &data.dio {
            Some(dio) => {
                let (off, _) = crate::ondisk::off_split(data.bref.data_off);
                let mut out = vec![0u8; bytes];
                dio.read_at(off, &mut out);
                Ok(out)
            }
            None => Ok(vec![0u8; bytes]),
        }
    }

    /// Hooks `child` under `self`, wiring the parent frame so it stays
    /// resident while the child exists.
    pub fn attach_child(self: &Arc<Chain>, child: &Arc<Chain>) {
        {
            let data = self.lock.read();
            if let Some(dio) = &data.dio {
                dio.handle().wire();
            }
        }
        let mut core = self.core.lock();
        core.children.insert((child.key, child.id), Arc::clone(child));
        child.core.lock().parent = Arc::downgrade(self);
    }

    /// Unhooks `child`. The parent frame is unwired; the child keeps its
    /// weak back-pointer cleared.
    pub fn detach_child(self: &Arc<Chain>, child: &Chain) {
        {
            let data = self.lock.read();
            if let Some(dio) = &data.dio {
                dio.handle().unwire();
            }
        }
        let mut core = self.core.lock();
        core.children.remove(&(child.key, child.id));
        child.core.lock().parent = Weak::new();
    }

    /// Live (non-deleted) child covering or overlapping `[beg, end]`,
    /// lowest key first. Uses the immutable key snapshot so the children
    /// spinlock is never held across a sleeping lock.
    pub fn first_child_in(&self, beg: u64, end: u64) -> Option<Arc<Chain>> {
        let core = self.core.lock();
        for ((_, _), child) in core.children.iter() {
            if child.flags().contains(ChainFlags::DELETED) {
                continue;
            }
            let child_end = if child.keybits >= 64 {
                u64::MAX
            } else {
                child.key | ((1u64 << child.keybits) - 1)
            };
            if child_end >= beg && child.key <= end {
                return Some(Arc::clone(child));
            }
        }
        None
    }

    /// Number of live children.
    pub fn live_child_count(&self) -> usize {
        let core = self.core.lock();
        core.children
            .values()
            .filter(|c| !c.flags().contains(ChainFlags::DELETED))
            .count()
    }

    /// Marks the path from this chain to the root as holding flush work.
    pub fn setflush(self: &Arc<Chain>) {
        let mut cursor = Arc::clone(self);
        loop {
            if cursor.flags().contains(ChainFlags::ONFLUSH) {
                break;
            }
            cursor.set_flags(ChainFlags::ONFLUSH);
            let parent = cursor.parent();
            match parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
    }

    /// True once the chain holds no state a flush still needs.
    pub fn is_recyclable(&self) -> bool {
        self.ref_count() == 0
            && !self
                .flags()
                .intersects(ChainFlags::MODIFIED | ChainFlags::UPDATE | ChainFlags::ONFLUSH)
    }
}

impl core::fmt::Debug for Chain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("typ", &self.typ)
            .field("key", &format_args!("{:#x}", self.key))
            .field("keybits", &self.keybits)
            .field("flags", &self.flags())
            .finish()
    }
}

/// Recycle list for chains whose last reference dropped. Entries keep the
/// chain alive until capacity pushes them out; eviction detaches a clean
/// chain from its parent, letting `Arc` reclaim the memory.
pub struct ChainLru {
    list: Spinlock<std::collections::VecDeque<Arc<Chain>>>,
    limit: usize,
}

impl ChainLru {
    pub fn new(limit: usize) -> ChainLru {
        ChainLru {
            list: Spinlock::new(std::collections::VecDeque::new()),
            limit,
        }
    }

    pub fn note_unused(&self, chain: &Arc<Chain>) {
        if !chain.is_recyclable() || chain.flags().contains(ChainFlags::ONLRU) {
            return;
        }
        chain.set_flags(ChainFlags::ONLRU);
        let victim = {
            let mut list = self.list.lock();
            list.push_back(Arc::clone(chain));
            if list.len() > self.limit {
                list.pop_front()
            } else {
                None
            }
        };
        if let Some(victim) = victim {
            victim.clear_flags(ChainFlags::ONLRU);
            if victim.is_recyclable() {
                if let Some(parent) = victim.parent() {
                    parent.detach_child(&victim);
                }
            }
        }
    }

    /// Pulls a chain back off the LRU when it becomes referenced again.
    pub fn note_used(&self, chain: &Arc<Chain>) {
        if chain.flags().contains(ChainFlags::ONLRU) {
            let mut list = self.list.lock();
            list.retain(|c| c.id != chain.id);
            chain.clear_flags(ChainFlags::ONLRU);
        }
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }
}

/// Builds a chain for a media bref found in `parent`'s block table and
/// hooks it into the topology.
pub fn materialize_child(parent: &Arc<Chain>, bref: Blockref) -> Arc<Chain> {
    let chain = Chain::from_bref(parent.dio_cache.clone(), bref);
    if matches!(bref.typ, BREF_TYPE_INODE) && parent.typ == BREF_TYPE_VOLUME {
        chain.set_flags(ChainFlags::PFSBOUNDARY);
    }
    chain.set_flags(ChainFlags::BMAPPED);
    parent.attach_child(&chain);
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::ondisk::BREF_TYPE_DATA;
    use zerocopy::FromBytes;

    fn test_cache() -> DioCache {
        DioCache::new(Arc::new(MemDevice::new(1 << 30)) as Arc<dyn crate::device::Device>)
    }

    #[test]
    fn bad_bref_is_sticky_on_lock() {
        let bref = Blockref::new(BREF_TYPE_DATA, 0x4001, 14); // misaligned
        let chain = Chain::from_bref(test_cache(), bref);
        assert!(chain.error().contains(ErrorSet::BADBREF));
        assert!(chain.lock_shared(Resolve::NEVER).is_err());
    }

    #[test]
    fn attach_detach_maintains_links() {
        let cache = test_cache();
        let parent = Chain::new_root(cache.clone(), BREF_TYPE_VOLUME, [Blockref::new_zeroed(); 4]);
        let child = Chain::from_bref(cache, Blockref::new(BREF_TYPE_DATA, 0, 16));
        parent.attach_child(&child);
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
        assert_eq!(parent.live_child_count(), 1);
        parent.detach_child(&child);
        assert!(child.parent().is_none());
        assert_eq!(parent.live_child_count(), 0);
    }

    #[test]
    fn setflush_walks_to_root() {
        let cache = test_cache();
        let root = Chain::new_root(cache.clone(), BREF_TYPE_VOLUME, [Blockref::new_zeroed(); 4]);
        let mid = Chain::from_bref(cache.clone(), Blockref::new(BREF_TYPE_INODE, 0, 32));
        let leaf = Chain::from_bref(cache, Blockref::new(BREF_TYPE_DATA, 0, 16));
        root.attach_child(&mid);
        mid.attach_child(&leaf);
        leaf.setflush();
        assert!(mid.flags().contains(ChainFlags::ONFLUSH));
        assert!(root.flags().contains(ChainFlags::ONFLUSH));
    }

    #[test]
    fn lru_evicts_clean_chains_only() {
        let cache = test_cache();
        let lru = ChainLru::new(1);
        let root = Chain::new_root(cache.clone(), BREF_TYPE_VOLUME, [Blockref::new_zeroed(); 4]);
        let a = Chain::from_bref(cache.clone(), Blockref::new(BREF_TYPE_DATA, 0, 16));
        let b = Chain::from_bref(cache, Blockref::new(BREF_TYPE_DATA, 1 << 16, 16));
        root.attach_child(&a);
        root.attach_child(&b);
        a.ref_dec();
        b.ref_dec();
        lru.note_unused(&a);
        lru.note_unused(&b); // pushes `a` out
        assert!(a.parent().is_none());
        assert!(b.parent().is_some());
    }
}
