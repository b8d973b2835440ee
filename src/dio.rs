//! Device I/O cache.
//!
//! Maps `(offset, size)` requests onto refcounted, frame-aligned buffer
//! handles. Caching frames in memory reduces device reads and provides the
//! synchronization point for blocks shared by multiple chains.
//!
//! Interface:
//! * To get a handle covering a media range, call `get` with an op.
//! * Concurrent getters of an in-progress frame wait on its interlock.
//! * After changing bytes call `set_dirty`; the write happens on the
//!   chosen write discipline (now, delayed, or at eviction).
//! * Handles release on drop; the last release of a dirty frame writes it
//!   out, a clean frame enters a bounded LRU.
//!
//! An I/O error marks the handle and is sticky for the handle's cached
//! lifetime; every chain that loads through it sees the error.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::check;
use crate::device::Device;
use crate::error::{ErrorSet, Result};
use crate::lock::{RwSleep, Sleepablelock, Spinlock};
use crate::param::{DEDUP_HEUR_SIZE, DIO_LRU_LIMIT, PBUFSIZE};

/// How a frame is brought into the cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DioOp {
    /// Read from the device on miss.
    Read,
    /// Zero-fill, never read; the caller will write every byte it uses.
    WriteNew,
    /// Zero-fill only when the frame is newly created, otherwise keep the
    /// cached contents.
    WriteNz,
}

struct DioState {
    inprog: bool,
    good: bool,
}

/// One cached device frame.
pub struct Dio {
    pbase: u64,
    state: Sleepablelock<DioState>,
    data: RwSleep<Box<[u8]>>,
    refs: AtomicU32,
    /// Pin count held by child chains to keep a parent's frame resident.
    wire: AtomicU32,
    dirty: AtomicU32,
    error: AtomicU32,
    /// One bit per 1/64th of the frame whose content is dedup-registered.
    dedup_valid: AtomicU64,
}

impl Dio {
    pub fn pbase(&self) -> u64 {
        self.pbase
    }

    /// Sticky error accumulated by I/O on this frame.
    pub fn error(&self) -> ErrorSet {
        ErrorSet::from_bits_truncate(self.error.load(Ordering::Acquire))
    }

    fn record_error(&self, error: ErrorSet) {
        self.error.fetch_or(error.bits(), Ordering::AcqRel);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) != 0
    }

    pub fn wire(&self) {
        self.wire.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unwire(&self) {
        self.wire.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Refcounted handle to a cached frame.
pub struct DioRef {
    dio: Arc<Dio>,
    cache: Arc<DioCacheInner>,
}

struct DioCacheInner {
    dev: Arc<dyn Device>,
    table: Spinlock<BTreeMap<u64, Arc<Dio>>>,
    lru: Spinlock<VecDeque<Arc<Dio>>>,
    /// Content-hash hints: `hash & mask` -> packed media offset of a frame
    /// with known matching content. Racy single-word hints; correctness
    /// does not depend on them.
    dedup_heur: Box<[AtomicU64]>,
}

/// Per-device frame cache.
#[derive(Clone)]
pub struct DioCache {
    inner: Arc<DioCacheInner>,
}

impl DioCache {
    pub fn new(dev: Arc<dyn Device>) -> DioCache {
        let mut heur = Vec::with_capacity(DEDUP_HEUR_SIZE);
        heur.resize_with(DEDUP_HEUR_SIZE, || AtomicU64::new(0));
        DioCache {
            inner: Arc::new(DioCacheInner {
                dev,
                table: Spinlock::new(BTreeMap::new()),
                lru: Spinlock::new(VecDeque::new()),
                dedup_heur: heur.into_boxed_slice(),
            }),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.inner.dev
    }

    /// Gets the frame covering byte offset `off`. The returned handle is
    /// shared with every other chain mapping the same frame.
    pub fn get(&self, off: u64, op: DioOp) -> Result<DioRef> {
        let pbase = off & !(PBUFSIZE as u64 - 1);
        let (dio, created) = {
            let mut table = self.inner.table.lock();
            match table.get(&pbase) {
                Some(dio) => {
                    dio.refs.fetch_add(1, Ordering::AcqRel);
                    (Arc::clone(dio), false)
                }
                None => {
                    let dio = Arc::new(Dio {
                        pbase,
                        state: Sleepablelock::new(DioState {
                            inprog: true,
                            good: false,
                        }),
                        data: RwSleep::new(vec![0u8; PBUFSIZE].into_boxed_slice()),
                        refs: AtomicU32::new(1),
                        wire: AtomicU32::new(0),
                        dirty: AtomicU32::new(0),
                        error: AtomicU32::new(0),
                        dedup_valid: AtomicU64::new(0),
                    });
                    table.insert(pbase, Arc::clone(&dio));
                    (dio, true)
                }
            }
        };

        if created {
            // We own the in-progress interlock; populate the frame.
            let result = match op {
                DioOp::Read => {
                    let mut data = dio.data.write();
                    self.inner.dev.read_at(pbase, &mut data[..])
                }
                DioOp::WriteNew | DioOp::WriteNz => Ok(()),
            };
            if let Err(error) = result {
                dio.record_error(error);
            }
            let mut state = dio.state.lock();
            state.inprog = false;
            state.good = result.is_ok();
            state.wakeup();
        } else {
            let mut state = dio.state.lock();
            while state.inprog {
                if state.sleep_timeout(Duration::from_secs(60)) {
                    panic!("dio: in-progress wait timed out");
                }
            }
            if op == DioOp::WriteNew {
                // The caller will rewrite its range; existing bytes stand
                // in for zeros only if the frame never loaded.
                if !state.good {
                    state.good = true;
                }
            } else if op == DioOp::Read && !state.good && dio.error().is_empty() {
                // Frame was created by a writer and is all zeros; that is
                // its true content.
                state.good = true;
            }
        }

        let error = dio.error();
        let dref = DioRef {
            dio,
            cache: Arc::clone(&self.inner),
        };
        if error.contains(ErrorSet::EIO) {
            return Err(ErrorSet::EIO);
        }
        Ok(dref)
    }

    /// Drops every clean cached frame. Dirty frames are written first.
    pub fn drain(&self) -> Result<()> {
        let mut error = ErrorSet::empty();
        let dios: Vec<Arc<Dio>> = {
            let table = self.inner.table.lock();
            table.values().cloned().collect()
        };
        for dio in dios {
            if dio.is_dirty() {
                if let Err(e) = self.inner.write_frame(&dio) {
                    error |= e;
                }
            }
        }
        self.inner.lru.lock().clear();
        let mut table = self.inner.table.lock();
        table.retain(|_, dio| {
            dio.refs.load(Ordering::Acquire) > 0 || dio.wire.load(Ordering::Acquire) > 0
        });
        if error.is_empty() {
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Writes every dirty frame out, in offset order.
    pub fn flush_dirty(&self) -> Result<()> {
        let dios: Vec<Arc<Dio>> = {
            let table = self.inner.table.lock();
            table.values().cloned().collect()
        };
        let mut error = ErrorSet::empty();
        for dio in dios {
            if dio.is_dirty() {
                if let Err(e) = self.inner.write_frame(&dio) {
                    error |= e;
                }
            }
        }
        if error.is_empty() {
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Registers `hash` as naming content at media offset `data_off`.
    pub fn dedup_record(&self, hash: u32, data_off: u64) {
        let slot = hash as usize & (DEDUP_HEUR_SIZE - 1);
        self.inner.dedup_heur[slot].store(data_off, Ordering::Relaxed);
    }

    /// Returns a hint offset whose content may match `hash`.
    pub fn dedup_lookup(&self, hash: u32) -> Option<u64> {
        let slot = hash as usize & (DEDUP_HEUR_SIZE - 1);
        match self.inner.dedup_heur[slot].load(Ordering::Relaxed) {
            0 => None,
            off => Some(off),
        }
    }

    /// Forgets any hint pointing at `data_off` and clears the validity
    /// bits of the covering frame. Called when the content at `data_off`
    /// goes stale.
    pub fn dedup_delete(&self, data_off: u64) {
        let pbase = data_off & !(PBUFSIZE as u64 - 1);
        for slot in self.inner.dedup_heur.iter() {
            // Racy compare-and-clear; a lost race leaves a stale hint that
            // the verify step on use will reject.
            if slot.load(Ordering::Relaxed) & !(PBUFSIZE as u64 - 1) == pbase {
                slot.store(0, Ordering::Relaxed);
            }
        }
        if let Some(dio) = self.inner.table.lock().get(&pbase) {
            dio.dedup_valid.store(0, Ordering::Release);
        }
    }
}

impl DioCacheInner {
    fn write_frame(&self, dio: &Dio) -> Result<()> {
        let data = dio.data.read();
        let result = self.dev.write_at(dio.pbase, &data[..]);
        match result {
            Ok(()) => {
                dio.dirty.store(0, Ordering::Release);
                Ok(())
            }
            Err(error) => {
                dio.record_error(error);
                Err(error)
            }
        }
    }

    fn release(&self, dio: &Arc<Dio>) {
        if dio.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last handle. A dirty frame is written out (the delayed-write
        // discipline); a clean one goes onto the LRU unless wired.
        if dio.is_dirty() {
            let _ = self.write_frame(dio);
        }
        if dio.wire.load(Ordering::Acquire) > 0 {
            return;
        }
        let mut lru = self.lru.lock();
        lru.push_back(Arc::clone(dio));
        while lru.len() > DIO_LRU_LIMIT {
            if let Some(victim) = lru.pop_front() {
                if victim.refs.load(Ordering::Acquire) == 0
                    && victim.wire.load(Ordering::Acquire) == 0
                {
                    self.table.lock().remove(&victim.pbase);
                }
            }
        }
    }
}

impl Clone for DioRef {
    fn clone(&self) -> DioRef {
        self.dio.refs.fetch_add(1, Ordering::AcqRel);
        DioRef {
            dio: Arc::clone(&self.dio),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Drop for DioRef {
    fn drop(&mut self) {
        self.cache.release(&self.dio);
    }
}

impl DioRef {
    pub fn pbase(&self) -> u64 {
        self.dio.pbase
    }

    pub fn error(&self) -> ErrorSet {
        self.dio.error()
    }

    pub fn handle(&self) -> &Arc<Dio> {
        &self.dio
    }

    fn range(&self, off: u64, len: usize) -> (usize, usize) {
        debug_assert!(off >= self.dio.pbase);
        let inner = (off - self.dio.pbase) as usize;
        debug_assert!(inner + len <= PBUFSIZE);
        (inner, inner + len)
    }

    /// Reads `buf.len()` bytes at media offset `off` out of the frame.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) {
        let (beg, end) = self.range(off, buf.len());
        let data = self.dio.data.read();
        buf.copy_from_slice(&data[beg..end]);
    }

    /// Runs `f` over the sub-block at `off` without copying.
    pub fn with_data<R>(&self, off: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let (beg, end) = self.range(off, len);
        let data = self.dio.data.read();
        f(&data[beg..end])
    }

    /// Writes into the sub-block at `off` and marks the frame dirty.
    pub fn write_at(&self, off: u64, buf: &[u8]) {
        let (beg, end) = self.range(off, buf.len());
        {
            let mut data = self.dio.data.write();
            data[beg..end].copy_from_slice(buf);
        }
        self.set_dirty();
    }

    /// Runs `f` over the mutable sub-block at `off`, marking dirty.
    pub fn modify_data<R>(&self, off: u64, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let (beg, end) = self.range(off, len);
        let result = {
            let mut data = self.dio.data.write();
            f(&mut data[beg..end])
        };
        self.set_dirty();
        result
    }

    pub fn set_dirty(&self) {
        self.dio.dirty.store(1, Ordering::Release);
    }

    /// Drops cached content claims for `[off, off+len)`: zeroes the range
    /// and clears its dedup validity bits.
    pub fn invalidate(&self, off: u64, len: usize) {
        let (beg, end) = self.range(off, len);
        {
            let mut data = self.dio.data.write();
            data[beg..end].fill(0);
        }
        let first = beg / (PBUFSIZE / 64);
        let last = (end - 1) / (PBUFSIZE / 64);
        let mut mask = 0u64;
        for bit in first..=last {
            mask |= 1u64 << bit;
        }
        self.dio.dedup_valid.fetch_and(!mask, Ordering::AcqRel);
        self.set_dirty();
    }

    /// Marks `[off, off+len)` as having dedup-known content and returns
    /// the content hash used for the registration.
    pub fn dedup_set(&self, off: u64, len: usize) -> u32 {
        let (beg, end) = self.range(off, len);
        let hash = {
            let data = self.dio.data.read();
            check::crc32(&data[beg..end])
        };
        let first = beg / (PBUFSIZE / 64);
        let last = (end - 1) / (PBUFSIZE / 64);
        let mut mask = 0u64;
        for bit in first..=last {
            mask |= 1u64 << bit;
        }
        self.dio.dedup_valid.fetch_or(mask, Ordering::AcqRel);
        hash
    }

    /// Synchronous write of the whole frame.
    pub fn bwrite(&self) -> Result<()> {
        self.cache.write_frame(&self.dio)
    }

    /// Asynchronous write. The engine treats the write as issued; errors
    /// surface through the sticky handle error.
    pub fn bawrite(&self) {
        let _ = self.cache.write_frame(&self.dio);
    }

    /// Delayed write: dirty the frame and let release or the next flush
    /// push it out.
    pub fn bdwrite(&self) {
        self.set_dirty();
    }

    /// Requeue without write intent.
    pub fn bqrelse(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache(size: u64) -> (Arc<MemDevice>, DioCache) {
        let dev = Arc::new(MemDevice::new(size));
        let cache = DioCache::new(dev.clone() as Arc<dyn Device>);
        (dev, cache)
    }

    #[test]
    fn handles_share_one_frame() {
        let (_dev, cache) = cache(1 << 24);
        let a = cache.get(0x10000, DioOp::WriteNz).unwrap();
        let b = cache.get(0x10400, DioOp::Read).unwrap();
        assert_eq!(a.pbase(), b.pbase());
        a.write_at(0x10400, b"marker");
        let mut back = [0u8; 6];
        b.read_at(0x10400, &mut back);
        assert_eq!(&back, b"marker");
    }

    #[test]
    fn dirty_release_reaches_device() {
        let (dev, cache) = cache(1 << 24);
        {
            let h = cache.get(0x20000, DioOp::WriteNew).unwrap();
            h.write_at(0x20000, b"persist");
        }
        let mut back = [0u8; 7];
        dev.read_at(0x20000, &mut back).unwrap();
        assert_eq!(&back, b"persist");
    }

    #[test]
    fn read_miss_pulls_device_content(){
        let (dev, cache) = cache(1 << 24);
        dev.write_at(0x30000, b"ondisk").unwrap();
        let h = cache.get(0x30000, DioOp::Read).unwrap();
        let mut back = [0u8; 6];
        h.read_at(0x30000, &mut back);
        assert_eq!(&back, b"ondisk");
    }

    #[test]
    fn io_error_is_sticky() {
        let (dev, cache) = cache(1 << 24);
        dev.set_fail_writes(true);
        let h = cache.get(0x40000, DioOp::WriteNew).unwrap();
        h.write_at(0x40000, b"x");
        assert!(h.bwrite().is_err());
        assert!(h.error().contains(ErrorSet::EIO));
        dev.set_fail_writes(false);
        // Error remains recorded on the cached handle.
        assert!(h.error().contains(ErrorSet::EIO));
    }

    #[test]
    fn dedup_register_and_invalidate() {
        let (_dev, cache) = cache(1 << 24);
        let h = cache.get(0x50000, DioOp::WriteNew).unwrap();
        h.write_at(0x50000, &[7u8; 4096]);
        let hash = h.dedup_set(0x50000, 4096);
        cache.dedup_record(hash, 0x50000);
        assert_eq!(cache.dedup_lookup(hash), Some(0x50000));
        cache.dedup_delete(0x50000);
        assert_eq!(cache.dedup_lookup(hash), None);
    }

    #[test]
    fn drain_writes_dirty_frames() {
        let (dev, cache) = cache(1 << 24);
        let h = cache.get(0x70000, DioOp::WriteNew).unwrap();
        h.write_at(0x70000, b"drained");
        cache.drain().unwrap();
        let mut back = [0u8; 7];
        dev.read_at(0x70000, &mut back).unwrap();
        assert_eq!(&back, b"drained");
        drop(h);
    }

    #[test]
    fn invalidate_zeroes_tail() {
        let (_dev, cache) = cache(1 << 24);
        let h = cache.get(0x60000, DioOp::WriteNew).unwrap();
        h.write_at(0x60000, &[0xff; 8192]);
        h.invalidate(0x61000, 4096);
        h.with_data(0x61000, 4096, |d| assert!(d.iter().all(|b| *b == 0)));
        h.with_data(0x60000, 4096, |d| assert!(d.iter().all(|b| *b == 0xff)));
    }
}
